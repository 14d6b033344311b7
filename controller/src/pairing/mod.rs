//! Commissioning-window lifecycle and pairing-code generation (spec §6,
//! Scenario 6). The PASE/CASE key-establishment handshake itself is out of
//! scope (spec §2 Non-goals); this module only mints the random credentials,
//! renders them into manual/QR pairing codes, and drives the
//! `AdministratorCommissioning` cluster's open/revoke commands.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::collab::{Crypto, InteractionClient};
use crate::error::{ControllerError, Result};

pub const MIN_ITERATIONS: u32 = 1000;
pub const MAX_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 32;
const PASSCODE_MIN: u32 = 1;
const PASSCODE_MAX: u32 = 99_999_999;

/// `AdministratorCommissioning` cluster (Matter core spec 0x003C) and its
/// two commands.
const ADMINISTRATOR_COMMISSIONING_CLUSTER: u32 = 0x003C;
const CMD_OPEN_ENHANCED_COMMISSIONING_WINDOW: u32 = 0x0001;
const CMD_REVOKE_COMMISSIONING: u32 = 0x0002;
const ROOT_ENDPOINT: u16 = 0;

/// Passcodes the Matter spec calls out as trivially guessable and therefore
/// disallowed (spec §6: "excluding known-weak values").
const WEAK_PASSCODES: &[u32] = &[
    0, 11_111_111, 22_222_222, 33_333_333, 44_444_444, 55_555_555, 66_666_666, 77_777_777, 88_888_888,
    99_999_999, 12_345_678, 87_654_321,
];

#[derive(Debug, Clone)]
pub struct CommissioningCredentials {
    /// 12-bit discriminator.
    pub discriminator: u16,
    /// 8-digit setup passcode.
    pub passcode: u32,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

fn is_weak_passcode(candidate: u32) -> bool {
    WEAK_PASSCODES.contains(&candidate)
}

/// Mint a fresh discriminator, passcode, salt, and iteration count (spec
/// §6: "Passcode: 8-digit random excluding known-weak values. Discriminator:
/// 12-bit random. Salt: 32 random bytes. Iterations: 1000 (valid range
/// 1000–100000)").
pub fn generate_credentials(crypto: &dyn Crypto, iterations: u32) -> Result<CommissioningCredentials> {
    if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations) {
        return Err(ControllerError::Constraint(format!(
            "iteration count {iterations} outside {MIN_ITERATIONS}..={MAX_ITERATIONS}"
        )));
    }
    let discriminator = crypto.random_u32_below(1 << 12) as u16;
    let passcode = loop {
        let candidate = PASSCODE_MIN + crypto.random_u32_below(PASSCODE_MAX - PASSCODE_MIN + 1);
        if !is_weak_passcode(candidate) {
            break candidate;
        }
    };
    Ok(CommissioningCredentials {
        discriminator,
        passcode,
        salt: crypto.random_bytes(SALT_LEN),
        iterations,
    })
}

// --- Verhoeff check digit (used by the 11-digit manual pairing code) ---

const VERHOEFF_D: [[u8; 10]; 10] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 2, 3, 4, 0, 6, 7, 8, 9, 5],
    [2, 3, 4, 0, 1, 7, 8, 9, 5, 6],
    [3, 4, 0, 1, 2, 8, 9, 5, 6, 7],
    [4, 0, 1, 2, 3, 9, 5, 6, 7, 8],
    [5, 9, 8, 7, 6, 0, 4, 3, 2, 1],
    [6, 5, 9, 8, 7, 1, 0, 4, 3, 2],
    [7, 6, 5, 9, 8, 2, 1, 0, 4, 3],
    [8, 7, 6, 5, 9, 3, 2, 1, 0, 4],
    [9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
];
const VERHOEFF_P: [[u8; 10]; 8] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
    [1, 5, 7, 6, 2, 8, 3, 0, 9, 4],
    [5, 8, 0, 3, 7, 9, 6, 1, 4, 2],
    [8, 9, 1, 6, 0, 4, 3, 5, 2, 7],
    [9, 4, 5, 3, 1, 2, 6, 8, 7, 0],
    [4, 2, 8, 6, 5, 7, 3, 9, 0, 1],
    [2, 7, 9, 3, 8, 0, 6, 4, 1, 5],
    [7, 0, 4, 6, 9, 1, 3, 2, 5, 8],
];
const VERHOEFF_INV: [u8; 10] = [0, 4, 3, 2, 1, 5, 6, 7, 8, 9];

fn verhoeff_check_digit(digits: &str) -> u8 {
    let mut c: usize = 0;
    for (i, ch) in digits.chars().rev().enumerate() {
        let digit = ch.to_digit(10).unwrap() as usize;
        c = VERHOEFF_D[c][VERHOEFF_P[(i + 1) % 8][digit] as usize] as usize;
    }
    VERHOEFF_INV[c]
}

fn verhoeff_validate(digits_with_check: &str) -> bool {
    let mut c: usize = 0;
    for (i, ch) in digits_with_check.chars().rev().enumerate() {
        let Some(digit) = ch.to_digit(10) else {
            return false;
        };
        c = VERHOEFF_D[c][VERHOEFF_P[i % 8][digit as usize] as usize] as usize;
    }
    c == 0
}

/// 11-digit manual pairing code (spec §6): the device's short (4-bit)
/// discriminator packed with the 8-digit passcode, plus a Verhoeff check
/// digit.
pub fn manual_pairing_code(discriminator: u16, passcode: u32) -> String {
    let short_discriminator = ((discriminator >> 8) & 0x0F) as u64;
    let payload = short_discriminator * 100_000_000 + passcode as u64;
    let digits = format!("{payload:010}");
    let check = verhoeff_check_digit(&digits);
    format!("{digits}{check}")
}

pub fn verify_manual_pairing_code(code: &str) -> bool {
    code.len() == 11 && verhoeff_validate(code)
}

// --- QR pairing code: base38 encoding of the onboarding payload ---

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryCapabilities {
    pub on_ip_network: bool,
}

struct BitWriter {
    value: u128,
    bits: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self { value: 0, bits: 0 }
    }

    fn push(&mut self, v: u64, n: u32) {
        self.value |= (v as u128 & ((1u128 << n) - 1)) << self.bits;
        self.bits += n;
    }

    fn into_bytes(self) -> Vec<u8> {
        let byte_len = (self.bits as usize).div_ceil(8);
        (0..byte_len).map(|i| ((self.value >> (i * 8)) & 0xFF) as u8).collect()
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: u32,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: u32) -> u64 {
        let mut value = 0u128;
        for i in 0..n {
            let bit_index = self.pos + i;
            let byte = self.bytes.get((bit_index / 8) as usize).copied().unwrap_or(0);
            let bit = (byte >> (bit_index % 8)) & 1;
            value |= (bit as u128) << i;
        }
        self.pos += n;
        value as u64
    }
}

const BASE38_ALPHABET: &[u8; 38] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ-.";

fn base38_encode(bytes: &[u8]) -> String {
    let mut out = String::new();
    for chunk in bytes.chunks(3) {
        let (mut value, char_count) = match chunk.len() {
            3 => (chunk[0] as u32 | (chunk[1] as u32) << 8 | (chunk[2] as u32) << 16, 5),
            2 => (chunk[0] as u32 | (chunk[1] as u32) << 8, 4),
            1 => (chunk[0] as u32, 2),
            _ => unreachable!(),
        };
        for _ in 0..char_count {
            out.push(BASE38_ALPHABET[(value % 38) as usize] as char);
            value /= 38;
        }
    }
    out
}

fn base38_char_value(c: u8) -> Option<u32> {
    BASE38_ALPHABET.iter().position(|&b| b == c).map(|p| p as u32)
}

fn base38_decode(s: &str) -> Option<Vec<u8>> {
    let chars: Vec<u8> = s.bytes().collect();
    let mut out = Vec::new();
    for group in chars.chunks(5) {
        let byte_count = match group.len() {
            5 => 3,
            4 => 2,
            2 => 1,
            _ => return None,
        };
        let mut value: u32 = 0;
        for &c in group.iter().rev() {
            value = value * 38 + base38_char_value(c)?;
        }
        for i in 0..byte_count {
            out.push(((value >> (i * 8)) & 0xFF) as u8);
        }
    }
    Some(out)
}

/// QR pairing payload: `{version, vendor_id, product_id, flow_type, discovery_capabilities, discriminator, passcode}`,
/// base38-encoded and prefixed `MT:` (spec §6).
pub fn qr_pairing_code(
    vendor_id: u16,
    product_id: u16,
    discriminator: u16,
    passcode: u32,
    capabilities: DiscoveryCapabilities,
) -> String {
    let mut bits = BitWriter::new();
    bits.push(0, 3); // version
    bits.push(vendor_id as u64, 16);
    bits.push(product_id as u64, 16);
    bits.push(0, 2); // flow_type = Standard
    bits.push(if capabilities.on_ip_network { 1 } else { 0 }, 8);
    bits.push((discriminator & 0x0FFF) as u64, 12);
    bits.push((passcode as u64) & 0x07FF_FFFF, 27);
    bits.push(0, 4); // reserved, pads to a byte boundary
    format!("MT:{}", base38_encode(&bits.into_bytes()))
}

/// Decode a QR pairing code back into its fields. Used by tests to verify
/// the encoder round-trips; also available for a commissioner reading a
/// peer-generated code back.
pub fn parse_qr_pairing_code(
    code: &str,
) -> Option<(u16, u16, u16, u32, DiscoveryCapabilities)> {
    let payload = code.strip_prefix("MT:")?;
    let bytes = base38_decode(payload)?;
    let mut reader = BitReader::new(&bytes);
    let _version = reader.take(3);
    let vendor_id = reader.take(16) as u16;
    let product_id = reader.take(16) as u16;
    let _flow_type = reader.take(2);
    let cap_bits = reader.take(8);
    let discriminator = reader.take(12) as u16;
    let passcode = reader.take(27) as u32;
    Some((
        vendor_id,
        product_id,
        discriminator,
        passcode,
        DiscoveryCapabilities {
            on_ip_network: cap_bits & 1 != 0,
        },
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCodes {
    pub manual_pairing_code: String,
    pub qr_pairing_code: String,
}

/// Tracks local belief about whether a commissioning window is currently
/// open on the device (spec Scenario 6).
pub struct PairingManager {
    window_open: AtomicBool,
}

impl Default for PairingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingManager {
    pub fn new() -> Self {
        Self {
            window_open: AtomicBool::new(false),
        }
    }

    pub fn is_window_open(&self) -> bool {
        self.window_open.load(Ordering::SeqCst)
    }

    /// `open_enhanced_commissioning_window(timeout)` (spec §6, Scenario 6).
    /// If a window is already believed open, revoke it first; a
    /// `WindowNotOpen` failure on that revoke is swallowed since it just
    /// means our local belief was stale, but any other revoke error
    /// surfaces.
    pub async fn open_enhanced_commissioning_window(
        &self,
        client: &dyn InteractionClient,
        crypto: &dyn Crypto,
        vendor_id: u16,
        product_id: u16,
        timeout_secs: u32,
        iterations: u32,
    ) -> Result<PairingCodes> {
        if self.window_open.load(Ordering::SeqCst) {
            match client
                .invoke(ROOT_ENDPOINT, ADMINISTRATOR_COMMISSIONING_CLUSTER, CMD_REVOKE_COMMISSIONING, serde_json::json!({}))
                .await
            {
                Ok(_) => {}
                Err(ControllerError::Constraint(msg)) if msg.contains("WindowNotOpen") => {
                    debug!("revoke found no window open; local belief was stale");
                }
                Err(e) => return Err(e),
            }
            self.window_open.store(false, Ordering::SeqCst);
        }

        let credentials = generate_credentials(crypto, iterations)?;
        let payload = serde_json::json!({
            "commissioningTimeout": timeout_secs,
            "discriminator": credentials.discriminator,
            "iterations": credentials.iterations,
            "salt": credentials.salt,
        });
        client
            .invoke(
                ROOT_ENDPOINT,
                ADMINISTRATOR_COMMISSIONING_CLUSTER,
                CMD_OPEN_ENHANCED_COMMISSIONING_WINDOW,
                payload,
            )
            .await?;
        self.window_open.store(true, Ordering::SeqCst);

        Ok(PairingCodes {
            manual_pairing_code: manual_pairing_code(credentials.discriminator, credentials.passcode),
            qr_pairing_code: qr_pairing_code(
                vendor_id,
                product_id,
                credentials.discriminator,
                credentials.passcode,
                DiscoveryCapabilities { on_ip_network: true },
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    struct SequenceCrypto {
        u32_sequence: Mutex<Vec<u32>>,
        bytes_len_seen: AtomicU32,
    }

    impl Crypto for SequenceCrypto {
        fn random_bytes(&self, len: usize) -> Vec<u8> {
            self.bytes_len_seen.store(len as u32, AtomicOrdering::SeqCst);
            vec![0xAB; len]
        }

        fn random_u32_below(&self, bound: u32) -> u32 {
            let mut seq = self.u32_sequence.lock().unwrap();
            let next = if seq.is_empty() { 0 } else { seq.remove(0) };
            next % bound.max(1)
        }
    }

    #[test]
    fn generate_credentials_rejects_iterations_outside_range() {
        let crypto = SequenceCrypto {
            u32_sequence: Mutex::new(vec![100, 42]),
            bytes_len_seen: AtomicU32::new(0),
        };
        assert!(generate_credentials(&crypto, 999).is_err());
        assert!(generate_credentials(&crypto, 100_001).is_err());
        assert!(generate_credentials(&crypto, 1000).is_ok());
    }

    #[test]
    fn generate_credentials_retries_past_weak_passcodes() {
        // First draw lands exactly on the weak value 11_111_111 (offset
        // 11_111_110 from PASSCODE_MIN); the retry must skip it.
        let crypto = SequenceCrypto {
            u32_sequence: Mutex::new(vec![7, 11_111_110, 42]),
            bytes_len_seen: AtomicU32::new(0),
        };
        let creds = generate_credentials(&crypto, 1000).unwrap();
        assert_ne!(creds.passcode, 11_111_111);
        assert_eq!(creds.passcode, 43); // second retry offset (42) + PASSCODE_MIN
        assert_eq!(creds.salt.len(), SALT_LEN);
    }

    #[test]
    fn manual_pairing_code_is_eleven_digits_and_passes_verhoeff() {
        let code = manual_pairing_code(0x0F23, 20_202_021);
        assert_eq!(code.len(), 11);
        assert!(verify_manual_pairing_code(&code));
    }

    #[test]
    fn manual_pairing_code_corruption_fails_verification() {
        let mut code = manual_pairing_code(0x0F23, 20_202_021).into_bytes();
        code[0] = if code[0] == b'9' { b'0' } else { code[0] + 1 };
        let corrupted = String::from_utf8(code).unwrap();
        assert!(!verify_manual_pairing_code(&corrupted));
    }

    #[test]
    fn qr_pairing_code_round_trips_fields() {
        let code = qr_pairing_code(0x1234, 0x5678, 0x0ABC, 34_567_890, DiscoveryCapabilities { on_ip_network: true });
        assert!(code.starts_with("MT:"));
        let (vendor_id, product_id, discriminator, passcode, caps) = parse_qr_pairing_code(&code).unwrap();
        assert_eq!(vendor_id, 0x1234);
        assert_eq!(product_id, 0x5678);
        assert_eq!(discriminator, 0x0ABC);
        assert_eq!(passcode, 34_567_890);
        assert!(caps.on_ip_network);
    }

    struct FakeAdminClient {
        revoke_error: Mutex<Option<ControllerError>>,
        open_calls: AtomicU32,
        revoke_calls: AtomicU32,
    }

    #[async_trait]
    impl InteractionClient for FakeAdminClient {
        async fn read_all(&self, _filters: &[crate::collab::DataVersionFilter]) -> Result<crate::collab::ReadResponse> {
            unimplemented!()
        }
        async fn subscribe_all(
            &self,
            _params: crate::collab::SubscribeParams,
            _filters: &[crate::collab::DataVersionFilter],
            _handler: crate::collab::SubscriptionHandler,
        ) -> Result<crate::collab::SubscribeResponse> {
            unimplemented!()
        }
        async fn invoke(
            &self,
            _endpoint: u16,
            cluster_id: u32,
            command_id: u32,
            _payload: serde_json::Value,
        ) -> Result<serde_json::Value> {
            assert_eq!(cluster_id, ADMINISTRATOR_COMMISSIONING_CLUSTER);
            if command_id == CMD_REVOKE_COMMISSIONING {
                self.revoke_calls.fetch_add(1, AtomicOrdering::SeqCst);
                if let Some(err) = self.revoke_error.lock().unwrap().take() {
                    return Err(err);
                }
            } else {
                self.open_calls.fetch_add(1, AtomicOrdering::SeqCst);
            }
            Ok(serde_json::Value::Null)
        }
        async fn write(
            &self,
            _endpoint: u16,
            _cluster_id: u32,
            _attribute_id: u32,
            _value: serde_json::Value,
        ) -> Result<()> {
            unimplemented!()
        }
    }

    fn crypto() -> SequenceCrypto {
        SequenceCrypto {
            u32_sequence: Mutex::new(Vec::new()),
            bytes_len_seen: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn first_open_does_not_revoke() {
        let client = FakeAdminClient {
            revoke_error: Mutex::new(None),
            open_calls: AtomicU32::new(0),
            revoke_calls: AtomicU32::new(0),
        };
        let manager = PairingManager::new();
        let codes = manager
            .open_enhanced_commissioning_window(&client, &crypto(), 1, 2, 600, 1000)
            .await
            .unwrap();
        assert_eq!(client.revoke_calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(client.open_calls.load(AtomicOrdering::SeqCst), 1);
        assert!(manager.is_window_open());
        assert!(!codes.manual_pairing_code.is_empty());
    }

    #[tokio::test]
    async fn reopen_absorbs_window_not_open_revoke_failure() {
        let client = FakeAdminClient {
            revoke_error: Mutex::new(Some(ControllerError::Constraint("WindowNotOpen".to_string()))),
            open_calls: AtomicU32::new(0),
            revoke_calls: AtomicU32::new(0),
        };
        let manager = PairingManager::new();
        manager.window_open.store(true, AtomicOrdering::SeqCst);

        let result = manager
            .open_enhanced_commissioning_window(&client, &crypto(), 1, 2, 600, 1000)
            .await;
        assert!(result.is_ok());
        assert_eq!(client.revoke_calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reopen_surfaces_non_window_not_open_revoke_failure() {
        let client = FakeAdminClient {
            revoke_error: Mutex::new(Some(ControllerError::Transient("busy".to_string()))),
            open_calls: AtomicU32::new(0),
            revoke_calls: AtomicU32::new(0),
        };
        let manager = PairingManager::new();
        manager.window_open.store(true, AtomicOrdering::SeqCst);

        let err = manager
            .open_enhanced_commissioning_window(&client, &crypto(), 1, 2, 600, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Transient(_)));
        assert_eq!(client.open_calls.load(AtomicOrdering::SeqCst), 0, "open must not run after a surfaced revoke error");
    }
}
