//! External collaborator contracts (spec §1): everything the controller core
//! consumes but does not implement. Production wiring (real exchange
//! transport, real mDNS socket, real persistent store) lives outside this
//! crate; `controller-cli` and the test suite supply concrete or mock
//! implementations of these traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Stable fabric-scoped node identifier. Immutable (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub fabric_id: u64,
    pub node_id: u64,
}

impl PeerAddress {
    pub fn new(fabric_id: u64, node_id: u64) -> Self {
        Self { fabric_id, node_id }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}-{:016x}", self.fabric_id, self.node_id)
    }
}

/// A data-version filter seeded from cache so an initial read only returns
/// clusters that actually changed (spec §4.F).
#[derive(Debug, Clone, Copy)]
pub struct DataVersionFilter {
    pub endpoint: u16,
    pub cluster_id: u32,
    pub data_version: u32,
}

/// One attribute report as defined by spec §6's report contract.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeReport {
    pub endpoint: u16,
    pub cluster_id: u32,
    pub attribute_id: u32,
    pub value: serde_json::Value,
    pub data_version: u32,
}

/// One event report as defined by spec §6's report contract.
#[derive(Debug, Clone, PartialEq)]
pub struct EventReport {
    pub endpoint: u16,
    pub cluster_id: u32,
    pub event_id: u32,
    pub data: serde_json::Value,
    pub event_number: u64,
}

/// Parameters for `subscribe_all` (spec §4.F).
#[derive(Debug, Clone, Copy)]
pub struct SubscribeParams {
    pub min_interval_secs: u32,
    pub max_interval_secs: u32,
}

/// Result of a successful `read_all`.
#[derive(Debug, Clone)]
pub struct ReadResponse {
    pub attributes: Vec<AttributeReport>,
}

/// Result of a successful `subscribe_all` (spec §4.F: `{ max_interval,
/// initial_report }`).
#[derive(Debug, Clone)]
pub struct SubscribeResponse {
    pub max_interval_secs: u32,
    pub initial_report: Vec<AttributeReport>,
}

/// Update pushed by the live subscription after the initial report.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    Attribute(AttributeReport),
    Event(EventReport),
    /// The subscription's liveness heartbeat ("ReportDataMessage with no
    /// content" in the Matter wire protocol) arrived in time.
    Alive,
    /// No heartbeat arrived within the negotiated max-interval.
    Timeout,
}

/// At-most-one-active-handler sink for subscription callbacks (spec §3
/// "Subscription Handler", §4.F). Cloned cheaply; every clone shares the
/// same liveness flag, so invalidating one invalidates all.
#[derive(Clone)]
pub struct SubscriptionHandler {
    active: std::sync::Arc<std::sync::atomic::AtomicBool>,
    tx: tokio::sync::mpsc::UnboundedSender<SubscriptionUpdate>,
}

impl SubscriptionHandler {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<SubscriptionUpdate>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                active: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)),
                tx,
            },
            rx,
        )
    }

    /// Forward an update if this handler hasn't been replaced. Returns
    /// whether the update was accepted (used by tests asserting P3).
    pub fn push(&self, update: SubscriptionUpdate) -> bool {
        if !self.active.load(std::sync::atomic::Ordering::SeqCst) {
            return false;
        }
        self.tx.send(update).is_ok()
    }

    /// Swap this handler's callbacks to no-ops. Any inflight `push` that
    /// already passed the liveness check is allowed to drain; every call
    /// after this point is dropped.
    pub fn invalidate(&self) {
        self.active.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Reliable exchange client for attribute/event read, write, subscribe, and
/// invoke requests (spec §1, "Interaction Client").
#[async_trait]
pub trait InteractionClient: Send + Sync {
    async fn read_all(&self, filters: &[DataVersionFilter]) -> Result<ReadResponse>;

    async fn subscribe_all(
        &self,
        params: SubscribeParams,
        filters: &[DataVersionFilter],
        handler: SubscriptionHandler,
    ) -> Result<SubscribeResponse>;

    async fn invoke(
        &self,
        endpoint: u16,
        cluster_id: u32,
        command_id: u32,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value>;

    async fn write(
        &self,
        endpoint: u16,
        cluster_id: u32,
        attribute_id: u32,
        value: serde_json::Value,
    ) -> Result<()>;
}

/// Resolves peer addresses to exchange channels and constructs
/// [`InteractionClient`]s (spec §1, "Peer Set").
#[async_trait]
pub trait PeerSet: Send + Sync {
    /// Build a fresh interaction client for the given peer over its current
    /// operational address(es). Re-created on every reconnect (spec §5).
    async fn connect(&self, peer: PeerAddress) -> Result<std::sync::Arc<dyn InteractionClient>>;
}

/// Sends and receives multicast DNS messages (spec §1, "mDNS Socket").
#[async_trait]
pub trait MdnsSocket: Send + Sync {
    async fn send_multicast(&self, packet: &[u8], ipv6: bool) -> Result<()>;
    /// Blocks until a packet arrives; returns its bytes and the interface it
    /// arrived on.
    async fn recv(&self) -> Result<(Vec<u8>, InterfaceId)>;
}

/// A network interface identifier, used to scope link-local addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceId(pub u32);

/// Persists cached attribute values and discovered-device records (spec §1,
/// "Persistent Store").
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load_attributes(&self, peer: PeerAddress) -> Result<Vec<AttributeReport>>;
    async fn save_attributes(&self, peer: PeerAddress, reports: &[AttributeReport]) -> Result<()>;
    async fn load_device_metadata(&self, peer: PeerAddress) -> Result<Option<DeviceMetadata>>;
    async fn save_device_metadata(&self, peer: PeerAddress, metadata: &DeviceMetadata) -> Result<()>;
}

/// Device metadata cached per node: session intervals, ICD flag, and the
/// TCP-capability bit (spec §3, "Operational Device Record").
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Session-idle interval, milliseconds.
    pub sii_ms: Option<u32>,
    /// Session-active interval, milliseconds.
    pub sai_ms: Option<u32>,
    /// Active threshold, milliseconds.
    pub sat_ms: Option<u32>,
    /// TCP support flags.
    pub tcp_supported: bool,
    /// Intermittently-connected device.
    pub icd: bool,
}

/// Random bytes and key derivation for commissioning-window operations
/// (spec §1, "Crypto"; spec §6 pairing-code outputs).
pub trait Crypto: Send + Sync {
    fn random_bytes(&self, len: usize) -> Vec<u8>;
    fn random_u32_below(&self, bound: u32) -> u32;
}

/// Default [`Crypto`] implementation backed by the `rand` crate. Acceptable
/// as ambient infrastructure; the spec excludes PASE/CASE key establishment
/// itself, not the generation of random passcodes/discriminators/salts.
pub struct OsCrypto;

impl Crypto for OsCrypto {
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        use rand::RngCore;
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    fn random_u32_below(&self, bound: u32) -> u32 {
        use rand::Rng;
        rand::thread_rng().gen_range(0..bound)
    }
}

pub fn interface_loopback() -> InterfaceId {
    InterfaceId(0)
}

pub type SharedInteractionClient = std::sync::Arc<dyn InteractionClient>;
pub type SharedPeerSet = std::sync::Arc<dyn PeerSet>;
pub type SharedMdnsSocket = std::sync::Arc<dyn MdnsSocket>;
pub type SharedPersistentStore = std::sync::Arc<dyn PersistentStore>;
pub type SharedCrypto = std::sync::Arc<dyn Crypto>;
