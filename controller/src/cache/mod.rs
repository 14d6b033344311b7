//! Component A — Record Cache.
//!
//! TTL-indexed store of DNS answers, operational and commissionable device
//! records, and per-interface IP tables (spec §4.A). Owned by a single
//! [`crate::mdns::MdnsEngine`]; never shared across tasks, so plain
//! `HashMap`s are enough — no locking.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::collab::{DeviceMetadata, InterfaceId};

/// One resolved address, still carrying the interface it was seen on so
/// link-local addresses can be scoped correctly (spec §3 "Address Map").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub ip: IpAddr,
    pub interface: InterfaceId,
}

impl std::fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if is_link_local_v6(&self.ip) {
            write!(f, "{}%{}", self.ip, self.interface.0)
        } else {
            write!(f, "{}", self.ip)
        }
    }
}

fn is_link_local_v6(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if (v6.segments()[0] & 0xffc0) == 0xfe80)
}

fn is_ula_v6(ip: &IpAddr) -> bool {
    matches!(ip, IpAddr::V6(v6) if (v6.segments()[0] & 0xfe00) == 0xfc00)
}

/// Rank used to implement spec Property P2's address preference order:
/// link-local IPv6 > ULA IPv6 > other IPv6 > IPv4.
fn address_rank(ip: &IpAddr) -> u8 {
    if is_link_local_v6(ip) {
        0
    } else if is_ula_v6(ip) {
        1
    } else if ip.is_ipv6() {
        2
    } else {
        3
    }
}

/// Sort addresses per spec Property P2. Stable within a rank.
pub fn sort_addresses(addrs: &mut [ResolvedAddress]) {
    addrs.sort_by_key(|a| address_rank(&a.ip));
}

#[derive(Debug, Clone)]
struct AddressEntry {
    ttl_secs: u32,
    discovered_at_ms: u64,
}

/// An already-commissioned node advertising on `_matter._tcp.local` (spec §3).
#[derive(Debug, Clone, Default)]
pub struct OperationalDeviceRecord {
    pub service_name: String,
    pub target_hostname: Option<String>,
    pub port: Option<u16>,
    pub metadata: DeviceMetadata,
    pub pairing_hint: Option<u16>,
    meta_ttl_secs: u32,
    meta_discovered_at_ms: u64,
}

/// An un-paired device advertising on `_matterc._udp.local` (spec §3).
#[derive(Debug, Clone, Default)]
pub struct CommissionableDeviceRecord {
    pub instance_name: String,
    pub target_hostname: Option<String>,
    pub port: Option<u16>,
    pub long_discriminator: Option<u16>,
    pub short_discriminator: Option<u8>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub device_type: Option<u32>,
    pub commissioning_mode: Option<u8>,
    pub friendly_name: Option<String>,
    pub rotating_id: Option<String>,
    pub pairing_hint: Option<u16>,
    meta_ttl_secs: u32,
    meta_discovered_at_ms: u64,
}

pub struct RecordCache {
    ttl_grace_factor: f64,
    operational: HashMap<String, OperationalDeviceRecord>,
    commissionable: HashMap<String, CommissionableDeviceRecord>,
    /// hostname -> (interface, ip) -> ttl entry.
    addresses: HashMap<String, HashMap<(InterfaceId, IpAddr), AddressEntry>>,
}

impl RecordCache {
    pub fn new(ttl_grace_factor: f64) -> Self {
        Self {
            ttl_grace_factor,
            operational: HashMap::new(),
            commissionable: HashMap::new(),
            addresses: HashMap::new(),
        }
    }

    /// Insert or refresh an A/AAAA answer. `ttl_secs == 0` removes the exact
    /// `(hostname, ip)` tuple immediately, never widening (spec invariant).
    pub fn insert_address(
        &mut self,
        hostname: &str,
        ip: IpAddr,
        interface: InterfaceId,
        ttl_secs: u32,
        now_ms: u64,
    ) {
        let entries = self.addresses.entry(hostname.to_string()).or_default();
        if ttl_secs == 0 {
            entries.remove(&(interface, ip));
            return;
        }
        entries.insert(
            (interface, ip),
            AddressEntry {
                ttl_secs,
                discovered_at_ms: now_ms,
            },
        );
    }

    /// Insert or refresh an operational SRV record. `ttl_secs == 0` removes
    /// the record outright (spec §3 removal condition).
    pub fn upsert_operational_srv(
        &mut self,
        service_name: &str,
        target_hostname: &str,
        port: u16,
        ttl_secs: u32,
        now_ms: u64,
    ) {
        if ttl_secs == 0 {
            self.operational.remove(service_name);
            return;
        }
        let entry = self
            .operational
            .entry(service_name.to_string())
            .or_insert_with(|| OperationalDeviceRecord {
                service_name: service_name.to_string(),
                ..Default::default()
            });
        entry.target_hostname = Some(target_hostname.to_string());
        entry.port = Some(port);
        entry.meta_ttl_secs = ttl_secs;
        entry.meta_discovered_at_ms = now_ms;
    }

    /// Merge parsed TXT fields into (or create) an operational record.
    pub fn upsert_operational_txt(
        &mut self,
        service_name: &str,
        metadata: DeviceMetadata,
        pairing_hint: Option<u16>,
        ttl_secs: u32,
        now_ms: u64,
    ) {
        if ttl_secs == 0 {
            self.operational.remove(service_name);
            return;
        }
        let entry = self
            .operational
            .entry(service_name.to_string())
            .or_insert_with(|| OperationalDeviceRecord {
                service_name: service_name.to_string(),
                ..Default::default()
            });
        entry.metadata = metadata;
        entry.pairing_hint = pairing_hint;
        entry.meta_ttl_secs = ttl_secs;
        entry.meta_discovered_at_ms = now_ms;
    }

    pub fn upsert_commissionable(
        &mut self,
        instance_name: &str,
        f: impl FnOnce(&mut CommissionableDeviceRecord),
        ttl_secs: u32,
        now_ms: u64,
    ) {
        if ttl_secs == 0 {
            self.commissionable.remove(instance_name);
            return;
        }
        let entry = self
            .commissionable
            .entry(instance_name.to_string())
            .or_insert_with(|| CommissionableDeviceRecord {
                instance_name: instance_name.to_string(),
                ..Default::default()
            });
        f(entry);
        entry.meta_ttl_secs = ttl_secs;
        entry.meta_discovered_at_ms = now_ms;
    }

    pub fn find_operational(&self, service_name: &str) -> Option<&OperationalDeviceRecord> {
        self.operational.get(service_name)
    }

    pub fn find_commissionable(
        &self,
        mut predicate: impl FnMut(&CommissionableDeviceRecord) -> bool,
    ) -> Vec<&CommissionableDeviceRecord> {
        self.commissionable
            .values()
            .filter(|r| predicate(r))
            .collect()
    }

    /// All currently-live addresses for a hostname, across every interface,
    /// sorted per Property P2.
    pub fn addresses_for_hostname(&self, hostname: &str) -> Vec<ResolvedAddress> {
        let mut out: Vec<ResolvedAddress> = self
            .addresses
            .get(hostname)
            .map(|m| {
                m.keys()
                    .map(|(iface, ip)| ResolvedAddress {
                        ip: *ip,
                        interface: *iface,
                    })
                    .collect()
            })
            .unwrap_or_default();
        sort_addresses(&mut out);
        out
    }

    fn hostname_has_addresses(&self, hostname: &str) -> bool {
        self.addresses
            .get(hostname)
            .map(|m| !m.is_empty())
            .unwrap_or(false)
    }

    /// Expiry sweep (spec §4.A: runs every minute). Addresses expire on
    /// their own grace-adjusted TTL; a device record is removed only once
    /// both its TXT/SRV grace window has passed *and* its address set is
    /// empty.
    pub fn expire(&mut self, now_ms: u64) {
        let grace = self.ttl_grace_factor;
        for entries in self.addresses.values_mut() {
            entries.retain(|_, e| {
                now_ms <= e.discovered_at_ms + ((e.ttl_secs as f64) * grace * 1000.0) as u64
            });
        }
        let expired_op: Vec<String> = self
            .operational
            .values()
            .filter(|r| {
                let meta_expired = now_ms
                    >= r.meta_discovered_at_ms
                        + ((r.meta_ttl_secs as f64) * grace * 1000.0) as u64;
                let addrs_empty = r
                    .target_hostname
                    .as_deref()
                    .map(|h| !self.hostname_has_addresses(h))
                    .unwrap_or(true);
                meta_expired && addrs_empty
            })
            .map(|r| r.service_name.clone())
            .collect();
        for name in expired_op {
            self.operational.remove(&name);
        }

        let expired_comm: Vec<String> = self
            .commissionable
            .values()
            .filter(|r| {
                let meta_expired = now_ms
                    >= r.meta_discovered_at_ms
                        + ((r.meta_ttl_secs as f64) * grace * 1000.0) as u64;
                let addrs_empty = r
                    .target_hostname
                    .as_deref()
                    .map(|h| !self.hostname_has_addresses(h))
                    .unwrap_or(true);
                meta_expired && addrs_empty
            })
            .map(|r| r.instance_name.clone())
            .collect();
        for name in expired_comm {
            self.commissionable.remove(&name);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operational.is_empty() && self.commissionable.is_empty() && self.addresses.is_empty()
    }

    /// Drop every cached record. Used when the engine enters dormant mode
    /// (spec §4.D: "the engine... drops all caches").
    pub fn clear(&mut self) {
        self.operational.clear();
        self.commissionable.clear();
        self.addresses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    const IFACE: InterfaceId = InterfaceId(1);

    #[test]
    fn ttl_expiry_with_grace_period() {
        // Scenario 2 from spec §8.
        let mut cache = RecordCache::new(1.05);
        cache.upsert_operational_srv("dev._matter._tcp.local", "foo.local", 5540, 60, 0);
        cache.insert_address(
            "foo.local",
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            IFACE,
            60,
            0,
        );

        cache.expire(63_000);
        assert!(cache.find_operational("dev._matter._tcp.local").is_some());

        cache.expire(64_000); // address ttl(60s)*1.05 = 63s -> expired by 64s
        assert!(
            cache.find_operational("dev._matter._tcp.local").is_none(),
            "device should be gone once address set empties and grace window passed"
        );
    }

    #[test]
    fn shorter_ttl_respects_grace_boundary() {
        let mut cache = RecordCache::new(1.05);
        cache.upsert_operational_srv("dev._matter._tcp.local", "foo.local", 5540, 30, 0);
        cache.insert_address(
            "foo.local",
            IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)),
            IFACE,
            30,
            0,
        );

        cache.expire(30_000); // 31.5s grace -> retained
        assert!(cache.find_operational("dev._matter._tcp.local").is_some());

        cache.expire(32_000); // past 31.5s -> address gone, meta grace also passed
        assert!(cache.find_operational("dev._matter._tcp.local").is_none());
    }

    #[test]
    fn ttl_zero_removes_exact_tuple_not_wider() {
        let mut cache = RecordCache::new(1.05);
        let ip_a = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        let ip_b = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2));
        cache.insert_address("foo.local", ip_a, IFACE, 60, 0);
        cache.insert_address("foo.local", ip_b, IFACE, 60, 0);

        cache.insert_address("foo.local", ip_a, IFACE, 0, 1_000);

        let addrs = cache.addresses_for_hostname("foo.local");
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].ip, ip_b);
    }

    #[test]
    fn address_sort_prefers_link_local_then_ula_then_v6_then_v4() {
        let mut addrs = vec![
            ResolvedAddress {
                ip: "192.168.1.5".parse().unwrap(),
                interface: IFACE,
            },
            ResolvedAddress {
                ip: "2001:db8::1".parse().unwrap(),
                interface: IFACE,
            },
            ResolvedAddress {
                ip: "fd00::1".parse().unwrap(),
                interface: IFACE,
            },
            ResolvedAddress {
                ip: "fe80::1".parse().unwrap(),
                interface: IFACE,
            },
        ];
        sort_addresses(&mut addrs);
        assert_eq!(addrs[0].ip, "fe80::1".parse::<IpAddr>().unwrap());
        assert_eq!(addrs[1].ip, "fd00::1".parse::<IpAddr>().unwrap());
        assert_eq!(addrs[2].ip, "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(addrs[3].ip, "192.168.1.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn link_local_address_display_carries_interface_scope() {
        let addr = ResolvedAddress {
            ip: "fe80::1".parse().unwrap(),
            interface: InterfaceId(3),
        };
        assert_eq!(addr.to_string(), "fe80::1%3");
    }
}
