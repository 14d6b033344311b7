//! Component D — mDNS Engine (spec §4.D). Orchestrates the Record Cache,
//! Query Scheduler, and Waiter Registry: parses inbound DNS-SD messages,
//! updates cache state, and answers discovery requests either from cache or
//! by registering a waiter and issuing a query.
//!
//! All engine state lives behind one [`tokio::sync::Mutex`] rather than a
//! dedicated actor task — every access is a short, non-blocking critical
//! section (no network I/O happens while the lock is held), which gives the
//! same "no parallel mutation" guarantee the spec describes without the
//! bookkeeping of a command-channel actor.

pub mod records;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::{CommissionableDeviceRecord, RecordCache, ResolvedAddress};
use crate::clock::SharedClock;
use crate::collab::{InterfaceId, SharedMdnsSocket};
use crate::dns::{self, KnownAnswer, QType, RecordValue};
use crate::query::{QueryKey, QueryScheduler};
use crate::waiter::WaiterRegistry;

use records::{parse_commissionable_txt, parse_operational_txt, CommissionableIdentifier};

pub const OPERATIONAL_SERVICE: &str = "_matter._tcp.local";
pub const COMMISSIONABLE_SERVICE: &str = "_matterc._udp.local";

/// A resolved, already-paired device returned by [`MdnsEngine::find_operational`].
#[derive(Debug, Clone)]
pub struct OperationalDevice {
    pub service_name: String,
    pub addresses: Vec<ResolvedAddress>,
    pub port: u16,
}

/// A resolved, un-paired device returned by [`MdnsEngine::find_commissionable`].
#[derive(Debug, Clone)]
pub struct CommissionableDevice {
    pub instance_name: String,
    pub addresses: Vec<ResolvedAddress>,
    pub port: u16,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub long_discriminator: Option<u16>,
    pub friendly_name: Option<String>,
}

fn operational_service_name(fabric_id: u64, node_id: u64) -> String {
    format!("{fabric_id:016X}-{node_id:016X}.{OPERATIONAL_SERVICE}")
}

struct Inner {
    cache: RecordCache,
    queries: QueryScheduler,
    operational_targets: HashSet<String>,
    commissionable_targets: HashSet<CommissionableIdentifier>,
    ipv4_enabled: bool,
    dormant: bool,
}

impl Inner {
    fn enter_dormant_if_idle(&mut self) {
        if !self.dormant && self.operational_targets.is_empty() && self.commissionable_targets.is_empty() {
            self.dormant = true;
            self.cache.clear();
            debug!("mdns engine entering dormant mode");
        }
    }

    fn wake_from_dormant(&mut self) {
        if self.dormant {
            self.dormant = false;
            debug!("mdns engine waking from dormant mode");
        }
    }
}

/// Orchestrates discovery. One instance is shared by every `PairedNode` in
/// the controller (spec §5: "the mDNS socket and cache are shared by all
/// nodes through a single engine").
pub struct MdnsEngine {
    inner: tokio::sync::Mutex<Inner>,
    /// Not behind `inner`'s lock: [`WaiterRegistry`] carries its own interior
    /// mutability, and a waiter's `.wait().await` must not hold `inner`
    /// locked for the duration of the timeout — doing so would block
    /// `handle_incoming` from ever resolving it.
    operational_waiters: WaiterRegistry<String, OperationalDevice>,
    commissionable_waiters: WaiterRegistry<CommissionableIdentifier, CommissionableDevice>,
    socket: SharedMdnsSocket,
    clock: SharedClock,
}

impl MdnsEngine {
    pub fn new(socket: SharedMdnsSocket, clock: SharedClock, ttl_grace_factor: f64, ipv4_enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: tokio::sync::Mutex::new(Inner {
                cache: RecordCache::new(ttl_grace_factor),
                queries: QueryScheduler::new(clock.clone()),
                operational_targets: HashSet::new(),
                commissionable_targets: HashSet::new(),
                ipv4_enabled,
                dormant: false,
            }),
            operational_waiters: WaiterRegistry::new(),
            commissionable_waiters: WaiterRegistry::new(),
            socket,
            clock,
        })
    }

    async fn send_due_queries(&self) {
        let (due, known_answers, ipv4_enabled) = {
            let mut inner = self.inner.lock().await;
            if inner.dormant {
                return;
            }
            let due = inner.queries.tick();
            if due.is_empty() {
                return;
            }
            let known_answers = self.known_answers_for(&inner, &due);
            (due, known_answers, inner.ipv4_enabled)
        };
        let _ = ipv4_enabled;
        let queries: Vec<(String, QType)> = due.into_iter().map(|k| (k.name, k.qtype)).collect();
        for packet in dns::build_queries(&queries, &known_answers) {
            let _ = self.socket.send_multicast(&packet, true).await;
        }
    }

    fn known_answers_for(&self, inner: &Inner, due: &[QueryKey]) -> Vec<KnownAnswer> {
        let mut out = Vec::new();
        for key in due {
            if key.qtype == QType::Ptr && key.name.ends_with(OPERATIONAL_SERVICE) {
                if let Some(record) = inner.cache.find_operational(&key.name) {
                    if let Some(port) = record.port {
                        if let Some(target) = &record.target_hostname {
                            out.push(KnownAnswer {
                                name: key.name.clone(),
                                ttl_remaining_secs: 120,
                                value: RecordValue::Srv {
                                    priority: 0,
                                    weight: 0,
                                    port,
                                    target: target.clone(),
                                },
                            });
                        }
                    }
                }
            }
        }
        out
    }

    /// Periodic maintenance: advance the query scheduler and sweep the
    /// cache for expired entries (spec §4.A: "expiry sweeps every minute",
    /// §4.B backoff ticks). Call this from a loop on an interval timer.
    pub async fn tick(&self) {
        self.send_due_queries().await;
        let mut inner = self.inner.lock().await;
        let now = self.clock.now_millis();
        inner.cache.expire(now);
    }

    /// Process one inbound mDNS packet (spec §4.D steps 1-5).
    pub async fn handle_incoming(&self, bytes: &[u8], interface: InterfaceId) {
        let Some(msg) = dns::parse_message(bytes) else {
            debug!("dropping unparseable mdns packet");
            return;
        };
        if !msg.is_response {
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.dormant {
            return;
        }
        let now_ms = self.clock.now_millis();

        // Step 2: address table update for any hostname we already track.
        for rec in &msg.records {
            match &rec.value {
                RecordValue::A(ip) => {
                    inner
                        .cache
                        .insert_address(&rec.name, IpAddr::V4(*ip), interface, rec.ttl_secs, now_ms);
                }
                RecordValue::Aaaa(ip) => {
                    inner
                        .cache
                        .insert_address(&rec.name, IpAddr::V6(*ip), interface, rec.ttl_secs, now_ms);
                }
                _ => {}
            }
        }

        // Steps 3-5: TXT/SRV/PTR dispatch by service type.
        for rec in &msg.records {
            if rec.name.ends_with(OPERATIONAL_SERVICE) {
                self.handle_operational_record(&mut inner, rec, now_ms).await;
            } else if rec.name.ends_with(COMMISSIONABLE_SERVICE) || is_commissionable_instance(&rec.name) {
                self.handle_commissionable_record(&mut inner, rec, now_ms).await;
            }
        }

        drop(inner);
        self.try_resolve_operational_waiters().await;
        self.try_resolve_commissionable_waiters().await;
    }

    async fn handle_operational_record(&self, inner: &mut Inner, rec: &dns::ParsedRecord, now_ms: u64) {
        match &rec.value {
            RecordValue::Txt(pairs) => {
                let is_known = inner.cache.find_operational(&rec.name).is_some()
                    || inner.operational_targets.contains(&rec.name);
                if !is_known {
                    return; // spec §4.D step 3: ignore TXT for untracked names.
                }
                let parsed = parse_operational_txt(pairs);
                inner
                    .cache
                    .upsert_operational_txt(&rec.name, parsed.metadata, parsed.pairing_hint, rec.ttl_secs, now_ms);
            }
            RecordValue::Srv { port, target, .. } => {
                inner
                    .cache
                    .upsert_operational_srv(&rec.name, target, *port, rec.ttl_secs, now_ms);
                let needs_addresses = inner.cache.addresses_for_hostname(target).is_empty();
                if needs_addresses {
                    inner.queries.register(QueryKey {
                        name: target.clone(),
                        qtype: QType::Aaaa,
                    });
                    if inner.ipv4_enabled {
                        inner.queries.register(QueryKey {
                            name: target.clone(),
                            qtype: QType::A,
                        });
                    }
                }
            }
            _ => {}
        }
    }

    async fn handle_commissionable_record(&self, inner: &mut Inner, rec: &dns::ParsedRecord, now_ms: u64) {
        match &rec.value {
            RecordValue::Txt(pairs) => {
                let parsed = parse_commissionable_txt(pairs);
                inner.cache.upsert_commissionable(
                    &rec.name,
                    |entry| {
                        entry.long_discriminator = parsed.long_discriminator.or(entry.long_discriminator);
                        entry.short_discriminator = parsed.short_discriminator.or(entry.short_discriminator);
                        entry.vendor_id = parsed.vendor_id.or(entry.vendor_id);
                        entry.product_id = parsed.product_id.or(entry.product_id);
                        entry.device_type = parsed.device_type.or(entry.device_type);
                        entry.commissioning_mode = parsed.commissioning_mode.or(entry.commissioning_mode);
                        entry.friendly_name = parsed.friendly_name.clone().or(entry.friendly_name.clone());
                        entry.rotating_id = parsed.rotating_id.clone().or(entry.rotating_id.clone());
                        entry.pairing_hint = parsed.pairing_hint.or(entry.pairing_hint);
                    },
                    rec.ttl_secs,
                    now_ms,
                );
            }
            RecordValue::Srv { port, target, .. } => {
                inner.cache.upsert_commissionable(
                    &rec.name,
                    |entry| {
                        entry.target_hostname = Some(target.clone());
                        entry.port = Some(*port);
                    },
                    rec.ttl_secs,
                    now_ms,
                );
                inner.queries.register(QueryKey {
                    name: target.clone(),
                    qtype: QType::Aaaa,
                });
            }
            _ => {}
        }
    }

    async fn try_resolve_operational_waiters(&self) {
        let inner = self.inner.lock().await;
        let names: Vec<String> = inner.operational_targets.iter().cloned().collect();
        let mut resolved = Vec::new();
        for name in names {
            if let Some(device) = resolve_operational(&inner.cache, &name) {
                resolved.push((name, device));
            }
        }
        drop(inner);
        for (name, device) in resolved {
            self.operational_waiters.finish(&name, device);
        }
    }

    async fn try_resolve_commissionable_waiters(&self) {
        let inner = self.inner.lock().await;
        let identifiers: Vec<CommissionableIdentifier> =
            inner.commissionable_targets.iter().cloned().collect();
        let mut resolved = Vec::new();
        for ident in &identifiers {
            for record in inner.cache.find_commissionable(|_| true) {
                let txt = records::CommissionableTxt {
                    long_discriminator: record.long_discriminator,
                    short_discriminator: record.short_discriminator,
                    vendor_id: record.vendor_id,
                    product_id: record.product_id,
                    device_type: record.device_type,
                    commissioning_mode: record.commissioning_mode,
                    friendly_name: record.friendly_name.clone(),
                    rotating_id: record.rotating_id.clone(),
                    pairing_hint: record.pairing_hint,
                };
                if ident.matches(&txt, &record.instance_name) {
                    if let Some(device) = resolve_commissionable(&inner.cache, record) {
                        resolved.push((ident.clone(), device));
                        break;
                    }
                }
            }
        }
        drop(inner);
        for (ident, device) in resolved {
            self.commissionable_waiters.finish(&ident, device);
        }
    }

    /// spec §4.D `find_operational`.
    pub async fn find_operational(
        &self,
        fabric_id: u64,
        node_id: u64,
        timeout: Duration,
        ignore_cache: bool,
    ) -> Option<OperationalDevice> {
        let service_name = operational_service_name(fabric_id, node_id);
        let mut inner = self.inner.lock().await;
        inner.wake_from_dormant();

        if !ignore_cache {
            if let Some(device) = resolve_operational(&inner.cache, &service_name) {
                return Some(device);
            }
        }

        inner.operational_targets.insert(service_name.clone());
        inner.queries.register(QueryKey {
            name: service_name.clone(),
            qtype: QType::Srv,
        });
        drop(inner);

        let result = self
            .operational_waiters
            .wait(service_name.clone(), timeout)
            .await;

        let mut inner = self.inner.lock().await;
        inner.operational_targets.remove(&service_name);
        inner.queries.unregister(&QueryKey {
            name: service_name,
            qtype: QType::Srv,
        });
        inner.enter_dormant_if_idle();
        result
    }

    /// spec §4.D `find_commissionable`.
    pub async fn find_commissionable(
        &self,
        identifier: CommissionableIdentifier,
        timeout: Duration,
    ) -> Vec<CommissionableDevice> {
        let mut inner = self.inner.lock().await;
        inner.wake_from_dormant();
        inner.commissionable_targets.insert(identifier.clone());
        if let Some(sub) = identifier.sub_service() {
            inner.queries.register(QueryKey {
                name: format!("{sub}.{COMMISSIONABLE_SERVICE}"),
                qtype: QType::Ptr,
            });
        }
        drop(inner);

        let result = self
            .commissionable_waiters
            .wait(identifier.clone(), timeout)
            .await;

        let mut inner = self.inner.lock().await;
        inner.commissionable_targets.remove(&identifier);
        if let Some(sub) = identifier.sub_service() {
            inner.queries.unregister(&QueryKey {
                name: format!("{sub}.{COMMISSIONABLE_SERVICE}"),
                qtype: QType::Ptr,
            });
        }
        inner.enter_dormant_if_idle();
        result.into_iter().collect()
    }

    /// spec §4.D `find_commissionable_continuous`: invokes `on_found` for
    /// every newly discovered device matching `identifier`, re-arming the
    /// waiter until `cancel` resolves or `timeout` elapses.
    pub async fn find_commissionable_continuous(
        &self,
        identifier: CommissionableIdentifier,
        mut on_found: impl FnMut(CommissionableDevice) + Send,
        timeout: Option<Duration>,
        mut cancel: impl std::future::Future<Output = ()> + Unpin,
    ) {
        let deadline_step = timeout.unwrap_or(Duration::from_secs(3600));
        loop {
            let find = self.find_commissionable(identifier.clone(), deadline_step);
            tokio::select! {
                devices = find => {
                    if devices.is_empty() && timeout.is_some() {
                        return;
                    }
                    for d in devices {
                        on_found(d);
                    }
                }
                _ = &mut cancel => {
                    return;
                }
            }
        }
    }

    pub async fn register_operational_target(&self, fabric_id: u64, node_id: u64) {
        let mut inner = self.inner.lock().await;
        inner.wake_from_dormant();
        let name = operational_service_name(fabric_id, node_id);
        inner.operational_targets.insert(name.clone());
        inner.queries.register(QueryKey { name, qtype: QType::Srv });
    }

    pub async fn unregister_operational_target(&self, fabric_id: u64, node_id: u64) {
        let mut inner = self.inner.lock().await;
        let name = operational_service_name(fabric_id, node_id);
        inner.operational_targets.remove(&name);
        inner.queries.unregister(&QueryKey { name, qtype: QType::Srv });
        inner.enter_dormant_if_idle();
    }

    pub async fn is_dormant(&self) -> bool {
        self.inner.lock().await.dormant
    }
}

fn resolve_operational(cache: &RecordCache, service_name: &str) -> Option<OperationalDevice> {
    let record = cache.find_operational(service_name)?;
    let target = record.target_hostname.as_ref()?;
    let port = record.port?;
    let addresses = cache.addresses_for_hostname(target);
    if addresses.is_empty() {
        return None;
    }
    Some(OperationalDevice {
        service_name: service_name.to_string(),
        addresses,
        port,
    })
}

fn resolve_commissionable(
    cache: &RecordCache,
    record: &CommissionableDeviceRecord,
) -> Option<CommissionableDevice> {
    let target = record.target_hostname.as_ref()?;
    let port = record.port?;
    let addresses = cache.addresses_for_hostname(target);
    if addresses.is_empty() {
        return None;
    }
    Some(CommissionableDevice {
        instance_name: record.instance_name.clone(),
        addresses,
        port,
        vendor_id: record.vendor_id,
        product_id: record.product_id,
        long_discriminator: record.long_discriminator,
        friendly_name: record.friendly_name.clone(),
    })
}

fn is_commissionable_instance(name: &str) -> bool {
    name.contains(COMMISSIONABLE_SERVICE)
}
