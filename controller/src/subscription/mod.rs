//! Component F — Subscription Coordinator (spec §4.F). Owns the single live
//! subscription for a node: invalidates whatever handler came before,
//! re-primes from a cached-data-version read, opens a new subscription with
//! ICD-aware intervals, and translates the handler's attribute/event/alive/
//! timeout callbacks into events the owning PairedNode acts on.

use std::collections::HashMap;

use crate::clock::SharedClock;
use crate::collab::{
    AttributeReport, DataVersionFilter, DeviceMetadata, EventReport, InteractionClient,
    SubscribeParams, SubscriptionHandler, SubscriptionUpdate,
};
use crate::endpoint::{
    ATTR_CLIENT_LIST, ATTR_DEVICE_TYPE_LIST, ATTR_PARTS_LIST, ATTR_SERVER_LIST, DESCRIPTOR_CLUSTER,
};
use crate::error::Result;

/// `BasicInformation` cluster id and its `ShutDown` event id (Matter core spec).
pub(crate) const BASIC_INFORMATION_CLUSTER: u32 = 0x0028;
pub(crate) const SHUTDOWN_EVENT: u32 = 0x0000;

/// Structural-change reconcile debounce (spec §4.F "alive").
const STRUCTURE_DEBOUNCE_MS: u64 = 5_000;
/// Reconnect delay after an explicit device shutdown event (spec §4.F "event").
const SHUTDOWN_RECONNECT_MS: u64 = 30_000;
/// Default min-interval floor for devices that are not intermittently connected.
const DEFAULT_MIN_INTERVAL_SECS: u32 = 1;
/// Ceiling used when the device advertised neither SII nor SAI.
const DEFAULT_CEILING_MS: u32 = 60_000;

/// Outcome routed out of the coordinator for the owning PairedNode to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    AttributeChanged(AttributeReport),
    EventReceived(EventReport),
    /// A liveness heartbeat arrived on the live handler with no pending
    /// structural change (spec §6 "connection_alive").
    Alive,
    /// The structural-change debounce elapsed; caller should read-all and
    /// re-run the Endpoint Tree Builder.
    StructureReconcileDue,
    /// A reconnect should be scheduled after `delay_ms` (spec §4.G backoff
    /// owns the actual timer; the coordinator only signals the trigger and,
    /// for an explicit shutdown, its mandated delay).
    ReconnectDue { delay_ms: u64 },
}

fn is_structural_attribute(attribute_id: u32) -> bool {
    matches!(
        attribute_id,
        ATTR_DEVICE_TYPE_LIST | ATTR_SERVER_LIST | ATTR_CLIENT_LIST | ATTR_PARTS_LIST
    )
}

/// Derive `{min, max}` interval floor/ceiling from device metadata (spec
/// §4.F): intermittently-connected devices get a 0s floor; everything else
/// defaults to 1s. The ceiling comes from the caller if given, else from
/// whichever of SII/SAI is larger.
fn derive_params(metadata: &DeviceMetadata, caller_max_interval_secs: Option<u32>) -> SubscribeParams {
    let min_interval_secs = if metadata.icd { 0 } else { DEFAULT_MIN_INTERVAL_SECS };
    let max_interval_secs = caller_max_interval_secs.unwrap_or_else(|| {
        let ceiling_ms = match (metadata.sai_ms, metadata.sii_ms) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => DEFAULT_CEILING_MS,
        };
        (ceiling_ms.div_ceil(1000)).max(min_interval_secs + 1)
    });
    SubscribeParams {
        min_interval_secs,
        max_interval_secs: max_interval_secs.max(min_interval_secs + 1),
    }
}

/// Merge a seeded read with a subscription's initial report, keyed by
/// endpoint/cluster/attribute and keeping whichever side carries the higher
/// data version (spec §4.F: "issue a full read... then open a subscription").
fn merge_reports(seeded: Vec<AttributeReport>, initial: Vec<AttributeReport>) -> Vec<AttributeReport> {
    let mut by_key: HashMap<(u16, u32, u32), AttributeReport> = HashMap::new();
    let mut order: Vec<(u16, u32, u32)> = Vec::new();
    for report in seeded.into_iter().chain(initial) {
        let key = (report.endpoint, report.cluster_id, report.attribute_id);
        match by_key.get(&key) {
            Some(existing) if existing.data_version >= report.data_version => {}
            Some(_) => {
                by_key.insert(key, report);
            }
            None => {
                order.push(key);
                by_key.insert(key, report);
            }
        }
    }
    order.into_iter().filter_map(|k| by_key.remove(&k)).collect()
}

pub struct SubscriptionCoordinator {
    clock: SharedClock,
    handler: Option<SubscriptionHandler>,
    rx: Option<tokio::sync::mpsc::UnboundedReceiver<SubscriptionUpdate>>,
    debounce_deadline_ms: Option<u64>,
    structure_dirty: bool,
}

impl SubscriptionCoordinator {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            handler: None,
            rx: None,
            debounce_deadline_ms: None,
            structure_dirty: false,
        }
    }

    /// `subscribe_all(options) → { max_interval, initial_report }` (spec
    /// §4.F). Invalidates any earlier handler, seeds from a filtered read,
    /// then opens the replacement subscription.
    pub async fn subscribe_all(
        &mut self,
        client: &dyn InteractionClient,
        filters: &[DataVersionFilter],
        metadata: &DeviceMetadata,
        caller_max_interval_secs: Option<u32>,
    ) -> Result<(u32, Vec<AttributeReport>)> {
        if let Some(old) = self.handler.take() {
            old.invalidate();
        }
        self.rx = None;
        self.debounce_deadline_ms = None;
        self.structure_dirty = false;

        let seeded = client.read_all(filters).await?;

        let (handler, rx) = SubscriptionHandler::new();
        let params = derive_params(metadata, caller_max_interval_secs);
        let response = client.subscribe_all(params, filters, handler.clone()).await?;

        self.handler = Some(handler);
        self.rx = Some(rx);

        Ok((
            response.max_interval_secs,
            merge_reports(seeded.attributes, response.initial_report),
        ))
    }

    pub fn is_handler_active(&self) -> bool {
        self.handler.as_ref().is_some_and(SubscriptionHandler::is_active)
    }

    /// Drain one pending update from the live handler's channel, if any.
    pub fn try_recv(&mut self) -> Option<SubscriptionUpdate> {
        self.rx.as_mut()?.try_recv().ok()
    }

    /// Route one update through the coordinator (spec §4.F "Route updates
    /// through the handler").
    pub fn process_update(&mut self, update: SubscriptionUpdate) -> Vec<CoordinatorEvent> {
        let now_ms = self.clock.now_millis();
        match update {
            SubscriptionUpdate::Attribute(report) => {
                if report.cluster_id == DESCRIPTOR_CLUSTER && is_structural_attribute(report.attribute_id) {
                    self.structure_dirty = true;
                }
                vec![CoordinatorEvent::AttributeChanged(report)]
            }
            SubscriptionUpdate::Event(report) => {
                if report.cluster_id == BASIC_INFORMATION_CLUSTER && report.event_id == SHUTDOWN_EVENT {
                    return vec![CoordinatorEvent::ReconnectDue {
                        delay_ms: SHUTDOWN_RECONNECT_MS,
                    }];
                }
                vec![CoordinatorEvent::EventReceived(report)]
            }
            SubscriptionUpdate::Alive => {
                if self.structure_dirty {
                    self.debounce_deadline_ms = Some(now_ms + STRUCTURE_DEBOUNCE_MS);
                }
                vec![CoordinatorEvent::Alive]
            }
            SubscriptionUpdate::Timeout => vec![CoordinatorEvent::ReconnectDue { delay_ms: 0 }],
        }
    }

    /// Advance the debounce timer; fires `StructureReconcileDue` once the
    /// 5s window since the last structural attribute update has elapsed.
    pub fn tick(&mut self) -> Vec<CoordinatorEvent> {
        let now_ms = self.clock.now_millis();
        if let Some(deadline) = self.debounce_deadline_ms {
            if now_ms >= deadline {
                self.debounce_deadline_ms = None;
                self.structure_dirty = false;
                return vec![CoordinatorEvent::StructureReconcileDue];
            }
        }
        Vec::new()
    }
}
