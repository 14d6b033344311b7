//! Component G — PairedNode State Machine (spec §4.G). Drives a single
//! paired device's connection lifecycle: cache-first initialization,
//! subscription establishment, structure reconciliation, and backoff-driven
//! reconnection.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::collab::{
    AttributeReport, DataVersionFilter, DeviceMetadata, EventReport, InteractionClient, PeerAddress, SharedPeerSet,
    SharedPersistentStore,
};
use crate::config::ControllerConfig;
use crate::endpoint::{self, EndpointEvent, EndpointTree};
use crate::error::{ControllerError, Result};
use crate::subscription::{CoordinatorEvent, SubscriptionCoordinator};

/// Node connection lifecycle states (spec §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connected,
    Reconnecting,
    WaitingForDeviceDiscovery,
}

/// Lifecycle or tree-diff events a [`PairedNode`] emits to its owner (spec
/// §6 "EXTERNAL INTERFACES").
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Tree built from cache, before the remote connection is established.
    Initialized,
    /// Initialization completed against the live device.
    InitializedFromRemote,
    /// A connection-lifecycle transition actually took effect.
    StateChanged(NodeState),
    Endpoint(EndpointEvent),
    StructureChanged,
    /// A non-structural attribute value changed; `old_value` is `None` the
    /// first time this endpoint/cluster/attribute is seen.
    AttributeChanged {
        report: AttributeReport,
        old_value: Option<serde_json::Value>,
    },
    EventTriggered(EventReport),
    /// A liveness heartbeat arrived with no pending structural change.
    ConnectionAlive,
    /// The remote fabric no longer recognizes this node; it will not be
    /// retried further.
    Decommissioned,
}

#[derive(Debug, Clone)]
enum ReconnectOutcome {
    Connected,
    Failed(String),
    Terminal,
}

impl ReconnectOutcome {
    fn into_result(self) -> Result<()> {
        match self {
            ReconnectOutcome::Connected => Ok(()),
            ReconnectOutcome::Failed(msg) => Err(ControllerError::Transient(msg)),
            ReconnectOutcome::Terminal => Err(ControllerError::UnknownPeer(PeerAddress::new(0, 0))),
        }
    }
}

/// Resolve a requested transition against the blocked-edge rule (spec
/// §4.G): `WaitingForDeviceDiscovery` is the "deeper" waiting state, so a
/// request to re-enter `Reconnecting` from it is a no-op.
fn resolve_transition(current: NodeState, requested: NodeState) -> NodeState {
    if requested == NodeState::Reconnecting && current == NodeState::WaitingForDeviceDiscovery {
        current
    } else {
        requested
    }
}

/// `min(floor * 2^error_count, ceiling)` (spec §4.G, Property P5).
fn reconnect_backoff_ms(floor_ms: u64, ceiling_ms: u64, error_count: u32) -> u64 {
    let scaled = (floor_ms as f64) * 2f64.powi(error_count.min(32) as i32);
    (scaled as u64).min(ceiling_ms)
}

fn has_cached_tree_seed(reports: &[AttributeReport]) -> bool {
    let endpoints: std::collections::HashSet<u16> = reports.iter().map(|r| r.endpoint).collect();
    endpoints.contains(&0) && endpoints.len() > 1
}

/// One [`DataVersionFilter`] per endpoint/cluster pair seen in `reports`,
/// carrying the highest data version observed (spec §4.F: "seeded with
/// cached data-version filters so only changed clusters are returned").
fn filters_from_reports(reports: &[AttributeReport]) -> Vec<DataVersionFilter> {
    let mut best: HashMap<(u16, u32), u32> = HashMap::new();
    for r in reports {
        best.entry((r.endpoint, r.cluster_id))
            .and_modify(|v| *v = (*v).max(r.data_version))
            .or_insert(r.data_version);
    }
    best.into_iter()
        .map(|((endpoint, cluster_id), data_version)| DataVersionFilter {
            endpoint,
            cluster_id,
            data_version,
        })
        .collect()
}

/// Entries in `fresh` whose value or data version differs from `previous`
/// (spec §6: "Consumers persist only when the value or data-version
/// changes").
fn diff_changed(previous: &[AttributeReport], fresh: &[AttributeReport]) -> Vec<AttributeReport> {
    let before: HashMap<(u16, u32, u32), &AttributeReport> = previous
        .iter()
        .map(|r| ((r.endpoint, r.cluster_id, r.attribute_id), r))
        .collect();
    fresh
        .iter()
        .filter(|r| {
            before
                .get(&(r.endpoint, r.cluster_id, r.attribute_id))
                .map(|old| old.data_version != r.data_version || old.value != r.value)
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

struct NodeData {
    state: NodeState,
    error_count: u32,
    tree: Option<EndpointTree>,
    last_reports: Vec<AttributeReport>,
    client: Option<Arc<dyn InteractionClient>>,
    metadata: DeviceMetadata,
    reconnect_deadline_ms: Option<u64>,
    /// Events produced by code paths with no synchronous caller to hand
    /// them to (background reconnects, `transition`'s own state pushes).
    /// Drained by `tick` and by whichever of `connect`/`handle_coordinator_event`
    /// caused the push.
    pending_events: Vec<NodeEvent>,
}

/// Owns one paired device's state machine, endpoint tree, and subscription.
/// The subscription coordinator lives behind its own lock (not inside
/// `data`) for the same reason the mDNS engine keeps its waiter registries
/// out of its state mutex: `subscribe_all` awaits network I/O, and holding
/// `data`'s lock across that await would block every other accessor for the
/// duration of the round trip.
pub struct PairedNode {
    pub peer: PeerAddress,
    clock: SharedClock,
    peer_set: SharedPeerSet,
    store: SharedPersistentStore,
    auto_subscribe: bool,
    reconnect_floor_ms: u64,
    reconnect_ceiling_ms: u64,
    rediscovery_reconnect_ms: u64,
    data: tokio::sync::Mutex<NodeData>,
    coordinator: tokio::sync::Mutex<SubscriptionCoordinator>,
    reconnect_slot: tokio::sync::Mutex<Option<tokio::sync::watch::Receiver<Option<ReconnectOutcome>>>>,
}

impl PairedNode {
    pub fn new(
        peer: PeerAddress,
        clock: SharedClock,
        peer_set: SharedPeerSet,
        store: SharedPersistentStore,
        config: &ControllerConfig,
        auto_subscribe: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            coordinator: tokio::sync::Mutex::new(SubscriptionCoordinator::new(clock.clone())),
            clock,
            peer_set,
            store,
            auto_subscribe,
            reconnect_floor_ms: config.reconnect_floor_secs * 1000,
            reconnect_ceiling_ms: config.reconnect_ceiling_secs * 1000,
            rediscovery_reconnect_ms: config.rediscovery_reconnect_secs * 1000,
            data: tokio::sync::Mutex::new(NodeData {
                state: NodeState::Disconnected,
                error_count: 0,
                tree: None,
                last_reports: Vec::new(),
                client: None,
                metadata: DeviceMetadata::default(),
                reconnect_deadline_ms: None,
                pending_events: Vec::new(),
            }),
            reconnect_slot: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn state(&self) -> NodeState {
        self.data.lock().await.state
    }

    pub async fn error_count(&self) -> u32 {
        self.data.lock().await.error_count
    }

    async fn transition(&self, to: NodeState) {
        let mut data = self.data.lock().await;
        let resolved = resolve_transition(data.state, to);
        if resolved != data.state {
            debug!(peer = %self.peer, from = ?data.state, to = ?resolved, "node state transition");
            data.state = resolved;
            data.pending_events.push(NodeEvent::StateChanged(resolved));
        } else if resolved != to {
            warn!(peer = %self.peer, blocked = ?to, "transition blocked by deeper waiting state");
        }
    }

    /// Take whatever events have queued up since the last drain (spec §6:
    /// callers observe state/decommission transitions even when they
    /// originated from a background reconnect with no return channel).
    async fn drain_pending_events(&self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.data.lock().await.pending_events)
    }

    /// Initialization order (spec §4.G): cache first, then a fresh
    /// interaction client, then subscribe-or-read, then a best-effort
    /// fabric-label check, ending in `Connected`.
    pub async fn connect(&self) -> Result<Vec<NodeEvent>> {
        let mut events = Vec::new();
        let mut data = self.data.lock().await;

        let cached = self.store.load_attributes(self.peer).await?;
        if has_cached_tree_seed(&cached) {
            let (tree, tree_events) = endpoint::build_tree(&cached, data.tree.as_ref())?;
            data.tree = Some(tree);
            data.last_reports = cached;
            events.extend(tree_events.into_iter().map(NodeEvent::Endpoint));
            events.push(NodeEvent::Initialized);
        }

        let client = self.peer_set.connect(self.peer).await?;
        let metadata = match self.store.load_device_metadata(self.peer).await? {
            Some(m) => m,
            None => {
                let m = DeviceMetadata::default();
                self.store.save_device_metadata(self.peer, &m).await?;
                m
            }
        };
        data.metadata = metadata;

        let filters = filters_from_reports(&data.last_reports);
        let reports = if self.auto_subscribe {
            drop(data);
            let (_max_interval, initial_report) = self
                .coordinator
                .lock()
                .await
                .subscribe_all(client.as_ref(), &filters, &metadata, None)
                .await?;
            data = self.data.lock().await;
            initial_report
        } else {
            let response = client.read_all(&filters).await?;
            response.attributes
        };

        let changed = diff_changed(&data.last_reports, &reports);
        let (tree, tree_events) = endpoint::build_tree(&reports, data.tree.as_ref())?;
        let structure_changed = !tree_events.is_empty();
        data.tree = Some(tree);
        data.last_reports = reports;
        data.client = Some(client);
        events.extend(tree_events.into_iter().map(NodeEvent::Endpoint));
        if structure_changed {
            events.push(NodeEvent::StructureChanged);
        }

        // Fabric-label validation has no collaborator hook in this core; a
        // real agent would read it off BasicInformation here. Per spec
        // §4.G step 4 a failure here is logged, never fatal, so there is
        // nothing more to do without that operation.
        debug!(peer = %self.peer, "fabric label validation deferred to caller");

        data.error_count = 0;
        data.reconnect_deadline_ms = None;
        drop(data);
        if !changed.is_empty() {
            self.store.save_attributes(self.peer, &changed).await?;
        }
        self.transition(NodeState::Connected).await;
        events.extend(self.drain_pending_events().await);
        events.push(NodeEvent::InitializedFromRemote);
        Ok(events)
    }

    async fn run_reconnect_attempt(&self) -> ReconnectOutcome {
        match self.connect().await {
            // `reconnect`/`trigger_reconnect` give their caller no event
            // channel of their own; re-queue so the next `tick` surfaces them.
            Ok(events) => {
                self.data.lock().await.pending_events.extend(events);
                ReconnectOutcome::Connected
            }
            Err(e) if e.is_terminal() => {
                self.transition(NodeState::Disconnected).await;
                self.data.lock().await.pending_events.push(NodeEvent::Decommissioned);
                ReconnectOutcome::Terminal
            }
            Err(e) => {
                let mut data = self.data.lock().await;
                data.error_count += 1;
                drop(data);
                self.transition(NodeState::WaitingForDeviceDiscovery).await;
                ReconnectOutcome::Failed(e.to_string())
            }
        }
    }

    /// Blocks until a reconnect attempt resolves. Concurrent callers
    /// coalesce onto whichever attempt is already in flight rather than
    /// each re-driving their own (spec §5 cancellation: "two concurrent
    /// calls merge").
    pub async fn reconnect(&self) -> Result<()> {
        enum Role {
            Leader(tokio::sync::watch::Sender<Option<ReconnectOutcome>>),
            Follower(tokio::sync::watch::Receiver<Option<ReconnectOutcome>>),
        }

        let role = {
            let mut slot = self.reconnect_slot.lock().await;
            match &*slot {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = tokio::sync::watch::channel(None);
                    *slot = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let outcome = self.run_reconnect_attempt().await;
                *self.reconnect_slot.lock().await = None;
                let _ = tx.send(Some(outcome.clone()));
                outcome.into_result()
            }
            Role::Follower(mut rx) => loop {
                if let Some(outcome) = rx.borrow().clone() {
                    return outcome.into_result();
                }
                if rx.changed().await.is_err() {
                    return Err(ControllerError::Internal("reconnect leader dropped".to_string()));
                }
            },
        }
    }

    /// Non-blocking trigger: schedules a reconnect attempt without waiting
    /// for it to resolve (spec §5: "`trigger_reconnect` is non-blocking").
    pub fn trigger_reconnect(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.reconnect().await;
        });
    }

    /// Route one coordinator-level event (spec §4.F/§4.G interplay): a
    /// `ReconnectDue` arms the backoff-scheduled transition, a
    /// `StructureReconcileDue` re-runs the Endpoint Tree Builder.
    pub async fn handle_coordinator_event(&self, event: CoordinatorEvent) -> Result<Vec<NodeEvent>> {
        match event {
            CoordinatorEvent::AttributeChanged(report) => {
                let mut data = self.data.lock().await;
                let key = (report.endpoint, report.cluster_id, report.attribute_id);
                let idx = data.last_reports.iter().position(|r| (r.endpoint, r.cluster_id, r.attribute_id) == key);
                let old_value = idx.map(|i| data.last_reports[i].value.clone());
                let changed = match idx {
                    Some(i) => {
                        data.last_reports[i].data_version != report.data_version
                            || data.last_reports[i].value != report.value
                    }
                    None => true,
                };
                match idx {
                    Some(i) => data.last_reports[i] = report.clone(),
                    None => data.last_reports.push(report.clone()),
                }
                drop(data);
                if changed {
                    self.store.save_attributes(self.peer, std::slice::from_ref(&report)).await?;
                }
                Ok(vec![NodeEvent::AttributeChanged { report, old_value }])
            }
            CoordinatorEvent::EventReceived(report) => Ok(vec![NodeEvent::EventTriggered(report)]),
            CoordinatorEvent::Alive => Ok(vec![NodeEvent::ConnectionAlive]),
            CoordinatorEvent::ReconnectDue { delay_ms } => {
                let delay_ms = if delay_ms == 0 {
                    let data = self.data.lock().await;
                    reconnect_backoff_ms(self.reconnect_floor_ms, self.reconnect_ceiling_ms, data.error_count)
                } else {
                    delay_ms
                };
                let now = self.clock.now_millis();
                self.data.lock().await.reconnect_deadline_ms = Some(now + delay_ms);
                self.transition(NodeState::Reconnecting).await;
                Ok(self.drain_pending_events().await)
            }
            CoordinatorEvent::StructureReconcileDue => {
                let data = self.data.lock().await;
                let Some(client) = data.client.clone() else {
                    return Ok(Vec::new());
                };
                let filters = filters_from_reports(&data.last_reports);
                drop(data);
                let response = client.read_all(&filters).await?;
                let mut data = self.data.lock().await;
                let changed = diff_changed(&data.last_reports, &response.attributes);
                let (tree, tree_events) = endpoint::build_tree(&response.attributes, data.tree.as_ref())?;
                data.tree = Some(tree);
                data.last_reports = response.attributes;
                drop(data);
                if !changed.is_empty() {
                    self.store.save_attributes(self.peer, &changed).await?;
                }
                let mut events: Vec<NodeEvent> = tree_events.into_iter().map(NodeEvent::Endpoint).collect();
                events.push(NodeEvent::StructureChanged);
                Ok(events)
            }
        }
    }

    /// A new inbound session arrived while waiting for device discovery:
    /// replace the long reconnect wait with a short one (spec §4.G: "new
    /// inbound session... schedule a reconnect with a short 5s delay").
    pub async fn handle_inbound_rediscovery(&self) {
        let mut data = self.data.lock().await;
        if data.state != NodeState::WaitingForDeviceDiscovery {
            return;
        }
        data.state = NodeState::Reconnecting;
        data.pending_events.push(NodeEvent::StateChanged(NodeState::Reconnecting));
        let now = self.clock.now_millis();
        data.reconnect_deadline_ms = Some(now + self.rediscovery_reconnect_ms);
    }

    /// Drives pending timers and inbound subscription traffic: drains any
    /// `SubscriptionUpdate`s the live handler has pushed since the last
    /// tick, then advances the coordinator's structural debounce and this
    /// node's own reconnect deadline.
    pub async fn tick(self: &Arc<Self>) -> Result<Vec<NodeEvent>> {
        let mut coordinator_events = Vec::new();
        {
            let mut coordinator = self.coordinator.lock().await;
            while let Some(update) = coordinator.try_recv() {
                coordinator_events.extend(coordinator.process_update(update));
            }
            coordinator_events.extend(coordinator.tick());
        }
        let mut events = Vec::new();
        for ev in coordinator_events {
            events.extend(self.handle_coordinator_event(ev).await?);
        }

        let due = {
            let data = self.data.lock().await;
            data.reconnect_deadline_ms
                .map(|d| self.clock.now_millis() >= d)
                .unwrap_or(false)
        };
        if due {
            self.data.lock().await.reconnect_deadline_ms = None;
            self.trigger_reconnect();
        }
        events.extend(self.drain_pending_events().await);
        Ok(events)
    }

    /// Explicit shutdown (spec §5): cancel timers, revoke the subscription
    /// handler, and mark the node gone. The owning controller is
    /// responsible for dropping it from its registry.
    pub async fn disconnect(&self) {
        let mut data = self.data.lock().await;
        data.reconnect_deadline_ms = None;
        data.client = None;
        data.state = NodeState::Disconnected;
        drop(data);
        *self.reconnect_slot.lock().await = None;
    }
}
