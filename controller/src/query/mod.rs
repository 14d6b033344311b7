//! Query Scheduler (spec §4.B): tracks outstanding mDNS questions and
//! re-issues them on an exponential backoff, merging duplicate requests for
//! the same name/type into a single schedule entry rather than flooding the
//! network with redundant queries.

use std::collections::HashMap;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::dns::QType;

const INITIAL_BACKOFF_MS: u64 = 1_500;
const MAX_BACKOFF_MS: u64 = 3_600_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Key identifying a single outstanding question: a name and record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub name: String,
    pub qtype: QType,
}

#[derive(Debug, Clone)]
struct ActiveQuery {
    next_fire_ms: u64,
    backoff_ms: u64,
    /// Number of distinct callers that asked for this query; it stays
    /// scheduled as long as this is nonzero (spec §4.B: "duplicate
    /// requests for the same name/type merge into the existing entry").
    refcount: u32,
}

/// Tracks in-flight mDNS questions and decides, on each `tick`, which ones
/// are due to be re-sent. Does not own a socket — `tick` returns the keys
/// to query; the caller (mDNS Engine) builds and sends the packet.
pub struct QueryScheduler {
    clock: SharedClock,
    active: HashMap<QueryKey, ActiveQuery>,
}

impl QueryScheduler {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            active: HashMap::new(),
        }
    }

    /// Register interest in a query. If already scheduled, bumps the
    /// refcount rather than resetting its backoff (spec §4.B).
    pub fn register(&mut self, key: QueryKey) {
        let now = self.clock.now_millis();
        self.active
            .entry(key)
            .and_modify(|q| q.refcount += 1)
            .or_insert(ActiveQuery {
                next_fire_ms: now,
                backoff_ms: INITIAL_BACKOFF_MS,
                refcount: 1,
            });
    }

    /// Release one caller's interest. The query stays scheduled until the
    /// refcount drops to zero.
    pub fn unregister(&mut self, key: &QueryKey) {
        if let Some(q) = self.active.get_mut(key) {
            q.refcount = q.refcount.saturating_sub(1);
            if q.refcount == 0 {
                self.active.remove(key);
            }
        }
    }

    /// A response satisfying this query arrived; cancel its retransmit
    /// schedule (spec §4.B: answered queries stop retransmitting
    /// immediately rather than waiting out the backoff).
    pub fn satisfy(&mut self, key: &QueryKey) {
        self.active.remove(key);
    }

    /// Advance scheduling: every query whose `next_fire_ms` has passed is
    /// returned and rescheduled at the next backoff step, capped at
    /// [`MAX_BACKOFF_MS`] (spec §4.B: "backoff from 1.5s up to a 1 hour
    /// ceiling").
    pub fn tick(&mut self) -> Vec<QueryKey> {
        let now = self.clock.now_millis();
        let mut due = Vec::new();
        for (key, query) in self.active.iter_mut() {
            if query.next_fire_ms <= now {
                due.push(key.clone());
                query.next_fire_ms = now + query.backoff_ms;
                query.backoff_ms =
                    ((query.backoff_ms as f64 * BACKOFF_MULTIPLIER) as u64).min(MAX_BACKOFF_MS);
            }
        }
        due
    }

    pub fn is_active(&self, key: &QueryKey) -> bool {
        self.active.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

pub fn backoff_ceiling() -> Duration {
    Duration::from_millis(MAX_BACKOFF_MS)
}
