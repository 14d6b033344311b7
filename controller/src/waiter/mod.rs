//! Waiter Registry (spec §4.C): lets callers block on "the next discovery
//! result matching some key" without polling the cache themselves. Each
//! waiter is a one-shot future; `finish` fulfils it, `cancel`/timeout drops
//! it without ever completing the caller's future with a value.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::time::Duration;

/// A registry of one-shot waiters keyed by `K`, each resolved with a `V`.
///
/// Multiple waiters may be registered under the same key; `finish` wakes
/// all of them with clones of the same value (spec §4.C: "more than one
/// caller may be waiting on the same key at once").
pub struct WaiterRegistry<K, V> {
    waiters: Mutex<HashMap<K, Vec<oneshot::Sender<V>>>>,
}

impl<K, V> Default for WaiterRegistry<K, V>
where
    K: std::hash::Hash + Eq,
{
    fn default() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> WaiterRegistry<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`, returning a future that resolves once
    /// `finish(key, _)` is called or `timeout` elapses (whichever is
    /// first). A timeout resolves to `None`; success resolves to `Some`.
    pub async fn wait(&self, key: K, timeout: Duration) -> Option<V> {
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.waiters.lock().unwrap();
            guard.entry(key).or_default().push(tx);
        }
        tokio::time::timeout(timeout, rx).await.ok()?.ok()
    }

    /// Fulfil every waiter registered under `key` with `value`. Waiters
    /// that already timed out (receiver dropped) are silently discarded.
    pub fn finish(&self, key: &K, value: V) {
        let senders = {
            let mut guard = self.waiters.lock().unwrap();
            guard.remove(key).unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.send(value.clone());
        }
    }

    /// Drop every waiter registered under `key` without resolving them to
    /// a value; their futures observe a timeout-equivalent `None` once the
    /// sender side is dropped.
    pub fn cancel(&self, key: &K) {
        self.waiters.lock().unwrap().remove(key);
    }

    pub fn waiting_count(&self, key: &K) -> usize {
        self.waiters
            .lock()
            .unwrap()
            .get(key)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn finish_wakes_all_waiters_on_same_key() {
        let registry: Arc<WaiterRegistry<String, u32>> = Arc::new(WaiterRegistry::new());
        let r1 = registry.clone();
        let r2 = registry.clone();
        let h1 = tokio::spawn(async move { r1.wait("foo".into(), Duration::from_secs(5)).await });
        let h2 = tokio::spawn(async move { r2.wait("foo".into(), Duration::from_secs(5)).await });

        while registry.waiting_count(&"foo".to_string()) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.finish(&"foo".to_string(), 42);

        assert_eq!(h1.await.unwrap(), Some(42));
        assert_eq!(h2.await.unwrap(), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_wait_times_out_to_none() {
        let registry: WaiterRegistry<&str, u32> = WaiterRegistry::new();
        let result = registry.wait("bar", Duration::from_millis(50)).await;
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn cancel_drops_waiters_without_a_value() {
        let registry: Arc<WaiterRegistry<&str, u32>> = Arc::new(WaiterRegistry::new());
        let r1 = registry.clone();
        let h1 = tokio::spawn(async move { r1.wait("baz", Duration::from_secs(5)).await });
        while registry.waiting_count(&"baz") < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.cancel(&"baz");
        assert_eq!(h1.await.unwrap(), None);
    }
}
