//! Suspended runs, keyed by thread id, waiting for interrupt feedback.
//!
//! Entries expire after a TTL and the store holds at most `capacity` of them;
//! both limits are enforced when a new checkpoint is saved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use deerflow_agent::ResumeState;

pub const DEFAULT_CAPACITY: usize = 1024;
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

struct Entry {
    state: ResumeState,
    saved_at: Instant,
}

#[derive(Clone)]
pub struct CheckpointStore {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
    capacity: usize,
    ttl: Duration,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Record the suspended run of `thread_id`, replacing any earlier one.
    ///
    /// Expired entries are dropped first; if the store is still full, the
    /// oldest checkpoint is evicted.
    pub async fn save(&self, thread_id: impl Into<String>, state: ResumeState) {
        let thread_id = thread_id.into();
        let mut map = self.inner.write().await;

        let before = map.len();
        map.retain(|_, entry| entry.saved_at.elapsed() < self.ttl);
        if map.len() < before {
            debug!(expired = before - map.len(), "Dropped expired checkpoints");
        }

        if !map.contains_key(&thread_id) && map.len() >= self.capacity {
            let oldest = map
                .iter()
                .min_by_key(|(_, entry)| entry.saved_at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                info!(thread_id = %oldest, capacity = self.capacity, "Evicting oldest checkpoint");
                map.remove(&oldest);
            }
        }

        debug!(thread_id = %thread_id, messages = state.history.len(), "Saved checkpoint");
        map.insert(
            thread_id,
            Entry {
                state,
                saved_at: Instant::now(),
            },
        );
    }

    /// Remove and return the suspended run of `thread_id`. A checkpoint resumes at most once.
    pub async fn take(&self, thread_id: &str) -> Option<ResumeState> {
        let entry = self.inner.write().await.remove(thread_id)?;
        if entry.saved_at.elapsed() >= self.ttl {
            debug!(thread_id, "Checkpoint expired");
            return None;
        }
        Some(entry.state)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(call_id: &str) -> ResumeState {
        ResumeState {
            pending_call_id: call_id.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_take_is_one_shot() {
        let store = CheckpointStore::new();
        store.save("thread_1", state("c1")).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.take("thread_1").await.unwrap().pending_call_id, "c1");
        assert!(store.take("thread_1").await.is_none());
        assert!(store.take("other").await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = CheckpointStore::with_limits(2, DEFAULT_TTL);
        store.save("a", state("c1")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.save("b", state("c2")).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.save("c", state("c3")).await;

        assert_eq!(store.len().await, 2);
        assert!(store.take("a").await.is_none());
        assert_eq!(store.take("b").await.unwrap().pending_call_id, "c2");
        assert_eq!(store.take("c").await.unwrap().pending_call_id, "c3");
    }

    #[tokio::test]
    async fn test_replacing_a_thread_does_not_evict() {
        let store = CheckpointStore::with_limits(2, DEFAULT_TTL);
        store.save("a", state("c1")).await;
        store.save("b", state("c2")).await;
        store.save("b", state("c3")).await;
        assert_eq!(store.len().await, 2);
        assert_eq!(store.take("b").await.unwrap().pending_call_id, "c3");
        assert!(store.take("a").await.is_some());
    }

    #[tokio::test]
    async fn test_expired_checkpoints_are_dropped() {
        let store = CheckpointStore::with_limits(16, Duration::from_millis(20));
        store.save("stale", state("c1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.take("stale").await.is_none());

        store.save("old", state("c2")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.save("fresh", state("c3")).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(store.take("fresh").await.unwrap().pending_call_id, "c3");
    }
}
