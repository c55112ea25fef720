use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::DedupStore;
use crate::error::StoreError;

const PURGE_THRESHOLD: usize = 10_000;
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

struct Entries {
    expiries: HashMap<String, Instant>,
    last_purge: Instant,
}

/// Process-local dedup store, used when no Redis URL is configured.
///
/// Expired keys are swept at most once per `PURGE_INTERVAL`, and only once
/// the map has grown past `PURGE_THRESHOLD`, so a claim never pays for a
/// full scan more often than that.
pub struct InMemoryDedupStore {
    entries: Mutex<Entries>,
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries {
                expiries: HashMap::new(),
                last_purge: Instant::now(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.expiries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("dedup lock poisoned".to_string()))
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.lock()?;

        if entries.expiries.len() >= PURGE_THRESHOLD
            && now.duration_since(entries.last_purge) >= PURGE_INTERVAL
        {
            entries.expiries.retain(|_, expires_at| *expires_at > now);
            entries.last_purge = now;
        }

        match entries.expiries.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.expiries.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.expiries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn claim_is_rejected_inside_window_and_allowed_after() {
        let store = InMemoryDedupStore::new();

        assert!(store.try_claim("vote:1:u1", HOUR).await.unwrap());
        assert!(!store.try_claim("vote:1:u1", HOUR).await.unwrap());

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert!(!store.try_claim("vote:1:u1", HOUR).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.try_claim("vote:1:u1", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let store = InMemoryDedupStore::new();
        assert!(store.try_claim("vote:1:u1", HOUR).await.unwrap());
        store.release("vote:1:u1").await.unwrap();
        assert!(store.try_claim("vote:1:u1", HOUR).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_collide() {
        let store = InMemoryDedupStore::new();
        assert!(store.try_claim("vote:1:u1", HOUR).await.unwrap());
        assert!(store.try_claim("vote:2:u1", HOUR).await.unwrap());
        assert!(store.try_claim("vote:1:u2", HOUR).await.unwrap());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryDedupStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.try_claim("vote:1:u1", HOUR).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_past_threshold_waits_for_interval() {
        let store = InMemoryDedupStore::new();
        let short = Duration::from_secs(1);

        for i in 0..PURGE_THRESHOLD {
            assert!(store.try_claim(&format!("vote:1:v{}", i), short).await.unwrap());
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        // Everything is expired, but the last sweep was too recent
        assert!(store.try_claim("vote:1:late", HOUR).await.unwrap());
        assert_eq!(store.len(), PURGE_THRESHOLD + 1);

        // Expired keys can still be claimed again without a sweep
        assert!(store.try_claim("vote:1:v0", HOUR).await.unwrap());

        tokio::time::advance(PURGE_INTERVAL).await;
        assert!(store.try_claim("vote:1:next", HOUR).await.unwrap());
        assert_eq!(store.len(), 3);
        assert!(!store.try_claim("vote:1:late", HOUR).await.unwrap());
        assert!(!store.try_claim("vote:1:v0", HOUR).await.unwrap());
    }
}
