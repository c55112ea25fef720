//! Store-client ports used by the pipeline.
//!
//! Components receive these as `Arc<dyn ...>` through their constructors, so
//! tests can swap in the in-memory implementations or small fakes.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use memory::InMemoryDedupStore;
pub use self::redis::RedisDedupStore;

/// Key under which a (poll, voter) pair is marked as having voted.
pub fn dedup_key(poll_id: &str, voter_id: &str) -> String {
    format!("vote:{}:{}", poll_id, voter_id)
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Set `key` with an expiry if it is not already present. Returns `true`
    /// when this call created the entry.
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn release(&self, key: &str) -> Result<(), StoreError>;
}

/// Result of one atomic increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionTotal {
    pub option_id: String,
    pub poll_id: String,
    pub total: i64,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` to the option's vote count and return the new
    /// total.
    async fn increment_and_get(&self, option_id: &str, delta: i64)
    -> Result<OptionTotal, StoreError>;
}

#[async_trait]
pub trait PollCatalog: Send + Sync {
    async fn option_in_poll(&self, poll_id: &str, option_id: &str) -> Result<bool, StoreError>;
}
