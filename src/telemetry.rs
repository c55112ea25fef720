//! Observability port for the pipeline.
//!
//! Components report what happened through [`PipelineEvents`] instead of
//! logging directly. [`LogEvents`] is the production implementation: it
//! writes log lines and feeds [`Health`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::{LogError, StoreError, SubmitError};
use crate::models::UpdateEvent;
use crate::store::OptionTotal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dependency {
    DedupStore,
    PollCatalog,
    VoteLog,
    CounterStore,
}

#[allow(unused_variables)]
pub trait PipelineEvents: Send + Sync {
    fn vote_accepted(&self, poll_id: &str, option_id: &str, voter_id: &str) {}
    fn vote_rejected(&self, poll_id: &str, voter_id: &str, reason: &SubmitError) {}
    fn dedup_release_failed(&self, key: &str, error: &StoreError) {}

    fn vote_buffered(&self, option_id: &str, pending: u64) {}
    fn record_malformed(&self, partition: usize, offset: u64, error: &str) {}

    fn flush_started(&self, options: usize, votes: u64) {}
    fn flush_skipped(&self) {}
    fn increment_committed(&self, total: &OptionTotal, delta: i64) {}
    fn increment_failed(&self, option_id: &str, delta: i64, error: &StoreError) {}
    fn update_published(&self, event: &UpdateEvent) {}
    fn publish_failed(&self, event: &UpdateEvent, error: &LogError) {}

    fn broadcast_sent(&self, event: &UpdateEvent, observers: usize) {}

    fn dependency_ok(&self, dependency: Dependency) {}
    fn dependency_failed(&self, dependency: Dependency, error: &str) {}
}

/// Events sink that ignores everything.
pub struct NoopEvents;

impl PipelineEvents for NoopEvents {}

/// Consecutive-failure counters per dependency.
pub struct Health {
    threshold: u32,
    failures: Mutex<HashMap<Dependency, u32>>,
}

impl Health {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, dependency: Dependency) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(&dependency);
        }
    }

    pub fn record_failure(&self, dependency: Dependency) -> u32 {
        match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(dependency).or_insert(0);
                *count += 1;
                *count
            }
            Err(_) => 0,
        }
    }

    pub fn degraded(&self) -> Vec<Dependency> {
        let mut degraded: Vec<Dependency> = match self.failures.lock() {
            Ok(failures) => failures
                .iter()
                .filter(|(_, count)| **count >= self.threshold)
                .map(|(dependency, _)| *dependency)
                .collect(),
            Err(_) => Vec::new(),
        };
        degraded.sort();
        degraded
    }

    pub fn is_healthy(&self) -> bool {
        self.degraded().is_empty()
    }
}

pub struct LogEvents {
    health: Arc<Health>,
}

impl LogEvents {
    pub fn new(health: Arc<Health>) -> Self {
        Self { health }
    }
}

impl PipelineEvents for LogEvents {
    fn vote_accepted(&self, poll_id: &str, option_id: &str, voter_id: &str) {
        debug!("Vote queued: poll={} option={} voter={}", poll_id, option_id, voter_id);
    }

    fn vote_rejected(&self, poll_id: &str, voter_id: &str, reason: &SubmitError) {
        match reason {
            SubmitError::Unavailable(_) => {
                error!("Vote from {} on poll {} failed: {}", voter_id, poll_id, reason)
            }
            _ => debug!("Vote from {} on poll {} rejected: {}", voter_id, poll_id, reason),
        }
    }

    fn dedup_release_failed(&self, key: &str, error: &StoreError) {
        warn!("Failed to release dedup key {} after a failed append: {}", key, error);
    }

    fn vote_buffered(&self, option_id: &str, pending: u64) {
        debug!("Buffer for {} is now {}", option_id, pending);
    }

    fn record_malformed(&self, partition: usize, offset: u64, error: &str) {
        error!("Skipping malformed vote record at {}:{}: {}", partition, offset, error);
    }

    fn flush_started(&self, options: usize, votes: u64) {
        info!("[Batch] Flushing {} votes across {} options...", votes, options);
    }

    fn flush_skipped(&self) {
        warn!("Flush tick missed while the previous cycle was still committing");
    }

    fn increment_committed(&self, total: &OptionTotal, delta: i64) {
        debug!(
            "Committed +{} to option {} (poll {}), total {}",
            delta, total.option_id, total.poll_id, total.total
        );
    }

    fn increment_failed(&self, option_id: &str, delta: i64, error: &StoreError) {
        error!("Dropping {} buffered votes for option {}: {}", delta, option_id, error);
    }

    fn update_published(&self, event: &UpdateEvent) {
        debug!("Published update for option {}: {}", event.option_id, event.new_count);
    }

    fn publish_failed(&self, event: &UpdateEvent, error: &LogError) {
        error!("Failed to publish update for option {}: {}", event.option_id, error);
    }

    fn broadcast_sent(&self, event: &UpdateEvent, observers: usize) {
        debug!(
            "Broadcast update for option {}: {} to {} observers",
            event.option_id, event.new_count, observers
        );
    }

    fn dependency_ok(&self, dependency: Dependency) {
        self.health.record_success(dependency);
    }

    fn dependency_failed(&self, dependency: Dependency, error: &str) {
        let count = self.health.record_failure(dependency);
        if count == self.health.threshold {
            error!("{:?} degraded after {} consecutive failures: {}", dependency, count, error);
        }
    }
}
