//! Write-behind vote aggregation.
//!
//! Votes consumed from the log only bump an in-memory counter per option.
//! A flush cycle swaps the buffer out under the lock, commits each option's
//! count with one atomic increment, and publishes the new total. A failed
//! increment drops that option's count for the cycle.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinSet;

use crate::broker::{Delivery, TopicWriter};
use crate::error::{LogError, StoreError};
use crate::models::{UpdateEvent, VoteRecord};
use crate::store::CounterStore;
use crate::telemetry::{Dependency, PipelineEvents};

pub const DEFAULT_INCREMENT_TIMEOUT: Duration = Duration::from_secs(1);

#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    async fn publish(&self, event: &UpdateEvent) -> Result<(), LogError>;
}

#[async_trait]
impl UpdatePublisher for TopicWriter {
    async fn publish(&self, event: &UpdateEvent) -> Result<(), LogError> {
        self.write(&event.poll_id, event).map(|_| ())
    }
}

/// What one flush cycle did.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub updates: Vec<UpdateEvent>,
    pub failed: Vec<String>,
    pub dropped_votes: u64,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.failed.is_empty()
    }
}

enum Outcome {
    Committed(UpdateEvent),
    Failed { option_id: String, delta: u64 },
}

pub struct Aggregator {
    buffer: Mutex<HashMap<String, u64>>,
    // Held for a whole cycle so cycles run one after another
    cycle: tokio::sync::Mutex<()>,
    counters: Arc<dyn CounterStore>,
    publisher: Arc<dyn UpdatePublisher>,
    events: Arc<dyn PipelineEvents>,
    increment_timeout: Duration,
}

impl Aggregator {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        publisher: Arc<dyn UpdatePublisher>,
        events: Arc<dyn PipelineEvents>,
    ) -> Self {
        Self {
            buffer: Mutex::new(HashMap::new()),
            cycle: tokio::sync::Mutex::new(()),
            counters,
            publisher,
            events,
            increment_timeout: DEFAULT_INCREMENT_TIMEOUT,
        }
    }

    pub fn with_increment_timeout(mut self, timeout: Duration) -> Self {
        self.increment_timeout = timeout;
        self
    }

    pub fn events(&self) -> &Arc<dyn PipelineEvents> {
        &self.events
    }

    fn lock_buffer(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        // Every critical section is a single insert or a swap, so a poisoned
        // buffer is still consistent.
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one vote. Returns the option's pending count.
    pub fn ingest(&self, record: &VoteRecord) -> u64 {
        let pending = {
            let mut buffer = self.lock_buffer();
            let count = buffer.entry(record.option_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.events.vote_buffered(&record.option_id, pending);
        pending
    }

    /// Decode a `raw-votes` delivery and count it. Malformed records are
    /// reported and skipped.
    pub fn handle_delivery(&self, delivery: &Delivery) -> bool {
        match serde_json::from_slice::<VoteRecord>(&delivery.record.value) {
            Ok(record) if !record.option_id.is_empty() => {
                self.ingest(&record);
                true
            }
            Ok(_) => {
                self.events
                    .record_malformed(delivery.partition, delivery.offset, "missing optionId");
                false
            }
            Err(e) => {
                self.events
                    .record_malformed(delivery.partition, delivery.offset, &e.to_string());
                false
            }
        }
    }

    /// Copy of the counts not yet flushed.
    pub fn pending(&self) -> HashMap<String, u64> {
        self.lock_buffer().clone()
    }

    fn take_buffer(&self) -> HashMap<String, u64> {
        std::mem::take(&mut *self.lock_buffer())
    }

    /// Run one flush cycle. Increments for different options are issued
    /// concurrently; the cycle returns once all of them have finished.
    pub async fn flush_once(self: &Arc<Self>) -> FlushReport {
        let _cycle = self.cycle.lock().await;

        let snapshot = self.take_buffer();
        if snapshot.is_empty() {
            return FlushReport::default();
        }

        let votes: u64 = snapshot.values().sum();
        self.events.flush_started(snapshot.len(), votes);

        let mut commits = JoinSet::new();
        for (option_id, delta) in snapshot {
            let this = Arc::clone(self);
            commits.spawn(async move {
                let commit = AssertUnwindSafe(this.commit_option(option_id.clone(), delta));
                match commit.catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => this.commit_panicked(option_id, delta),
                }
            });
        }

        let mut report = FlushReport::default();
        while let Some(joined) = commits.join_next().await {
            match joined {
                Ok(Outcome::Committed(event)) => report.updates.push(event),
                Ok(Outcome::Failed { option_id, delta }) => {
                    report.failed.push(option_id);
                    report.dropped_votes += delta;
                }
                Err(e) => {
                    self.events
                        .dependency_failed(Dependency::CounterStore, &e.to_string());
                }
            }
        }

        report
    }

    fn commit_panicked(&self, option_id: String, delta: u64) -> Outcome {
        let error = StoreError::Unavailable("increment task panicked".to_string());
        self.events
            .dependency_failed(Dependency::CounterStore, &error.to_string());
        self.events
            .increment_failed(&option_id, i64::try_from(delta).unwrap_or(i64::MAX), &error);
        Outcome::Failed { option_id, delta }
    }

    async fn commit_option(&self, option_id: String, delta: u64) -> Outcome {
        let signed_delta = i64::try_from(delta).unwrap_or(i64::MAX);

        // A timeout drops this future only. A statement the store already
        // started may still commit after the option is reported dropped.
        let increment = self.counters.increment_and_get(&option_id, signed_delta);
        let result = match tokio::time::timeout(self.increment_timeout, increment).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        let total = match result {
            Ok(total) => total,
            Err(e) => {
                // Unknown options are a data problem, not a sick store
                if !matches!(e, StoreError::NotFound(_)) {
                    self.events
                        .dependency_failed(Dependency::CounterStore, &e.to_string());
                }
                self.events.increment_failed(&option_id, signed_delta, &e);
                return Outcome::Failed { option_id, delta };
            }
        };
        self.events.dependency_ok(Dependency::CounterStore);
        self.events.increment_committed(&total, signed_delta);

        let event = UpdateEvent {
            option_id: total.option_id,
            poll_id: total.poll_id,
            new_count: total.total,
        };

        // The count is already durable; a lost update event only delays
        // observers until the option's next flush.
        match self.publisher.publish(&event).await {
            Ok(()) => {
                self.events.dependency_ok(Dependency::VoteLog);
                self.events.update_published(&event);
            }
            Err(e) => {
                self.events.dependency_failed(Dependency::VoteLog, &e.to_string());
                self.events.publish_failed(&event, &e);
            }
        }

        Outcome::Committed(event)
    }
}
