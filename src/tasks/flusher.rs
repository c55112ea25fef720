use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval};

use crate::aggregator::Aggregator;

/// Run a flush cycle every `period` until `shutdown` flips. Cycles run
/// inline, so a slow cycle delays the next tick instead of overlapping it.
pub async fn flush_task(
    aggregator: Arc<Aggregator>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Aggregator: timer started, flushing every {:?}", period);
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let started = Instant::now();
                aggregator.flush_once().await;
                if started.elapsed() >= period {
                    aggregator.events().flush_skipped();
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Aggregator: timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::UpdatePublisher;
    use crate::error::{LogError, StoreError};
    use crate::models::{UpdateEvent, VoteRecord};
    use crate::store::{CounterStore, OptionTotal};
    use crate::telemetry::{NoopEvents, PipelineEvents};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Totals(Mutex<i64>);

    #[async_trait]
    impl CounterStore for Totals {
        async fn increment_and_get(&self, option_id: &str, delta: i64) -> Result<OptionTotal, StoreError> {
            let mut total = self.0.lock().unwrap();
            *total += delta;
            Ok(OptionTotal {
                option_id: option_id.to_string(),
                poll_id: "1".to_string(),
                total: *total,
            })
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl CounterStore for Slow {
        async fn increment_and_get(&self, option_id: &str, delta: i64) -> Result<OptionTotal, StoreError> {
            tokio::time::sleep(self.0).await;
            Ok(OptionTotal {
                option_id: option_id.to_string(),
                poll_id: "1".to_string(),
                total: delta,
            })
        }
    }

    #[derive(Default)]
    struct Skips(AtomicUsize);

    impl PipelineEvents for Skips {
        fn flush_skipped(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn vote(voter_id: &str) -> VoteRecord {
        VoteRecord {
            poll_id: "1".to_string(),
            option_id: "2".to_string(),
            voter_id: voter_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    struct Discard;

    #[async_trait]
    impl UpdatePublisher for Discard {
        async fn publish(&self, _event: &UpdateEvent) -> Result<(), LogError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_each_tick_and_stops_on_shutdown() {
        let totals = Arc::new(Totals::default());
        let aggregator = Arc::new(Aggregator::new(
            totals.clone(),
            Arc::new(Discard),
            Arc::new(NoopEvents),
        ));
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(flush_task(
            Arc::clone(&aggregator),
            Duration::from_secs(2),
            shutdown,
        ));

        aggregator.ingest(&vote("u1"));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(*totals.0.lock().unwrap(), 1);
        assert!(aggregator.pending().is_empty());

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_longer_than_period_reports_skipped_tick() {
        let skips = Arc::new(Skips::default());
        let aggregator = Arc::new(
            Aggregator::new(
                Arc::new(Slow(Duration::from_secs(3))),
                Arc::new(Discard),
                skips.clone(),
            )
            .with_increment_timeout(Duration::from_secs(10)),
        );
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(flush_task(
            Arc::clone(&aggregator),
            Duration::from_secs(2),
            shutdown,
        ));

        aggregator.ingest(&vote("u1"));

        // Tick at 2s starts a cycle that runs until 5s, so the 4s tick is lost
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(skips.0.load(Ordering::SeqCst), 1);

        // The 6s tick finds nothing to flush and finishes inside its period
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(skips.0.load(Ordering::SeqCst), 1);

        stop.send(true).unwrap();
        task.await.unwrap();
    }
}
