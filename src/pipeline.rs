use std::sync::Arc;

use log::{error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregator::{Aggregator, FlushReport};
use crate::broker::{Broker, StartFrom, TopicWriter};
use crate::config::{
    AGGREGATOR_GROUP, Config, DASHBOARD_GROUP, POLL_STATS_EVENT, POLL_UPDATES_TOPIC,
    RAW_VOTES_TOPIC,
};
use crate::error::LogError;
use crate::fanout::{FanOut, ObserverHub};
use crate::gateway::VoteGateway;
use crate::handlers::AppState;
use crate::store::{CounterStore, DedupStore, PollCatalog};
use crate::tasks::{fanout::fanout_task, flusher::flush_task, ingest::ingest_task};
use crate::telemetry::{Health, LogEvents, PipelineEvents};

/// External stores the pipeline is built on.
pub struct Stores {
    pub dedup: Arc<dyn DedupStore>,
    pub counters: Arc<dyn CounterStore>,
    pub catalog: Option<Arc<dyn PollCatalog>>,
}

/// The running pipeline: gateway in front, aggregator and fan-out loops
/// behind the broker.
pub struct Pipeline {
    pub broker: Arc<Broker>,
    pub gateway: Arc<VoteGateway>,
    pub aggregator: Arc<Aggregator>,
    pub hub: Arc<ObserverHub>,
    pub health: Arc<Health>,
    stop_flusher: watch::Sender<bool>,
    ingest: JoinHandle<()>,
    flusher: JoinHandle<()>,
    fanout: JoinHandle<()>,
}

impl Pipeline {
    pub fn start(config: &Config, stores: Stores) -> Result<Self, LogError> {
        let health = Arc::new(Health::new(config.unhealthy_after));
        let events: Arc<dyn PipelineEvents> = Arc::new(LogEvents::new(Arc::clone(&health)));
        Self::start_with_events(config, stores, health, events)
    }

    pub fn start_with_events(
        config: &Config,
        stores: Stores,
        health: Arc<Health>,
        events: Arc<dyn PipelineEvents>,
    ) -> Result<Self, LogError> {
        let broker = Arc::new(Broker::new(
            &[RAW_VOTES_TOPIC, POLL_UPDATES_TOPIC],
            config.log_partitions,
        ));

        let mut gateway = VoteGateway::new(
            stores.dedup,
            Arc::new(TopicWriter::new(Arc::clone(&broker), RAW_VOTES_TOPIC)),
            Arc::clone(&events),
        )
        .with_dedup_ttl(config.dedup_ttl);
        if let Some(catalog) = stores.catalog {
            gateway = gateway.with_catalog(catalog);
        }

        let aggregator = Arc::new(
            Aggregator::new(
                stores.counters,
                Arc::new(TopicWriter::new(Arc::clone(&broker), POLL_UPDATES_TOPIC)),
                Arc::clone(&events),
            )
            .with_increment_timeout(config.increment_timeout),
        );

        let hub = Arc::new(ObserverHub::new(POLL_STATS_EVENT));
        let fanout = FanOut::new(hub.clone(), Arc::clone(&events));

        let votes = broker.subscribe(RAW_VOTES_TOPIC, AGGREGATOR_GROUP, StartFrom::Committed)?;
        let updates = broker.subscribe(POLL_UPDATES_TOPIC, DASHBOARD_GROUP, StartFrom::Latest)?;

        let (stop_flusher, shutdown) = watch::channel(false);
        let ingest = tokio::spawn(ingest_task(Arc::clone(&aggregator), votes));
        let flusher = tokio::spawn(flush_task(
            Arc::clone(&aggregator),
            config.flush_interval,
            shutdown,
        ));
        let fanout = tokio::spawn(fanout_task(fanout, updates));

        Ok(Self {
            broker,
            gateway: Arc::new(gateway),
            aggregator,
            hub,
            health,
            stop_flusher,
            ingest,
            flusher,
            fanout,
        })
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            gateway: Arc::clone(&self.gateway),
            hub: Arc::clone(&self.hub),
            health: Arc::clone(&self.health),
        })
    }

    /// Stop taking votes, drain what was logged, run a final flush and let
    /// the fan-out deliver its updates.
    pub async fn shutdown(self) -> FlushReport {
        info!("Pipeline shutting down...");

        let _ = self.broker.close_topic(RAW_VOTES_TOPIC);
        if let Err(e) = self.ingest.await {
            error!("Ingest task failed: {}", e);
        }

        let _ = self.stop_flusher.send(true);
        if let Err(e) = self.flusher.await {
            error!("Flush task failed: {}", e);
        }

        let report = self.aggregator.flush_once().await;
        info!("Final flush committed {} options", report.updates.len());

        let _ = self.broker.close_topic(POLL_UPDATES_TOPIC);
        if let Err(e) = self.fanout.await {
            error!("Fan-out task failed: {}", e);
        }

        report
    }
}
