use std::sync::Arc;

use log::info;

use crate::aggregator::Aggregator;
use crate::broker::Subscription;

/// Feed `raw-votes` deliveries into the aggregator's buffer. Offsets are
/// committed once a record is buffered; the loop ends when the log closes.
pub async fn ingest_task(aggregator: Arc<Aggregator>, mut subscription: Subscription) {
    info!("Aggregator: consuming raw votes as {}", subscription.group());

    while let Some(delivery) = subscription.next().await {
        aggregator.handle_delivery(&delivery);
        subscription.commit(&delivery);
    }

    info!("Aggregator: vote log closed, ingest stopped");
}
