use log::info;

use crate::broker::Subscription;
use crate::fanout::FanOut;

/// Push every `poll-updates` record to connected observers until the log
/// closes.
pub async fn fanout_task(fanout: FanOut, mut subscription: Subscription) {
    info!("Fan-out: consuming poll updates as {}", subscription.group());

    while let Some(delivery) = subscription.next().await {
        fanout.handle_delivery(&delivery);
        subscription.commit(&delivery);
    }

    info!("Fan-out: update log closed, broadcasting stopped");
}
