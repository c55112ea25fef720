use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::broker::Delivery;
use crate::models::UpdateEvent;
use crate::telemetry::PipelineEvents;

const OBSERVER_QUEUE: usize = 64;

/// Broadcast port: push one update to every connected observer.
pub trait Broadcaster: Send + Sync {
    /// Returns how many observers the update was handed to.
    fn broadcast(&self, event: &UpdateEvent) -> usize;
}

#[derive(Serialize)]
struct ObserverMessage<'a> {
    event: &'a str,
    data: &'a UpdateEvent,
}

/// A connected observer's end of the hub.
pub struct Observer {
    pub id: u64,
    receiver: mpsc::Receiver<String>,
}

impl Observer {
    /// Next serialized message, or `None` once the hub dropped this observer.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// Registry of connected observers. Each observer has its own bounded
/// queue: a full queue drops that observer's copy of the update, a closed
/// queue unregisters it, and neither affects anyone else.
pub struct ObserverHub {
    event_name: String,
    next_id: AtomicU64,
    observers: Mutex<HashMap<u64, mpsc::Sender<String>>>,
}

impl ObserverHub {
    pub fn new(event_name: &str) -> Self {
        Self {
            event_name: event_name.to_string(),
            next_id: AtomicU64::new(1),
            observers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self) -> Observer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(OBSERVER_QUEUE);
        if let Ok(mut observers) = self.observers.lock() {
            observers.insert(id, sender);
        }
        Observer { id, receiver }
    }

    pub fn unregister(&self, id: u64) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.remove(&id);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().map(|o| o.len()).unwrap_or(0)
    }
}

impl Broadcaster for ObserverHub {
    fn broadcast(&self, event: &UpdateEvent) -> usize {
        let message = ObserverMessage {
            event: &self.event_name,
            data: event,
        };
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(_) => return 0,
        };

        let Ok(mut observers) = self.observers.lock() else {
            return 0;
        };

        let mut delivered = 0;
        observers.retain(|_, sender| match sender.try_send(text.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }
}

/// Consumer side of the `poll-updates` topic.
pub struct FanOut {
    broadcaster: Arc<dyn Broadcaster>,
    events: Arc<dyn PipelineEvents>,
}

impl FanOut {
    pub fn new(broadcaster: Arc<dyn Broadcaster>, events: Arc<dyn PipelineEvents>) -> Self {
        Self {
            broadcaster,
            events,
        }
    }

    pub fn handle_delivery(&self, delivery: &Delivery) -> Option<usize> {
        match serde_json::from_slice::<UpdateEvent>(&delivery.record.value) {
            Ok(event) => {
                let observers = self.broadcaster.broadcast(&event);
                self.events.broadcast_sent(&event, observers);
                Some(observers)
            }
            Err(e) => {
                self.events
                    .record_malformed(delivery.partition, delivery.offset, &e.to_string());
                None
            }
        }
    }
}
