use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use fleet_bus::{BusError, Channel, Envelope, MessageBus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::metrics;

pub const ADMIN_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Fleet-wide admin event stream. Slow subscribers lag and lose events; they
/// never hold up publishers.
pub struct AdminFeed {
    bus: Arc<MessageBus>,
    tx: broadcast::Sender<AdminEvent>,
}

impl AdminFeed {
    pub fn new(bus: Arc<MessageBus>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(ADMIN_FEED_CAPACITY);
        let feed = Arc::new(Self {
            bus: Arc::clone(&bus),
            tx,
        });
        let weak = Arc::downgrade(&feed);
        bus.subscribe(Channel::AdminEvents, move |env: Arc<Envelope>| {
            let weak: Weak<Self> = weak.clone();
            async move {
                if let Some(feed) = weak.upgrade() {
                    feed.handle_remote(&env);
                }
            }
        });
        feed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdminEvent> {
        self.tx.subscribe()
    }

    /// Emit locally, then publish so admins on other instances see it too.
    pub async fn publish(&self, kind: &str, payload: Value) -> Result<(), BusError> {
        let event = AdminEvent {
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.emit(event.clone());
        metrics::publish_counted(&self.bus, Channel::AdminEvents, kind, &event)
            .await
            .map(|_| ())
    }

    fn emit(&self, event: AdminEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    fn handle_remote(&self, env: &Envelope) {
        match env.decode::<AdminEvent>() {
            Ok(event) => {
                debug!(kind = %event.kind, origin = %env.instance_id, "admin event received");
                self.emit(event);
            }
            Err(err) => warn!(error = %err, "dropping malformed admin event"),
        }
    }
}
