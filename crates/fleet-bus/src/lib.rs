//! Cross-instance message bus: a thin pub/sub transport abstraction plus the
//! [`MessageBus`] that owns subscription lifecycle, reconnection and health
//! checking for one fleet instance.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::StreamExt;
use tracing::warn;

pub mod envelope;
pub mod hub;

pub use envelope::{Channel, Envelope, MSG_AGENT_LOCATION};
pub use hub::{BusTimings, MessageBus, MessageHandler, SubscriptionState};

/// Raw message as carried by a transport: the channel it arrived on and the
/// undecoded envelope bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("bus operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;

/// Stream of inbound messages for a subscription. The stream ending means the
/// transport dropped the subscription and the caller should resubscribe.
pub type BusStream = Pin<Box<dyn Stream<Item = BusMessage> + Send + 'static>>;

#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Publish raw bytes on `channel`; returns the number of receivers the
    /// store reports.
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize>;
    async fn subscribe(&self, channels: &[&str]) -> BusResult<BusStream>;
    async fn ping(&self) -> BusResult<()>;
    async fn close(&self) {}
}

/// Process-local transport. Several [`MessageBus`] instances sharing one
/// `LocalTransport` behave like fleet instances sharing a store.
#[derive(Debug)]
pub struct LocalTransport {
    sender: parking_lot::RwLock<broadcast::Sender<BusMessage>>,
    available: AtomicBool,
    capacity: usize,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sender: parking_lot::RwLock::new(broadcast::channel(capacity).0),
            available: AtomicBool::new(true),
            capacity,
        }
    }

    /// Simulate a store outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop every live subscription, as a store restart would.
    pub fn sever(&self) {
        *self.sender.write() = broadcast::channel(self.capacity).0;
    }

    fn check_available(&self) -> BusResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Transport("local transport unavailable".into()))
        }
    }
}

#[async_trait]
impl PubSubTransport for LocalTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize> {
        self.check_available()?;
        let sender = self.sender.read().clone();
        // No receivers is not an error for pub/sub, same as Redis returning 0.
        Ok(sender
            .send(BusMessage {
                topic: channel.to_string(),
                payload,
            })
            .unwrap_or(0))
    }

    async fn subscribe(&self, channels: &[&str]) -> BusResult<BusStream> {
        self.check_available()?;
        let wanted: HashSet<String> = channels.iter().map(|c| c.to_string()).collect();
        let rx = self.sender.read().subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(msg) if wanted.contains(&msg.topic) => Some(msg),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "local transport subscriber lagged; messages lost");
                None
            }
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> BusResult<()> {
        self.check_available()
    }
}
