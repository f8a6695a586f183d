use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::envelope::{Channel, Envelope};
use crate::{BusError, BusMessage, BusResult, BusStream, PubSubTransport};

/// Handler invoked for every envelope received on a channel. Handlers run
/// inline on the subscription loop, one after another, so they must only do
/// map lookups and bounded, non-blocking sends.
pub type MessageHandler = Arc<dyn Fn(Arc<Envelope>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observable state of the subscription loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Subscribing,
    Receiving,
}

enum LoopState {
    Disconnected(Duration),
    Subscribing,
    Receiving(BusStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct BusTimings {
    pub publish_timeout: Duration,
    pub subscribe_backoff: Duration,
    pub resubscribe_pause: Duration,
    pub health_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for BusTimings {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            subscribe_backoff: Duration::from_secs(5),
            resubscribe_pause: Duration::from_secs(1),
            health_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
        }
    }
}

pub struct MessageBus {
    transport: Arc<dyn PubSubTransport>,
    instance_id: String,
    timings: BusTimings,
    handlers: RwLock<HashMap<Channel, Vec<MessageHandler>>>,
    connected: RwLock<bool>,
    state: RwLock<SubscriptionState>,
    lifecycle: Mutex<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl MessageBus {
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        instance_id: impl Into<String>,
        timings: BusTimings,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            instance_id: instance_id.into(),
            timings,
            handlers: RwLock::new(HashMap::new()),
            connected: RwLock::new(false),
            state: RwLock::new(SubscriptionState::Disconnected),
            lifecycle: Mutex::new(Lifecycle::Idle),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Like [`MessageBus::new`] but verifies the store answers a ping first.
    pub async fn connect(
        transport: Arc<dyn PubSubTransport>,
        instance_id: impl Into<String>,
        timings: BusTimings,
    ) -> BusResult<Arc<Self>> {
        match tokio::time::timeout(timings.ping_timeout, transport.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(BusError::Timeout(timings.ping_timeout)),
        }
        let bus = Self::new(transport, instance_id, timings);
        *bus.connected.write() = true;
        info!(instance_id = %bus.instance_id, "connected to shared store");
        Ok(bus)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn timings(&self) -> BusTimings {
        self.timings
    }

    /// Last observed store connectivity. Informational only; publish and
    /// subscribe report their own failures.
    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        *self.state.read()
    }

    /// Token cancelled by [`MessageBus::stop`]; lets companion tasks end with
    /// the bus.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the subscription and health-check loops. Returns `false` when the
    /// bus was already started or has been stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle != Lifecycle::Idle {
            warn!(instance_id = %self.instance_id, state = ?*lifecycle, "message bus start ignored");
            return false;
        }
        *lifecycle = Lifecycle::Running;
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).run_subscription()));
        tasks.push(tokio::spawn(Arc::clone(self).run_health_check()));
        true
    }

    /// Cancel both loops, wait for them to exit, then release the transport.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Stopped {
                return;
            }
            *lifecycle = Lifecycle::Stopped;
        }
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "message bus task ended abnormally");
            }
        }
        self.transport.close().await;
        info!(instance_id = %self.instance_id, "message bus stopped");
    }

    /// Register a handler for `channel`. Handlers run in registration order.
    pub fn subscribe<F, Fut>(&self, channel: Channel, handler: F)
    where
        F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |env: Arc<Envelope>| handler(env).boxed());
        self.handlers.write().entry(channel).or_default().push(handler);
    }

    /// Serialize `payload` into an envelope from this instance and publish it.
    /// Uses its own timeout rather than the bus lifetime, so publishes during
    /// shutdown fail fast. Not retried.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        channel: Channel,
        kind: &str,
        payload: &T,
    ) -> BusResult<usize> {
        let payload = serde_json::to_value(payload).map_err(|err| {
            warn!(%channel, kind, error = %err, "failed to encode bus payload");
            BusError::Encode(err)
        })?;
        let envelope = Envelope::new(channel, kind, &self.instance_id, payload);
        let bytes = Bytes::from(serde_json::to_vec(&envelope)?);

        let limit = self.timings.publish_timeout;
        match tokio::time::timeout(limit, self.transport.publish(channel.as_str(), bytes)).await {
            Ok(Ok(receivers)) => {
                debug!(%channel, kind, receivers, "published");
                Ok(receivers)
            }
            Ok(Err(err)) => {
                warn!(%channel, kind, error = %err, "publish failed");
                Err(err)
            }
            Err(_) => {
                warn!(%channel, kind, timeout = ?limit, "publish timed out");
                Err(BusError::Timeout(limit))
            }
        }
    }

    fn set_state(&self, state: SubscriptionState) {
        *self.state.write() = state;
    }

    fn set_connected(&self, connected: bool) {
        let mut guard = self.connected.write();
        if *guard != connected {
            *guard = connected;
            if connected {
                info!(instance_id = %self.instance_id, "shared store connection restored");
            } else {
                warn!(instance_id = %self.instance_id, "shared store connection lost");
            }
        }
    }

    async fn run_subscription(self: Arc<Self>) {
        let channels: Vec<&'static str> = Channel::ALL.iter().map(|c| c.as_str()).collect();
        let mut state = LoopState::Subscribing;
        'run: loop {
            state = match state {
                LoopState::Disconnected(pause) => {
                    self.set_state(SubscriptionState::Disconnected);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break 'run,
                        _ = tokio::time::sleep(pause) => LoopState::Subscribing,
                    }
                }
                LoopState::Subscribing => {
                    self.set_state(SubscriptionState::Subscribing);
                    let attempt = tokio::select! {
                        _ = self.shutdown.cancelled() => break 'run,
                        res = self.transport.subscribe(&channels) => res,
                    };
                    match attempt {
                        Ok(stream) => {
                            self.set_connected(true);
                            info!(channels = ?channels, "subscribed to bus channels");
                            LoopState::Receiving(stream)
                        }
                        Err(err) => {
                            warn!(
                                error = %err,
                                backoff = ?self.timings.subscribe_backoff,
                                "bus subscription failed; retrying"
                            );
                            self.set_connected(false);
                            LoopState::Disconnected(self.timings.subscribe_backoff)
                        }
                    }
                }
                LoopState::Receiving(mut stream) => {
                    self.set_state(SubscriptionState::Receiving);
                    loop {
                        let next = tokio::select! {
                            _ = self.shutdown.cancelled() => break 'run,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(msg) => self.dispatch(msg).await,
                            None => break,
                        }
                    }
                    warn!("bus subscription closed; resubscribing");
                    self.set_connected(false);
                    LoopState::Disconnected(self.timings.resubscribe_pause)
                }
            };
        }
        self.set_state(SubscriptionState::Disconnected);
        debug!(instance_id = %self.instance_id, "subscription loop exited");
    }

    async fn run_health_check(self: Arc<Self>) {
        let period = self.timings.health_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let probe = tokio::time::timeout(self.timings.ping_timeout, self.transport.ping());
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                outcome = probe => outcome,
            };
            match outcome {
                Ok(Ok(())) => self.set_connected(true),
                Ok(Err(err)) => {
                    warn!(error = %err, "bus health check failed");
                    self.set_connected(false);
                }
                Err(_) => {
                    warn!(timeout = ?self.timings.ping_timeout, "bus health check timed out");
                    self.set_connected(false);
                }
            }
        }
        debug!(instance_id = %self.instance_id, "health check loop exited");
    }

    async fn dispatch(&self, msg: BusMessage) {
        let Some(channel) = Channel::from_name(&msg.topic) else {
            debug!(topic = %msg.topic, "dropping message on unknown channel");
            return;
        };
        let envelope: Envelope = match serde_json::from_slice(&msg.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%channel, error = %err, "dropping malformed envelope");
                return;
            }
        };
        if envelope.instance_id == self.instance_id && !envelope.is_location_update() {
            return;
        }

        let handlers = self
            .handlers
            .read()
            .get(&channel)
            .cloned()
            .unwrap_or_default();
        let envelope = Arc::new(envelope);
        for handler in handlers {
            handler(Arc::clone(&envelope)).await;
        }
    }
}
