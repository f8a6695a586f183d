//! Local WebSocket connections and proxy sessions, bridged to the bus.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_bus::{BusError, Channel, Envelope, MessageBus};
use fleet_sdk::{ProxyFrameKind, TerminalProxyMessage, UserEventPayload};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::log_throttle::{self, ThrottleKind};
use crate::metrics;

pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PROXY_BUFFER: usize = 256;
/// Frames a connection may have queued ahead of its socket.
pub const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("socket closed")]
    Closed,
    #[error("socket write timed out after {0:?}")]
    Timeout(Duration),
    #[error("socket write failed: {0}")]
    Io(String),
    #[error("socket outbound queue is full")]
    Backlogged,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Write half of a client socket.
#[async_trait]
pub trait SocketWriter: Send {
    async fn write_text(&mut self, text: String) -> Result<(), SocketError>;
}

struct Outbound {
    text: String,
    ack: Option<oneshot::Sender<Result<(), SocketError>>>,
}

/// One local client socket. Frames go through a bounded queue drained by a
/// dedicated writer task, so they never interleave and no caller touches
/// the socket directly.
pub struct WsConnection {
    pub user_id: String,
    pub conn_id: String,
    pub created_at: DateTime<Utc>,
    last_ping_at: Mutex<DateTime<Utc>>,
    outbound: mpsc::Sender<Outbound>,
}

impl WsConnection {
    fn new(user_id: &str, conn_id: &str, writer: Box<dyn SocketWriter>) -> Self {
        let (outbound, queue) = mpsc::channel(OUTBOUND_BUFFER);
        tokio::spawn(write_loop(conn_id.to_string(), writer, queue));
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
            created_at: now,
            last_ping_at: Mutex::new(now),
            outbound,
        }
    }

    pub fn last_ping_at(&self) -> DateTime<Utc> {
        *self.last_ping_at.lock()
    }

    /// Write one text frame and wait for the socket to take it.
    pub async fn send_text(&self, text: &str) -> Result<(), SocketError> {
        let (ack, done) = oneshot::channel();
        self.outbound
            .send(Outbound {
                text: text.to_string(),
                ack: Some(ack),
            })
            .await
            .map_err(|_| SocketError::Closed)?;
        done.await.unwrap_or(Err(SocketError::Closed))
    }

    /// Queue one text frame without waiting. `Backlogged` means the queue is
    /// full and the frame was not taken.
    pub fn try_send_text(&self, text: &str) -> Result<(), SocketError> {
        self.outbound
            .try_send(Outbound {
                text: text.to_string(),
                ack: None,
            })
            .map_err(|err| match err {
                TrySendError::Full(_) => SocketError::Backlogged,
                TrySendError::Closed(_) => SocketError::Closed,
            })
    }
}

/// Drain the queue into the socket. The first failed or timed out write
/// closes the queue; later senders see `Closed`.
async fn write_loop(
    conn_id: String,
    mut writer: Box<dyn SocketWriter>,
    mut queue: mpsc::Receiver<Outbound>,
) {
    while let Some(Outbound { text, ack }) = queue.recv().await {
        let result = tokio::time::timeout(WRITE_TIMEOUT, writer.write_text(text))
            .await
            .unwrap_or(Err(SocketError::Timeout(WRITE_TIMEOUT)));
        let failed = match &result {
            Ok(()) => false,
            Err(err) => {
                debug!(conn_id = %conn_id, error = %err, "socket writer stopping");
                true
            }
        };
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        if failed {
            break;
        }
    }
}

type UserConnections = HashMap<String, Arc<WsConnection>>;

pub struct ConnectionRegistry {
    bus: Arc<MessageBus>,
    connections: RwLock<HashMap<String, UserConnections>>,
    proxy_sessions: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    proxy_buffer: usize,
}

impl ConnectionRegistry {
    /// Build the registry and subscribe its handlers for user events and
    /// terminal output.
    pub fn new(bus: Arc<MessageBus>, proxy_buffer: usize) -> Arc<Self> {
        let registry = Arc::new(Self {
            bus: Arc::clone(&bus),
            connections: RwLock::new(HashMap::new()),
            proxy_sessions: RwLock::new(HashMap::new()),
            proxy_buffer: proxy_buffer.max(1),
        });
        for channel in [Channel::ContainerEvents, Channel::AgentEvents] {
            let weak = Arc::downgrade(&registry);
            bus.subscribe(channel, move |env: Arc<Envelope>| {
                let weak: Weak<Self> = weak.clone();
                async move {
                    if let Some(registry) = weak.upgrade() {
                        registry.handle_user_event(&env);
                    }
                }
            });
        }
        let weak = Arc::downgrade(&registry);
        bus.subscribe(Channel::TerminalProxy, move |env: Arc<Envelope>| {
            let weak: Weak<Self> = weak.clone();
            async move {
                if let Some(registry) = weak.upgrade() {
                    registry.handle_terminal_proxy(&env);
                }
            }
        });
        registry
    }

    pub fn register_connection(
        &self,
        user_id: &str,
        conn_id: &str,
        writer: Box<dyn SocketWriter>,
    ) -> Arc<WsConnection> {
        let conn = Arc::new(WsConnection::new(user_id, conn_id, writer));
        let replaced = self
            .connections
            .write()
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id.to_string(), Arc::clone(&conn));
        if replaced.is_none() {
            metrics::WS_CONNECTIONS.inc();
        }
        info!(user_id, conn_id, "registered connection");
        conn
    }

    pub fn unregister_connection(&self, user_id: &str, conn_id: &str) {
        let removed = {
            let mut connections = self.connections.write();
            let removed = connections
                .get_mut(user_id)
                .and_then(|conns| conns.remove(conn_id));
            if connections.get(user_id).is_some_and(|conns| conns.is_empty()) {
                connections.remove(user_id);
            }
            removed
        };
        if removed.is_some() {
            metrics::WS_CONNECTIONS.dec();
            log_throttle::forget(ThrottleKind::BroadcastFailure, conn_id);
            info!(user_id, conn_id, "unregistered connection");
        }
    }

    /// Mark a connection as alive.
    pub fn touch(&self, user_id: &str, conn_id: &str) {
        if let Some(conn) = self.connection(user_id, conn_id) {
            *conn.last_ping_at.lock() = Utc::now();
        }
    }

    /// Write `message` to every local socket of `user_id`. Returns how many
    /// writes succeeded; connections whose write failed are pruned.
    pub async fn broadcast_to_user<T: Serialize + ?Sized>(
        &self,
        user_id: &str,
        message: &T,
    ) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                warn!(user_id, error = %err, "failed to encode broadcast");
                return 0;
            }
        };
        self.broadcast_text(user_id, &text).await
    }

    async fn broadcast_text(&self, user_id: &str, text: &str) -> usize {
        let snapshot = self.snapshot(user_id);
        if snapshot.is_empty() {
            return 0;
        }

        let results =
            futures::future::join_all(snapshot.iter().map(|conn| conn.send_text(text))).await;

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (conn, result) in snapshot.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    metrics::BROADCAST_WRITE_FAILURES.inc();
                    if log_throttle::should_log(ThrottleKind::BroadcastFailure, &conn.conn_id) {
                        warn!(user_id, conn_id = %conn.conn_id, error = %err, "broadcast write failed");
                    }
                    dead.push(conn);
                }
            }
        }
        if !dead.is_empty() {
            self.prune(user_id, &dead);
        }
        delivered
    }

    /// Queue `text` on every local socket of `user_id` without waiting for
    /// any of them. A full queue drops the frame for that socket only;
    /// closed sockets are pruned. Returns how many sockets took the frame.
    pub fn enqueue_to_user(&self, user_id: &str, text: &str) -> usize {
        let snapshot = self.snapshot(user_id);
        let mut queued = 0;
        let mut dead = Vec::new();
        for conn in &snapshot {
            match conn.try_send_text(text) {
                Ok(()) => queued += 1,
                Err(SocketError::Backlogged) => {
                    metrics::WS_OUTBOUND_DROPPED.inc();
                    if log_throttle::should_log(ThrottleKind::BroadcastFailure, &conn.conn_id) {
                        warn!(user_id, conn_id = %conn.conn_id, "socket queue full; dropping event");
                    }
                }
                Err(err) => {
                    metrics::BROADCAST_WRITE_FAILURES.inc();
                    debug!(user_id, conn_id = %conn.conn_id, error = %err, "socket gone");
                    dead.push(conn);
                }
            }
        }
        if !dead.is_empty() {
            self.prune(user_id, &dead);
        }
        queued
    }

    fn snapshot(&self, user_id: &str) -> Vec<Arc<WsConnection>> {
        self.connections
            .read()
            .get(user_id)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove connections that failed a write, unless they were replaced in
    /// the meantime.
    fn prune(&self, user_id: &str, dead: &[&Arc<WsConnection>]) {
        let mut pruned = 0;
        {
            let mut connections = self.connections.write();
            if let Some(conns) = connections.get_mut(user_id) {
                for conn in dead {
                    let still_registered = conns
                        .get(&conn.conn_id)
                        .is_some_and(|current| Arc::ptr_eq(current, conn));
                    if still_registered {
                        conns.remove(&conn.conn_id);
                        pruned += 1;
                    }
                }
                if conns.is_empty() {
                    connections.remove(user_id);
                }
            }
        }
        if pruned > 0 {
            metrics::WS_CONNECTIONS.sub(pruned);
            info!(user_id, pruned, "pruned dead connections");
        }
    }

    /// Local broadcast, then publish on the container events channel so
    /// every other instance serving `user_id` writes it too.
    pub async fn broadcast_to_user_global<T: Serialize + ?Sized>(
        &self,
        user_id: &str,
        event_type: &str,
        data: &T,
    ) -> Result<(), BusError> {
        self.broadcast_to_user_on(Channel::ContainerEvents, user_id, event_type, data)
            .await
    }

    pub async fn broadcast_to_user_on<T: Serialize + ?Sized>(
        &self,
        channel: Channel,
        user_id: &str,
        event_type: &str,
        data: &T,
    ) -> Result<(), BusError> {
        let data = serde_json::to_value(data)?;
        self.broadcast_to_user(user_id, &data).await;
        let payload = UserEventPayload {
            user_id: user_id.to_string(),
            event: event_type.to_string(),
            data,
        };
        metrics::publish_counted(&self.bus, channel, event_type, &payload)
            .await
            .map(|_| ())
    }

    /// Write to a single connection. An unknown connection is not an error.
    pub async fn send_to_connection<T: Serialize + ?Sized>(
        &self,
        user_id: &str,
        conn_id: &str,
        message: &T,
    ) -> Result<(), SocketError> {
        let Some(conn) = self.connection(user_id, conn_id) else {
            return Ok(());
        };
        let text = serde_json::to_string(message)?;
        conn.send_text(&text).await
    }

    /// Open a bounded relay for output frames addressed to `session_id`. A
    /// previous relay for the same session is closed.
    pub fn register_proxy_session(&self, session_id: &str) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(self.proxy_buffer);
        self.proxy_sessions.write().insert(session_id.to_string(), tx);
        debug!(session_id, capacity = self.proxy_buffer, "proxy session registered");
        rx
    }

    /// Close and remove the relay. Frames already buffered can still be
    /// drained by the receiver.
    pub fn unregister_proxy_session(&self, session_id: &str) -> bool {
        let removed = self.proxy_sessions.write().remove(session_id).is_some();
        if removed {
            log_throttle::forget(ThrottleKind::ProxyOverflow, session_id);
            debug!(session_id, "proxy session unregistered");
        }
        removed
    }

    /// Hand output bytes to a local proxy session without blocking. Full
    /// buffers drop the frame.
    pub fn deliver_proxy_output(&self, session_id: &str, data: Vec<u8>) -> bool {
        let Some(tx) = self.proxy_sessions.read().get(session_id).cloned() else {
            metrics::PROXY_FRAMES.with_label_values(&["orphaned"]).inc();
            return false;
        };
        match tx.try_send(data) {
            Ok(()) => {
                metrics::PROXY_FRAMES.with_label_values(&["forwarded"]).inc();
                true
            }
            Err(TrySendError::Full(_)) => {
                metrics::PROXY_FRAMES.with_label_values(&["dropped"]).inc();
                if log_throttle::should_log(ThrottleKind::ProxyOverflow, session_id) {
                    warn!(session_id, "proxy session buffer full; dropping output");
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                metrics::PROXY_FRAMES.with_label_values(&["orphaned"]).inc();
                debug!(session_id, "proxy session receiver gone");
                false
            }
        }
    }

    pub fn has_proxy_session(&self, session_id: &str) -> bool {
        self.proxy_sessions.read().contains_key(session_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().values().map(HashMap::len).sum()
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.connections.read().get(user_id).map_or(0, HashMap::len)
    }

    pub fn proxy_session_count(&self) -> usize {
        self.proxy_sessions.read().len()
    }

    fn connection(&self, user_id: &str, conn_id: &str) -> Option<Arc<WsConnection>> {
        self.connections
            .read()
            .get(user_id)
            .and_then(|conns| conns.get(conn_id))
            .cloned()
    }

    /// Runs on the bus delivery path, so it only queues frames and never
    /// waits on a socket.
    fn handle_user_event(&self, env: &Envelope) {
        let payload: UserEventPayload = match env.decode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(channel = %env.channel, error = %err, "dropping malformed user event");
                return;
            }
        };
        if payload.user_id.is_empty() {
            debug!(channel = %env.channel, "user event without user id");
            return;
        }
        let text = match serde_json::to_string(&payload.data) {
            Ok(text) => text,
            Err(err) => {
                warn!(user_id = %payload.user_id, error = %err, "failed to encode user event");
                return;
            }
        };
        self.enqueue_to_user(&payload.user_id, &text);
    }

    fn handle_terminal_proxy(&self, env: &Envelope) {
        let frame: TerminalProxyMessage = match env.decode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, origin = %env.instance_id, "dropping malformed proxy frame");
                return;
            }
        };
        if frame.kind == ProxyFrameKind::Output && self.has_proxy_session(&frame.session_id) {
            self.deliver_proxy_output(&frame.session_id, frame.data);
        }
    }
}
