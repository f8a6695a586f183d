//! Terminal frame routing between the instance holding a viewer and the
//! instance holding the agent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fleet_bus::{BusError, Channel, Envelope, MessageBus};
use fleet_sdk::{MSG_TERMINAL_PROXY, ProxyFrameKind, TerminalProxyMessage};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::location::LocationRegistry;
use crate::metrics;
use crate::ws_manager::ConnectionRegistry;

/// Session id used when agent output is not tied to one session.
pub const BROADCAST_SESSION: &str = "broadcast";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("agent {0} is not connected to any instance")]
    AgentOffline(String),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Control connection of an agent attached to this instance. Deliveries run
/// on the bus delivery path and must not block.
#[async_trait]
pub trait AgentFrameSink: Send + Sync {
    async fn deliver(&self, frame: TerminalProxyMessage) -> Result<(), ProxyError>;
}

type SessionKey = (String, String);

pub struct TerminalProxy {
    bus: Arc<MessageBus>,
    locations: Arc<LocationRegistry>,
    connections: Arc<ConnectionRegistry>,
    sinks: RwLock<HashMap<String, Arc<dyn AgentFrameSink>>>,
    // (agent, session) -> origin instances with a viewer attached
    remote_viewers: Mutex<HashMap<SessionKey, HashSet<String>>>,
}

impl TerminalProxy {
    pub fn new(
        bus: Arc<MessageBus>,
        locations: Arc<LocationRegistry>,
        connections: Arc<ConnectionRegistry>,
    ) -> Arc<Self> {
        let proxy = Arc::new(Self {
            bus: Arc::clone(&bus),
            locations,
            connections,
            sinks: RwLock::new(HashMap::new()),
            remote_viewers: Mutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&proxy);
        bus.subscribe(Channel::TerminalProxy, move |env: Arc<Envelope>| {
            let weak: Weak<Self> = weak.clone();
            async move {
                if let Some(proxy) = weak.upgrade() {
                    proxy.handle_agent_bound(&env).await;
                }
            }
        });
        proxy
    }

    pub fn attach_agent(&self, agent_id: &str, sink: Arc<dyn AgentFrameSink>) {
        self.sinks.write().insert(agent_id.to_string(), sink);
    }

    pub fn detach_agent(&self, agent_id: &str) {
        self.sinks.write().remove(agent_id);
        self.remote_viewers
            .lock()
            .retain(|(agent, _), _| agent != agent_id);
    }

    /// Route a viewer's frame to the agent: straight to the sink when the agent
    /// is attached here, over the bus when another instance owns it.
    pub async fn send_to_agent(&self, frame: TerminalProxyMessage) -> Result<(), ProxyError> {
        if let Some(sink) = self.sink(&frame.agent_id) {
            return sink.deliver(frame).await;
        }
        match self.locations.get_location(&frame.agent_id).await {
            Some(owner) if owner != self.bus.instance_id() => {
                metrics::publish_counted(
                    &self.bus,
                    Channel::TerminalProxy,
                    MSG_TERMINAL_PROXY,
                    &frame,
                )
                .await?;
                Ok(())
            }
            _ => Err(ProxyError::AgentOffline(frame.agent_id)),
        }
    }

    /// Relay output of a locally attached agent to its viewers, local ones
    /// directly and remote ones over the bus.
    pub async fn publish_output(
        &self,
        agent_id: &str,
        session_id: &str,
        data: Vec<u8>,
    ) -> Result<(), ProxyError> {
        let session_id = if session_id.is_empty() {
            BROADCAST_SESSION
        } else {
            session_id
        };
        if self.connections.has_proxy_session(session_id) {
            self.connections
                .deliver_proxy_output(session_id, data.clone());
        }
        let frame = TerminalProxyMessage::output(agent_id, session_id, data);
        metrics::publish_counted(&self.bus, Channel::TerminalProxy, MSG_TERMINAL_PROXY, &frame)
            .await?;
        Ok(())
    }

    pub fn remote_viewer_count(&self, agent_id: &str, session_id: &str) -> usize {
        self.remote_viewers
            .lock()
            .get(&(agent_id.to_string(), session_id.to_string()))
            .map_or(0, HashSet::len)
    }

    fn sink(&self, agent_id: &str) -> Option<Arc<dyn AgentFrameSink>> {
        self.sinks.read().get(agent_id).cloned()
    }

    async fn handle_agent_bound(&self, env: &Envelope) {
        let frame: TerminalProxyMessage = match env.decode() {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "terminal proxy frame not decodable here");
                return;
            }
        };
        if !frame.kind.is_agent_bound() {
            return;
        }
        let Some(sink) = self.sink(&frame.agent_id) else {
            return;
        };

        let key = (frame.agent_id.clone(), frame.session_id.clone());
        match frame.kind {
            ProxyFrameKind::StartSession => {
                self.remote_viewers
                    .lock()
                    .entry(key)
                    .or_default()
                    .insert(env.instance_id.clone());
            }
            ProxyFrameKind::StopSession => {
                let remaining = {
                    let mut viewers = self.remote_viewers.lock();
                    let remaining = viewers.get_mut(&key).map_or(0, |origins| {
                        origins.remove(&env.instance_id);
                        origins.len()
                    });
                    if remaining == 0 {
                        viewers.remove(&key);
                    }
                    remaining
                };
                if remaining > 0 {
                    debug!(
                        agent_id = %frame.agent_id,
                        session_id = %frame.session_id,
                        remaining,
                        "remote viewers remain; keeping session"
                    );
                    return;
                }
            }
            _ => {}
        }

        let agent_id = frame.agent_id.clone();
        if let Err(err) = sink.deliver(frame).await {
            warn!(agent_id = %agent_id, origin = %env.instance_id, error = %err, "failed to deliver proxied frame");
        }
    }
}
