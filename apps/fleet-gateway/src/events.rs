use std::sync::Arc;

use fleet_bus::{BusError, Channel};
use fleet_sdk::ContainerEvent;
use serde_json::{Value, json};

use crate::ws_manager::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEventKind {
    Created,
    Updated,
    Deleted,
    Started,
    Stopped,
    Progress,
    AgentConnected,
    AgentDisconnected,
    AgentStats,
}

impl UserEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UserEventKind::Created => "created",
            UserEventKind::Updated => "updated",
            UserEventKind::Deleted => "deleted",
            UserEventKind::Started => "started",
            UserEventKind::Stopped => "stopped",
            UserEventKind::Progress => "progress",
            UserEventKind::AgentConnected => "agent_connected",
            UserEventKind::AgentDisconnected => "agent_disconnected",
            UserEventKind::AgentStats => "agent_stats",
        }
    }

    /// Agent events travel on their own channel.
    pub fn channel(self) -> Channel {
        match self {
            UserEventKind::AgentConnected
            | UserEventKind::AgentDisconnected
            | UserEventKind::AgentStats => Channel::AgentEvents,
            _ => Channel::ContainerEvents,
        }
    }
}

/// Pushes container and agent state changes to every socket of a user,
/// whichever instance holds it.
#[derive(Clone)]
pub struct EventNotifier {
    connections: Arc<ConnectionRegistry>,
}

impl EventNotifier {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self { connections }
    }

    pub async fn notify(
        &self,
        user_id: &str,
        kind: UserEventKind,
        container: Value,
    ) -> Result<(), BusError> {
        let event = ContainerEvent::new(kind.as_str(), container);
        self.connections
            .broadcast_to_user_on(kind.channel(), user_id, kind.as_str(), &event)
            .await
    }

    pub async fn notify_container_created(
        &self,
        user_id: &str,
        container: Value,
    ) -> Result<(), BusError> {
        self.notify(user_id, UserEventKind::Created, container).await
    }

    pub async fn notify_container_updated(
        &self,
        user_id: &str,
        container: Value,
    ) -> Result<(), BusError> {
        self.notify(user_id, UserEventKind::Updated, container).await
    }

    pub async fn notify_container_deleted(
        &self,
        user_id: &str,
        container_id: &str,
        db_id: Option<&str>,
    ) -> Result<(), BusError> {
        let mut data = json!({ "id": container_id });
        if let Some(db_id) = db_id.filter(|id| !id.is_empty()) {
            data["db_id"] = json!(db_id);
        }
        self.notify(user_id, UserEventKind::Deleted, data).await
    }

    pub async fn notify_container_started(
        &self,
        user_id: &str,
        container: Value,
    ) -> Result<(), BusError> {
        self.notify(user_id, UserEventKind::Started, container).await
    }

    pub async fn notify_container_stopped(
        &self,
        user_id: &str,
        container: Value,
    ) -> Result<(), BusError> {
        self.notify(user_id, UserEventKind::Stopped, container).await
    }

    pub async fn notify_container_progress(
        &self,
        user_id: &str,
        progress: Value,
    ) -> Result<(), BusError> {
        self.notify(user_id, UserEventKind::Progress, progress).await
    }

    pub async fn notify_agent_connected(
        &self,
        user_id: &str,
        agent: Value,
    ) -> Result<(), BusError> {
        self.notify(user_id, UserEventKind::AgentConnected, agent).await
    }

    pub async fn notify_agent_disconnected(
        &self,
        user_id: &str,
        agent_id: &str,
    ) -> Result<(), BusError> {
        let data = json!({ "id": format!("agent:{agent_id}") });
        self.notify(user_id, UserEventKind::AgentDisconnected, data).await
    }

    pub async fn notify_agent_stats(
        &self,
        user_id: &str,
        agent_id: &str,
        stats: Value,
    ) -> Result<(), BusError> {
        let data = json!({ "id": format!("agent:{agent_id}"), "stats": stats });
        self.notify(user_id, UserEventKind::AgentStats, data).await
    }
}
