//! Payload shapes carried inside bus envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope type of terminal proxy frames.
pub const MSG_TERMINAL_PROXY: &str = "terminal_proxy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Connected,
    Disconnected,
}

/// Optional descriptive fields an agent reports on connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentMetadata {
    pub name: String,
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLocationMessage {
    pub agent_id: String,
    pub instance_id: String,
    pub user_id: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

impl AgentLocationMessage {
    pub fn connected(
        agent_id: impl Into<String>,
        instance_id: impl Into<String>,
        user_id: impl Into<String>,
        meta: AgentMetadata,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            instance_id: instance_id.into(),
            user_id: user_id.into(),
            status: AgentStatus::Connected,
            name: meta.name,
            os: meta.os,
            arch: meta.arch,
            connected_at: Some(Utc::now()),
        }
    }

    pub fn disconnected(
        agent_id: impl Into<String>,
        instance_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            instance_id: instance_id.into(),
            user_id: user_id.into(),
            status: AgentStatus::Disconnected,
            name: String::new(),
            os: String::new(),
            arch: String::new(),
            connected_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyFrameKind {
    Input,
    Output,
    Resize,
    Close,
    StartSession,
    StopSession,
}

impl ProxyFrameKind {
    /// Frames travelling from a viewer towards the agent's owning instance.
    pub fn is_agent_bound(self) -> bool {
        !matches!(self, ProxyFrameKind::Output)
    }
}

/// One terminal frame relayed between the instance holding a viewer and the
/// instance holding the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalProxyMessage {
    pub session_id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub kind: ProxyFrameKind,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cols: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rows: u16,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub new_session: bool,
}

impl TerminalProxyMessage {
    fn frame(agent_id: &str, session_id: &str, kind: ProxyFrameKind) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            kind,
            data: Vec::new(),
            cols: 0,
            rows: 0,
            new_session: false,
        }
    }

    pub fn input(agent_id: &str, session_id: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::frame(agent_id, session_id, ProxyFrameKind::Input)
        }
    }

    pub fn output(agent_id: &str, session_id: &str, data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::frame(agent_id, session_id, ProxyFrameKind::Output)
        }
    }

    pub fn resize(agent_id: &str, session_id: &str, cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            ..Self::frame(agent_id, session_id, ProxyFrameKind::Resize)
        }
    }

    pub fn close(agent_id: &str, session_id: &str) -> Self {
        Self::frame(agent_id, session_id, ProxyFrameKind::Close)
    }

    pub fn start_session(
        agent_id: &str,
        session_id: &str,
        cols: u16,
        rows: u16,
        new_session: bool,
    ) -> Self {
        Self {
            cols,
            rows,
            new_session,
            ..Self::frame(agent_id, session_id, ProxyFrameKind::StartSession)
        }
    }

    pub fn stop_session(agent_id: &str, session_id: &str) -> Self {
        Self::frame(agent_id, session_id, ProxyFrameKind::StopSession)
    }
}

fn is_zero(value: &u16) -> bool {
    *value == 0
}

/// Frame bytes travel as standard base64; `null` or a missing field decode to
/// an empty buffer.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Body published on the container and agent event channels; fanned out to
/// every connection of `user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEventPayload {
    pub user_id: String,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Frame written to a user's WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub container: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ContainerEvent {
    pub fn new(kind: impl Into<String>, container: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            container,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn location_message_omits_empty_metadata() {
        let msg = AgentLocationMessage::disconnected("a1", "i1", "u1");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["status"], "disconnected");
        assert!(value.get("name").is_none());
        assert!(value.get("connected_at").is_none());

        let msg = AgentLocationMessage::connected(
            "a1",
            "i1",
            "u1",
            AgentMetadata {
                name: "build-box".into(),
                os: "linux".into(),
                arch: String::new(),
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["status"], "connected");
        assert_eq!(value["name"], "build-box");
        assert!(value.get("arch").is_none());
        assert!(value["connected_at"].is_string());
    }

    #[test_timeout::timeout]
    fn proxy_frame_data_is_base64() {
        let frame = TerminalProxyMessage::output("agent-7", "s1", b"hi".to_vec());
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["data"], "aGk=");
        assert!(value.get("cols").is_none());
        assert!(value.get("new_session").is_none());
        let back: TerminalProxyMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, frame);
    }

    #[test_timeout::timeout]
    fn proxy_frame_accepts_null_or_missing_data() {
        let with_null: TerminalProxyMessage = serde_json::from_value(json!({
            "session_id": "s1", "agent_id": "a", "type": "stop_session", "data": null
        }))
        .unwrap();
        assert!(with_null.data.is_empty());

        let missing: TerminalProxyMessage = serde_json::from_value(json!({
            "session_id": "s1", "agent_id": "a", "type": "start_session",
            "cols": 80, "rows": 24, "new_session": true
        }))
        .unwrap();
        assert!(missing.data.is_empty());
        assert_eq!((missing.cols, missing.rows), (80, 24));
        assert!(missing.new_session);
    }

    #[test_timeout::timeout]
    fn proxy_frame_rejects_bad_base64() {
        let result = serde_json::from_value::<TerminalProxyMessage>(json!({
            "session_id": "s1", "agent_id": "a", "type": "input", "data": "%%%"
        }));
        assert!(result.is_err());
    }

    #[test_timeout::timeout]
    fn only_output_flows_back_to_viewers() {
        assert!(!ProxyFrameKind::Output.is_agent_bound());
        assert!(ProxyFrameKind::Input.is_agent_bound());
        assert!(ProxyFrameKind::StopSession.is_agent_bound());
    }

    #[test_timeout::timeout]
    fn user_event_payload_defaults_data() {
        let payload: UserEventPayload =
            serde_json::from_value(json!({"user_id": "u9", "event": "container_started"}))
                .unwrap();
        assert!(payload.data.is_null());
    }
}
