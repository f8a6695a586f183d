use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message type of location updates. Envelopes of this type are delivered to
/// the publishing instance's own handlers as well.
pub const MSG_AGENT_LOCATION: &str = "agent_location";

/// Fixed set of bus channels shared by every instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ContainerEvents,
    AgentEvents,
    AgentLocations,
    TerminalProxy,
    AdminEvents,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::ContainerEvents,
        Channel::AgentEvents,
        Channel::AgentLocations,
        Channel::TerminalProxy,
        Channel::AdminEvents,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Channel::ContainerEvents => "fleet:container_events",
            Channel::AgentEvents => "fleet:agent_events",
            Channel::AgentLocations => "fleet:agent_locations",
            Channel::TerminalProxy => "fleet:terminal_proxy",
            Channel::AdminEvents => "fleet:admin_events",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope wrapping every published payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub channel: String,
    pub instance_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        channel: Channel,
        kind: impl Into<String>,
        instance_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            channel: channel.as_str().to_string(),
            instance_id: instance_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Decode the payload into its type-specific shape.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    pub fn is_location_update(&self) -> bool {
        self.kind == MSG_AGENT_LOCATION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn channel_names_resolve_back() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_name(channel.as_str()), Some(channel));
        }
        assert_eq!(Channel::from_name("fleet:unknown"), None);
    }

    #[test_timeout::timeout]
    fn envelope_uses_wire_field_names() {
        let env = Envelope::new(
            Channel::AgentEvents,
            "agent_connected",
            "host-a-1",
            serde_json::json!({"user_id": "u1"}),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "agent_connected");
        assert_eq!(value["channel"], "fleet:agent_events");
        assert_eq!(value["instance_id"], "host-a-1");
        assert_eq!(value["payload"]["user_id"], "u1");
        // RFC3339 timestamp
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test_timeout::timeout]
    fn decodes_typed_payload() {
        #[derive(Deserialize)]
        struct Payload {
            user_id: String,
        }
        let env = Envelope::new(
            Channel::ContainerEvents,
            "started",
            "i1",
            serde_json::json!({"user_id": "u9"}),
        );
        let payload: Payload = env.decode().unwrap();
        assert_eq!(payload.user_id, "u9");
        assert!(!env.is_location_update());
    }
}
