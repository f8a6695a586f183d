//! Shared types for fleet instances: wire payloads carried inside bus
//! envelopes, the agent location store abstraction, and ID generation.

pub mod ids;
pub mod location_store;
pub mod messages;

pub use location_store::{
    location_key, InMemoryLocationStore, LocationStore, LocationStoreError, LOCATION_KEY_PREFIX,
    LOCATION_TTL,
};
pub use messages::{
    AgentLocationMessage, AgentMetadata, AgentStatus, ContainerEvent, ProxyFrameKind,
    TerminalProxyMessage, UserEventPayload, MSG_TERMINAL_PROXY,
};
