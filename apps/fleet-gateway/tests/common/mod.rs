#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_bus::{BusTimings, LocalTransport, MessageBus, PubSubTransport, SubscriptionState};
use fleet_gateway::state::AppState;
use fleet_gateway::terminal_proxy::{AgentFrameSink, ProxyError};
use fleet_gateway::ws_manager::{SocketError, SocketWriter};
use fleet_sdk::{InMemoryLocationStore, LocationStore, ProxyFrameKind, TerminalProxyMessage};
use parking_lot::Mutex;

pub async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Two or more instances sharing one transport and one location store.
pub struct Fleet {
    pub transport: Arc<LocalTransport>,
    pub store: Arc<InMemoryLocationStore>,
}

impl Fleet {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(LocalTransport::new()),
            store: InMemoryLocationStore::new(),
        }
    }

    pub async fn instance(&self, id: &str) -> AppState {
        let bus = MessageBus::new(
            Arc::clone(&self.transport) as Arc<dyn PubSubTransport>,
            id,
            BusTimings::default(),
        );
        let state = AppState::new(
            bus,
            Arc::clone(&self.store) as Arc<dyn LocationStore>,
            256,
        );
        let bus = state.bus();
        bus.start();
        let probe = Arc::clone(&bus);
        wait_until(move || probe.subscription_state() == SubscriptionState::Receiving).await;
        state
    }
}

#[derive(Clone, Default)]
pub struct RecordingSocket {
    frames: Arc<Mutex<Vec<String>>>,
}

impl RecordingSocket {
    pub fn boxed(&self) -> Box<dyn SocketWriter> {
        Box::new(self.clone())
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }
}

#[async_trait]
impl SocketWriter for RecordingSocket {
    async fn write_text(&mut self, text: String) -> Result<(), SocketError> {
        self.frames.lock().push(text);
        Ok(())
    }
}

/// Socket whose writes never complete, like a client that stopped reading.
pub struct WedgedSocket;

#[async_trait]
impl SocketWriter for WedgedSocket {
    async fn write_text(&mut self, _text: String) -> Result<(), SocketError> {
        std::future::pending().await
    }
}

#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<TerminalProxyMessage>>,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<TerminalProxyMessage> {
        self.frames.lock().clone()
    }

    pub fn kinds(&self) -> Vec<ProxyFrameKind> {
        self.frames.lock().iter().map(|f| f.kind).collect()
    }
}

#[async_trait]
impl AgentFrameSink for RecordingSink {
    async fn deliver(&self, frame: TerminalProxyMessage) -> Result<(), ProxyError> {
        self.frames.lock().push(frame);
        Ok(())
    }
}
