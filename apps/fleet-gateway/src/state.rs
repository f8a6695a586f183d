use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use fleet_bus::{BusTimings, LocalTransport, MessageBus, PubSubTransport};
use fleet_sdk::{AgentMetadata, InMemoryLocationStore, LocationStore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admin::AdminFeed;
use crate::bus_redis::RedisTransport;
use crate::config::AppConfig;
use crate::events::EventNotifier;
use crate::location::{LocationError, LocationRegistry};
use crate::location_redis::RedisLocationStore;
use crate::terminal_proxy::{AgentFrameSink, TerminalProxy};
use crate::ws_manager::ConnectionRegistry;

pub const DEFAULT_LOCATION_REFRESH: Duration = Duration::from_secs(20);

/// Everything one instance shares between its handlers. Components are
/// subscribed to the bus on construction; the caller starts the bus.
#[derive(Clone)]
pub struct AppState {
    start: Instant,
    bus: Arc<MessageBus>,
    locations: Arc<LocationRegistry>,
    connections: Arc<ConnectionRegistry>,
    proxy: Arc<TerminalProxy>,
    notifier: EventNotifier,
    admin: Arc<AdminFeed>,
    location_refresh: Duration,
}

impl AppState {
    pub fn new(bus: Arc<MessageBus>, store: Arc<dyn LocationStore>, proxy_buffer: usize) -> Self {
        let locations = LocationRegistry::new(Arc::clone(&bus), store);
        let connections = ConnectionRegistry::new(Arc::clone(&bus), proxy_buffer);
        let proxy = TerminalProxy::new(
            Arc::clone(&bus),
            Arc::clone(&locations),
            Arc::clone(&connections),
        );
        let notifier = EventNotifier::new(Arc::clone(&connections));
        let admin = AdminFeed::new(Arc::clone(&bus));
        Self {
            start: Instant::now(),
            bus,
            locations,
            connections,
            proxy,
            notifier,
            admin,
            location_refresh: DEFAULT_LOCATION_REFRESH,
        }
    }

    pub fn with_location_refresh(mut self, period: Duration) -> Self {
        self.location_refresh = period;
        self
    }

    /// Wire the instance against Redis when configured, otherwise run alone
    /// on process-local backends.
    pub async fn from_config(cfg: &AppConfig) -> Self {
        let timings = BusTimings {
            health_interval: cfg.health_interval,
            ..BusTimings::default()
        };
        if let Some(url) = cfg.redis_url.as_deref() {
            match connect_redis(url, &cfg.instance_id, timings).await {
                Ok((bus, store)) => {
                    return Self::new(bus, store, cfg.proxy_buffer)
                        .with_location_refresh(cfg.location_refresh);
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        "failed to connect to redis; falling back to single-instance mode"
                    )
                }
            }
        } else {
            warn!("redis url missing; running single-instance with in-memory backends");
        }
        let transport: Arc<dyn PubSubTransport> = Arc::new(LocalTransport::new());
        let bus = MessageBus::new(transport, cfg.instance_id.clone(), timings);
        let store: Arc<dyn LocationStore> = InMemoryLocationStore::new();
        Self::new(bus, store, cfg.proxy_buffer).with_location_refresh(cfg.location_refresh)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn instance_id(&self) -> &str {
        self.bus.instance_id()
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    pub fn locations(&self) -> Arc<LocationRegistry> {
        Arc::clone(&self.locations)
    }

    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.connections)
    }

    pub fn proxy(&self) -> Arc<TerminalProxy> {
        Arc::clone(&self.proxy)
    }

    pub fn notifier(&self) -> EventNotifier {
        self.notifier.clone()
    }

    pub fn admin(&self) -> Arc<AdminFeed> {
        Arc::clone(&self.admin)
    }

    /// Claim an agent's control connection for this instance and route its
    /// terminal frames here. The returned refresh handle goes back to
    /// [`AppState::agent_disconnected`].
    pub async fn agent_connected(
        &self,
        agent_id: &str,
        user_id: &str,
        metadata: AgentMetadata,
        sink: Arc<dyn AgentFrameSink>,
    ) -> Result<JoinHandle<()>, LocationError> {
        self.locations
            .register_location(agent_id, user_id, metadata, Utc::now())
            .await?;
        self.proxy.attach_agent(agent_id, sink);
        info!(agent_id, user_id, "agent attached");
        Ok(self
            .locations
            .spawn_refresh(agent_id.to_string(), self.location_refresh))
    }

    pub async fn agent_disconnected(
        &self,
        agent_id: &str,
        user_id: &str,
        refresher: JoinHandle<()>,
    ) -> Result<(), LocationError> {
        refresher.abort();
        self.proxy.detach_agent(agent_id);
        self.locations.unregister_location(agent_id, user_id).await
    }
}

async fn connect_redis(
    url: &str,
    instance_id: &str,
    timings: BusTimings,
) -> Result<(Arc<MessageBus>, Arc<dyn LocationStore>), Box<dyn std::error::Error + Send + Sync>> {
    let transport: Arc<dyn PubSubTransport> = Arc::new(RedisTransport::connect(url).await?);
    let bus = MessageBus::connect(transport, instance_id, timings).await?;
    let store: Arc<dyn LocationStore> = Arc::new(RedisLocationStore::connect(url).await?);
    Ok((bus, store))
}
