//! Agent ownership: which instance holds each agent's control connection.
//!
//! The shared store is authoritative and self-heals through TTL expiry. Each
//! instance fronts it with a cache kept current by location updates on the
//! bus, which every instance (the publisher included) applies.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_bus::{BusError, Channel, Envelope, MSG_AGENT_LOCATION, MessageBus};
use fleet_sdk::{
    AgentLocationMessage, AgentMetadata, AgentStatus, LOCATION_TTL, LocationStore,
    LocationStoreError, location_key,
};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics;

pub const STORE_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LocationError {
    #[error(transparent)]
    Store(#[from] LocationStoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("location record for agent {0} has expired")]
    Missing(String),
}

#[derive(Debug, Clone)]
struct CachedOwner {
    instance_id: String,
    confirmed_at: Instant,
}

pub struct LocationRegistry {
    bus: Arc<MessageBus>,
    store: Arc<dyn LocationStore>,
    cache: RwLock<HashMap<String, CachedOwner>>,
    /// Agents registered here and not yet unregistered.
    owned: RwLock<HashSet<String>>,
}

impl LocationRegistry {
    /// Build the registry and subscribe it to location updates on `bus`.
    pub fn new(bus: Arc<MessageBus>, store: Arc<dyn LocationStore>) -> Arc<Self> {
        let registry = Arc::new(Self {
            bus: Arc::clone(&bus),
            store,
            cache: RwLock::new(HashMap::new()),
            owned: RwLock::new(HashSet::new()),
        });
        let weak: Weak<Self> = Arc::downgrade(&registry);
        bus.subscribe(Channel::AgentLocations, move |env: Arc<Envelope>| {
            let weak = weak.clone();
            async move {
                if let Some(registry) = weak.upgrade() {
                    registry.handle_location_update(&env);
                }
            }
        });
        registry
    }

    pub fn instance_id(&self) -> &str {
        self.bus.instance_id()
    }

    /// Claim `agent_id` for this instance and announce it to the fleet.
    pub async fn register_location(
        &self,
        agent_id: &str,
        user_id: &str,
        metadata: AgentMetadata,
        connected_at: DateTime<Utc>,
    ) -> Result<(), LocationError> {
        let instance_id = self.instance_id().to_string();
        with_timeout(
            STORE_WRITE_TIMEOUT,
            self.store
                .put(&location_key(agent_id), &instance_id, LOCATION_TTL),
        )
        .await?;
        self.owned.write().insert(agent_id.to_string());
        self.cache_owner(agent_id, &instance_id);

        let mut message =
            AgentLocationMessage::connected(agent_id, &instance_id, user_id, metadata);
        message.connected_at = Some(connected_at);
        metrics::publish_counted(
            &self.bus,
            Channel::AgentLocations,
            MSG_AGENT_LOCATION,
            &message,
        )
        .await?;
        info!(agent_id, user_id, instance_id = %instance_id, "agent location registered");
        Ok(())
    }

    /// Release `agent_id`. The record is only deleted while it still names
    /// this instance, so a late unregister cannot remove a newer owner. A
    /// failed delete is logged and left to TTL expiry; the disconnect is
    /// announced regardless.
    pub async fn unregister_location(
        &self,
        agent_id: &str,
        user_id: &str,
    ) -> Result<(), LocationError> {
        self.owned.write().remove(agent_id);
        let instance_id = self.instance_id().to_string();
        match with_timeout(
            STORE_WRITE_TIMEOUT,
            self.store.delete_if(&location_key(agent_id), &instance_id),
        )
        .await
        {
            Ok(true) => {}
            Ok(false) => debug!(agent_id, "location record already gone or owned elsewhere"),
            Err(err) => {
                warn!(agent_id, error = %err, "failed to delete agent location; waiting for ttl");
            }
        }
        self.evict_if_owner(agent_id, &instance_id);

        let message = AgentLocationMessage::disconnected(agent_id, &instance_id, user_id);
        metrics::publish_counted(
            &self.bus,
            Channel::AgentLocations,
            MSG_AGENT_LOCATION,
            &message,
        )
        .await?;
        info!(agent_id, user_id, "agent location unregistered");
        Ok(())
    }

    /// Re-arm the record's TTL. `Missing` means the record already expired and
    /// the agent must be registered again.
    pub async fn refresh_location(&self, agent_id: &str) -> Result<(), LocationError> {
        let alive = with_timeout(
            STORE_WRITE_TIMEOUT,
            self.store.expire(&location_key(agent_id), LOCATION_TTL),
        )
        .await?;
        if !alive {
            return Err(LocationError::Missing(agent_id.to_string()));
        }
        let instance_id = self.instance_id().to_string();
        self.cache_owner(agent_id, &instance_id);
        debug!(agent_id, "agent location refreshed");
        Ok(())
    }

    /// Owning instance of `agent_id`, if any. Store failures are logged and
    /// reported as not found.
    pub async fn get_location(&self, agent_id: &str) -> Option<String> {
        let cached = self.cache.read().get(agent_id).cloned();
        if let Some(entry) = cached {
            if entry.confirmed_at.elapsed() < LOCATION_TTL {
                metrics::LOCATION_LOOKUPS.with_label_values(&["cache"]).inc();
                return Some(entry.instance_id);
            }
        }

        match with_timeout(LOOKUP_TIMEOUT, self.store.get(&location_key(agent_id))).await {
            Ok(Some(instance_id)) => {
                metrics::LOCATION_LOOKUPS.with_label_values(&["store"]).inc();
                self.cache_owner(agent_id, &instance_id);
                Some(instance_id)
            }
            Ok(None) => {
                metrics::LOCATION_LOOKUPS.with_label_values(&["miss"]).inc();
                self.cache.write().remove(agent_id);
                None
            }
            Err(err) => {
                metrics::LOCATION_LOOKUPS.with_label_values(&["error"]).inc();
                warn!(agent_id, error = %err, "agent location lookup failed");
                None
            }
        }
    }

    pub async fn is_local(&self, agent_id: &str) -> bool {
        self.get_location(agent_id).await.as_deref() == Some(self.instance_id())
    }

    /// Cache-only view, without consulting the store.
    pub fn cached_location(&self, agent_id: &str) -> Option<String> {
        self.cache
            .read()
            .get(agent_id)
            .map(|entry| entry.instance_id.clone())
    }

    /// Refresh `agent_id` every `period` until the handle is aborted or the
    /// bus stops.
    pub fn spawn_refresh(self: &Arc<Self>, agent_id: String, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let shutdown = self.bus.shutdown_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match registry.refresh_location(&agent_id).await {
                    Ok(()) => {}
                    Err(LocationError::Missing(_)) => {
                        warn!(agent_id = %agent_id, "agent location expired before refresh; re-register required");
                    }
                    Err(err) => {
                        warn!(agent_id = %agent_id, error = %err, "agent location refresh failed");
                    }
                }
            }
        })
    }

    fn cache_owner(&self, agent_id: &str, instance_id: &str) {
        self.cache.write().insert(
            agent_id.to_string(),
            CachedOwner {
                instance_id: instance_id.to_string(),
                confirmed_at: Instant::now(),
            },
        );
    }

    fn evict_if_owner(&self, agent_id: &str, instance_id: &str) -> bool {
        let mut cache = self.cache.write();
        let owned_by = cache
            .get(agent_id)
            .is_some_and(|entry| entry.instance_id == instance_id);
        if owned_by {
            cache.remove(agent_id);
        }
        owned_by
    }

    fn handle_location_update(&self, env: &Envelope) {
        let message: AgentLocationMessage = match env.decode() {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, origin = %env.instance_id, "dropping malformed location update");
                return;
            }
        };
        match message.status {
            AgentStatus::Connected => {
                // Our own announcement arriving after we already let go.
                if message.instance_id == self.instance_id()
                    && !self.owned.read().contains(&message.agent_id)
                {
                    debug!(agent_id = %message.agent_id, "ignoring stale self announcement");
                    return;
                }
                self.cache_owner(&message.agent_id, &message.instance_id);
                debug!(agent_id = %message.agent_id, owner = %message.instance_id, "location cached");
            }
            AgentStatus::Disconnected => {
                if self.evict_if_owner(&message.agent_id, &message.instance_id) {
                    debug!(agent_id = %message.agent_id, "location evicted");
                }
            }
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, LocationStoreError>>,
) -> Result<T, LocationStoreError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| LocationStoreError::Timeout(limit))?
}
