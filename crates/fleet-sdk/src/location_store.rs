use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const LOCATION_KEY_PREFIX: &str = "agent:location:";

/// Lifetime of a location record that is not refreshed.
pub const LOCATION_TTL: Duration = Duration::from_secs(60);

pub fn location_key(agent_id: &str) -> String {
    format!("{LOCATION_KEY_PREFIX}{agent_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum LocationStoreError {
    #[error("store error: {0}")]
    Store(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Shared key/value store with per-key expiry.
#[async_trait]
pub trait LocationStore: Send + Sync {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LocationStoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, LocationStoreError>;

    /// Delete `key` only while it still holds `expected`. Returns whether a
    /// record was removed.
    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, LocationStoreError>;

    /// Re-arm the expiry of an existing key. Returns `false` when the key is
    /// already gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LocationStoreError>;
}

/// In-memory adapter for tests and single-instance runs. Expiry follows the
/// Tokio clock so paused-time tests can fast-forward through it.
#[derive(Default)]
pub struct InMemoryLocationStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLocationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl LocationStore for InMemoryLocationStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LocationStoreError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LocationStoreError> {
        let mut guard = self.entries.lock().await;
        match guard.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                guard.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, LocationStoreError> {
        let mut guard = self.entries.lock().await;
        let matches = guard
            .get(key)
            .is_some_and(|(value, deadline)| value == expected && *deadline > Instant::now());
        if matches {
            guard.remove(key);
        }
        Ok(matches)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LocationStoreError> {
        let mut guard = self.entries.lock().await;
        let now = Instant::now();
        match guard.get_mut(key) {
            Some((_, deadline)) if *deadline > now => {
                *deadline = now + ttl;
                Ok(true)
            }
            Some(_) => {
                guard.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}
