use std::time::Duration;

use async_trait::async_trait;
use fleet_sdk::{LocationStore, LocationStoreError};
use redis::aio::ConnectionManager;

/// Atomic compare-and-delete: removes KEYS[1] only while it equals ARGV[1].
const DELETE_IF_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub struct RedisLocationStore {
    conn: ConnectionManager,
}

fn store_err(err: redis::RedisError) -> LocationStoreError {
    LocationStoreError::Store(err.to_string())
}

/// Redis expiries are whole seconds; never round a TTL down to "no expiry".
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisLocationStore {
    pub async fn connect(url: &str) -> Result<Self, LocationStoreError> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = client.get_connection_manager().await.map_err(store_err)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LocationStore for RedisLocationStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LocationStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LocationStoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool, LocationStoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("EVAL")
            .arg(DELETE_IF_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(expected)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(removed == 1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LocationStoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(updated == 1)
    }
}
