use async_trait::async_trait;
use bytes::Bytes;
use fleet_bus::{BusError, BusMessage, BusResult, BusStream, PubSubTransport};
use futures::StreamExt;
use redis::aio::ConnectionManager;

/// Redis pub/sub transport. Publishes and pings share a managed connection;
/// every subscription gets its own dedicated pub/sub connection.
pub struct RedisTransport {
    client: redis::Client,
    conn: ConnectionManager,
}

fn transport_err(err: redis::RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

impl RedisTransport {
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = redis::Client::open(url).map_err(transport_err)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(transport_err)?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.as_ref())
            .query_async(&mut conn)
            .await
            .map_err(transport_err)?;
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[&str]) -> BusResult<BusStream> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transport_err)?;
        for channel in channels {
            pubsub.subscribe(*channel).await.map_err(transport_err)?;
        }
        let stream = pubsub.into_on_message().map(|msg| BusMessage {
            topic: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        });
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(transport_err)?;
        Ok(())
    }
}
