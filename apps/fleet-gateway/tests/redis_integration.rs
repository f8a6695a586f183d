use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fleet_bus::{BusTimings, MessageBus, PubSubTransport, SubscriptionState};
use fleet_gateway::bus_redis::RedisTransport;
use fleet_gateway::location::LocationRegistry;
use fleet_gateway::location_redis::RedisLocationStore;
use fleet_sdk::{AgentMetadata, LocationStore, location_key};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
}

fn unique_id(name: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis();
    format!("{name}-{millis}")
}

type Instance = (Arc<MessageBus>, Arc<LocationRegistry>);

async fn registry(instance_id: &str) -> Result<Instance, Box<dyn std::error::Error>> {
    let transport: Arc<dyn PubSubTransport> =
        Arc::new(RedisTransport::connect(&redis_url()).await?);
    let bus = MessageBus::connect(transport, instance_id, BusTimings::default()).await?;
    let store: Arc<dyn LocationStore> = Arc::new(RedisLocationStore::connect(&redis_url()).await?);
    let registry = LocationRegistry::new(Arc::clone(&bus), store);
    bus.start();
    for _ in 0..500 {
        if bus.subscription_state() == SubscriptionState::Receiving {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok((bus, registry))
}

#[tokio::test]
#[ignore]
async fn location_round_trip_through_redis() -> TestResult {
    let (bus_a, a) = registry(&unique_id("inst-a")).await?;
    let (bus_b, b) = registry(&unique_id("inst-b")).await?;
    let agent = unique_id("agent");

    a.register_location(&agent, "u1", AgentMetadata::default(), chrono::Utc::now())
        .await?;
    assert_eq!(b.get_location(&agent).await.as_deref(), Some(a.instance_id()));
    a.refresh_location(&agent).await?;

    a.unregister_location(&agent, "u1").await?;
    assert_eq!(a.get_location(&agent).await, None);
    for _ in 0..200 {
        if b.cached_location(&agent).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(b.get_location(&agent).await, None);

    bus_a.stop().await;
    bus_b.stop().await;
    Ok(())
}

#[tokio::test]
#[ignore]
async fn redis_store_expire_reports_missing_keys() -> TestResult {
    let store = RedisLocationStore::connect(&redis_url()).await?;
    let key = location_key(&unique_id("agent"));
    assert!(!store.expire(&key, Duration::from_secs(60)).await?);
    store.put(&key, "inst", Duration::from_secs(60)).await?;
    assert!(store.expire(&key, Duration::from_secs(60)).await?);
    assert!(!store.delete_if(&key, "other").await?);
    assert!(store.delete_if(&key, "inst").await?);
    assert_eq!(store.get(&key).await?, None);
    Ok(())
}
