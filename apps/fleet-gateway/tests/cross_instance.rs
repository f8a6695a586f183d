mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Fleet, RecordingSink, RecordingSocket, WedgedSocket, wait_until};
use fleet_gateway::terminal_proxy::AgentFrameSink;
use fleet_sdk::{AgentMetadata, ProxyFrameKind, TerminalProxyMessage};
use serde_json::{Value, json};

#[test_timeout::tokio_timeout_test(30)]
async fn agent_output_reaches_viewer_on_other_instance() {
    let fleet = Fleet::new();
    let i1 = fleet.instance("I1").await;
    let i2 = fleet.instance("I2").await;

    let sink = Arc::new(RecordingSink::default());
    let refresher = i1
        .agent_connected(
            "agent-7",
            "user-9",
            AgentMetadata {
                name: "build-box".into(),
                os: "linux".into(),
                arch: "amd64".into(),
            },
            sink.clone() as Arc<dyn AgentFrameSink>,
        )
        .await
        .expect("register agent");

    let socket = RecordingSocket::default();
    i2.connections()
        .register_connection("user-9", "conn-1", socket.boxed());

    let locations = i2.locations();
    assert_eq!(locations.get_location("agent-7").await.as_deref(), Some("I1"));
    assert!(!locations.is_local("agent-7").await);

    let mut relay = i2.connections().register_proxy_session("s1");
    let viewer = {
        let connections = i2.connections();
        tokio::spawn(async move {
            while let Some(chunk) = relay.recv().await {
                let text = String::from_utf8_lossy(&chunk).into_owned();
                connections
                    .send_to_connection(
                        "user-9",
                        "conn-1",
                        &json!({"type": "output", "data": text}),
                    )
                    .await
                    .expect("socket write");
            }
        })
    };

    i1.proxy()
        .publish_output("agent-7", "s1", b"hello".to_vec())
        .await
        .expect("publish output");

    let probe = socket.clone();
    wait_until(move || probe.len() == 1).await;
    let frame: Value = serde_json::from_str(&socket.frames()[0]).unwrap();
    assert_eq!(frame["data"], "hello");

    assert!(i2.connections().unregister_proxy_session("s1"));
    viewer.await.unwrap();

    i1.agent_disconnected("agent-7", "user-9", refresher)
        .await
        .expect("unregister agent");
    let probe = i2.locations();
    wait_until(move || probe.cached_location("agent-7").is_none()).await;
    assert_eq!(i2.locations().get_location("agent-7").await, None);

    i1.bus().stop().await;
    i2.bus().stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn location_updates_populate_every_cache() {
    let fleet = Fleet::new();
    let i1 = fleet.instance("I1").await;
    let i2 = fleet.instance("I2").await;
    let i3 = fleet.instance("I3").await;

    i1.locations()
        .register_location("agent-1", "u1", AgentMetadata::default(), chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(i1.locations().cached_location("agent-1").as_deref(), Some("I1"));
    for peer in [&i2, &i3] {
        let locations = peer.locations();
        wait_until(move || locations.cached_location("agent-1").as_deref() == Some("I1")).await;
    }

    // Agent reconnects to I2: every cache follows the new owner.
    i2.locations()
        .register_location("agent-1", "u1", AgentMetadata::default(), chrono::Utc::now())
        .await
        .unwrap();
    for peer in [&i1, &i3] {
        let locations = peer.locations();
        wait_until(move || locations.cached_location("agent-1").as_deref() == Some("I2")).await;
    }

    for instance in [i1, i2, i3] {
        instance.bus().stop().await;
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn global_broadcast_reaches_every_instance_serving_the_user() {
    let fleet = Fleet::new();
    let i1 = fleet.instance("I1").await;
    let i2 = fleet.instance("I2").await;
    let i3 = fleet.instance("I3").await;

    let on_i1 = RecordingSocket::default();
    let on_i2 = RecordingSocket::default();
    let bystander = RecordingSocket::default();
    i1.connections().register_connection("u1", "a", on_i1.boxed());
    i2.connections().register_connection("u1", "b", on_i2.boxed());
    i3.connections().register_connection("u2", "c", bystander.boxed());

    i1.connections()
        .broadcast_to_user_global("u1", "started", &json!({"id": "box-1"}))
        .await
        .unwrap();

    // Local write happens before the publish returns.
    assert_eq!(on_i1.frames(), vec![r#"{"id":"box-1"}"#.to_string()]);
    let probe = on_i2.clone();
    wait_until(move || probe.len() == 1).await;
    assert_eq!(on_i2.frames(), vec![r#"{"id":"box-1"}"#.to_string()]);

    // The publisher never sees its own event a second time.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(on_i1.len(), 1);
    assert_eq!(bystander.len(), 0);

    for instance in [i1, i2, i3] {
        instance.bus().stop().await;
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn agent_events_use_the_agent_channel_and_fan_out() {
    let fleet = Fleet::new();
    let i1 = fleet.instance("I1").await;
    let i2 = fleet.instance("I2").await;

    let remote = RecordingSocket::default();
    i2.connections().register_connection("u1", "b", remote.boxed());
    i1.notifier()
        .notify_agent_connected("u1", json!({"id": "agent:a1", "name": "box"}))
        .await
        .unwrap();

    let probe = remote.clone();
    wait_until(move || probe.len() == 1).await;
    let frame: Value = serde_json::from_str(&remote.frames()[0]).unwrap();
    assert_eq!(frame["type"], "agent_connected");
    assert_eq!(frame["container"]["name"], "box");

    i1.bus().stop().await;
    i2.bus().stop().await;
}

#[test_timeout::tokio_timeout_test(30)]
async fn viewer_input_routes_to_owning_instance() {
    let fleet = Fleet::new();
    let i1 = fleet.instance("I1").await;
    let i2 = fleet.instance("I2").await;
    let i3 = fleet.instance("I3").await;

    let sink = Arc::new(RecordingSink::default());
    let refresher = i1
        .agent_connected(
            "agent-7",
            "user-9",
            AgentMetadata::default(),
            sink.clone() as Arc<dyn AgentFrameSink>,
        )
        .await
        .unwrap();

    i2.proxy()
        .send_to_agent(TerminalProxyMessage::start_session("agent-7", "s1", 80, 24, true))
        .await
        .unwrap();
    i3.proxy()
        .send_to_agent(TerminalProxyMessage::start_session("agent-7", "s1", 80, 24, false))
        .await
        .unwrap();
    i2.proxy()
        .send_to_agent(TerminalProxyMessage::input("agent-7", "s1", b"ls\n".to_vec()))
        .await
        .unwrap();
    let probe = sink.clone();
    wait_until(move || probe.frames().len() == 3).await;
    assert_eq!(i1.proxy().remote_viewer_count("agent-7", "s1"), 2);

    // The first viewer leaving keeps the session open for the other one.
    i2.proxy()
        .send_to_agent(TerminalProxyMessage::stop_session("agent-7", "s1"))
        .await
        .unwrap();
    let proxy = i1.proxy();
    wait_until(move || proxy.remote_viewer_count("agent-7", "s1") == 1).await;
    assert_eq!(sink.frames().len(), 3);

    i3.proxy()
        .send_to_agent(TerminalProxyMessage::stop_session("agent-7", "s1"))
        .await
        .unwrap();
    let probe = sink.clone();
    wait_until(move || probe.frames().len() == 4).await;
    assert_eq!(
        sink.kinds(),
        vec![
            ProxyFrameKind::StartSession,
            ProxyFrameKind::StartSession,
            ProxyFrameKind::Input,
            ProxyFrameKind::StopSession,
        ]
    );
    assert_eq!(sink.frames()[2].data, b"ls\n".to_vec());

    i1.agent_disconnected("agent-7", "user-9", refresher).await.unwrap();
    for instance in [i1, i2, i3] {
        instance.bus().stop().await;
    }
}

#[test_timeout::tokio_timeout_test(30)]
async fn proxy_overflow_keeps_first_frames_and_never_blocks() {
    let fleet = Fleet::new();
    let i1 = fleet.instance("I1").await;
    let i2 = fleet.instance("I2").await;

    let mut relay = i2.connections().register_proxy_session("s1");
    let mut admin = i2.admin().subscribe();

    for n in 0..300 {
        i1.proxy()
            .publish_output("agent-7", "s1", n.to_string().into_bytes())
            .await
            .unwrap();
    }
    // Published after every frame; once it arrives, all frames were handled.
    i1.admin().publish("marker", Value::Null).await.unwrap();
    let marker = admin.recv().await.unwrap();
    assert_eq!(marker.kind, "marker");

    let mut received = Vec::new();
    while let Ok(chunk) = relay.try_recv() {
        received.push(String::from_utf8(chunk).unwrap());
    }
    assert_eq!(received.len(), 256);
    assert_eq!(received.first().map(String::as_str), Some("0"));
    assert_eq!(received.last().map(String::as_str), Some("255"));

    i1.bus().stop().await;
    i2.bus().stop().await;
}

#[test_timeout::tokio_timeout_test(60, paused)]
async fn wedged_user_socket_does_not_delay_other_sessions() {
    let fleet = Fleet::new();
    let i1 = fleet.instance("I1").await;
    let i2 = fleet.instance("I2").await;

    i2.connections()
        .register_connection("u-slow", "conn-slow", Box::new(WedgedSocket));
    let mut relay = i2.connections().register_proxy_session("s1");

    let started = tokio::time::Instant::now();
    i1.connections()
        .broadcast_to_user_global("u-slow", "started", &json!({"id": "box-1"}))
        .await
        .unwrap();
    i1.proxy()
        .publish_output("agent-x", "s1", b"hi".to_vec())
        .await
        .unwrap();

    let chunk = relay.recv().await.unwrap();
    assert_eq!(chunk, b"hi".to_vec());
    assert!(started.elapsed() < Duration::from_secs(1));

    i1.bus().stop().await;
    i2.bus().stop().await;
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn crashed_owner_expires_everywhere_after_ttl() {
    let fleet = Fleet::new();
    let i1 = fleet.instance("I1").await;
    let i2 = fleet.instance("I2").await;

    i1.locations()
        .register_location("agent-7", "user-9", AgentMetadata::default(), chrono::Utc::now())
        .await
        .unwrap();
    let probe = i2.locations();
    wait_until(move || probe.cached_location("agent-7").as_deref() == Some("I1")).await;

    // I1 disappears without unregistering or refreshing.
    i1.bus().stop().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(i2.locations().get_location("agent-7").await.as_deref(), Some("I1"));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(i2.locations().get_location("agent-7").await, None);
    assert_eq!(i1.locations().get_location("agent-7").await, None);

    i2.bus().stop().await;
}
