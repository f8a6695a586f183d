mod common;

use axum::body;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{Fleet, RecordingSocket};
use fleet_gateway::routes;
use tower::util::ServiceExt;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
async fn health_and_readiness_report_instance() -> TestResult {
    let fleet = Fleet::new();
    let state = fleet.instance("gw-1").await;
    state
        .connections()
        .register_connection("u1", "c1", RecordingSocket::default().boxed());
    let app = routes::router(state.clone());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body::to_bytes(response.into_body(), 1024).await?;
    assert_eq!(&body[..], b"ok");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/readyz").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body::to_bytes(response.into_body(), 1024 * 64).await?;
    let json: serde_json::Value = serde_json::from_slice(&body)?;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["instance_id"], "gw-1");
    assert_eq!(json["bus_connected"], true);
    assert_eq!(json["connections"], 1);

    state.bus().stop().await;
    Ok(())
}

#[tokio::test]
async fn metrics_expose_gateway_counters() -> TestResult {
    let fleet = Fleet::new();
    let state = fleet.instance("gw-2").await;
    state
        .connections()
        .broadcast_to_user_global("nobody", "started", &serde_json::json!({}))
        .await?;
    let app = routes::router(state.clone());

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body::to_bytes(response.into_body(), 1024 * 1024).await?;
    let text = String::from_utf8(body.to_vec())?;
    assert!(text.contains("fleet_bus_publish_total"));

    state.bus().stop().await;
    Ok(())
}

#[tokio::test]
async fn event_socket_requires_upgrade() -> TestResult {
    let fleet = Fleet::new();
    let state = fleet.instance("gw-3").await;
    let app = routes::router(state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ws/events?user_id=u1")
                .body(Body::empty())?,
        )
        .await?;
    assert!(response.status().is_client_error());

    state.bus().stop().await;
    Ok(())
}
