use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use fleet_sdk::ids;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::metrics;
use crate::state::AppState;
use crate::ws_manager::{SocketError, SocketWriter};

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    uptime_secs: u64,
    instance_id: String,
    bus_connected: bool,
    connections: usize,
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        instance_id: state.instance_id().to_string(),
        bus_connected: state.bus().is_connected(),
        connections: state.connections().connection_count(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        metrics::gather(),
    )
}

/// Write half of an axum socket registered with the connection registry.
struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl SocketWriter for WsSink {
    async fn write_text(&mut self, text: String) -> Result<(), SocketError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|err| SocketError::Io(err.to_string()))
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    user_id: String,
}

async fn ws_events(
    ws: WebSocketUpgrade,
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_events_socket(socket, query.user_id, state))
}

async fn handle_events_socket(socket: WebSocket, user_id: String, state: AppState) {
    let conn_id = ids::connection_id();
    let (sink, mut stream) = socket.split();
    let registry = state.connections();
    registry.register_connection(&user_id, &conn_id, Box::new(WsSink(sink)));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => registry.touch(&user_id, &conn_id),
            Err(err) => {
                debug!(user_id = %user_id, conn_id = %conn_id, error = %err, "event socket read failed");
                break;
            }
        }
    }
    registry.unregister_connection(&user_id, &conn_id);
}

async fn ws_admin(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_admin_socket(socket, state))
}

async fn handle_admin_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.admin().subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode admin event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "admin socket lagging; events skipped");
                }
                Err(RecvError::Closed) => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/readyz", get(ready))
        .route("/ws/events", get(ws_events))
        .route("/ws/admin", get(ws_admin))
        .with_state(state)
}
