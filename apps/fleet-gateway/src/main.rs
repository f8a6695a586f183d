use axum::Router;
use fleet_gateway::config::AppConfig;
use fleet_gateway::metrics;
use fleet_gateway::routes;
use fleet_gateway::state::AppState;
use fleet_gateway::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    let cfg = AppConfig::from_env();
    init_tracing(&cfg.log_filter, cfg.log_json);

    let app_state = AppState::from_config(&cfg).await;
    let bus = app_state.bus();
    bus.start();

    let app: Router = routes::router(app_state);

    info!(
        addr = %cfg.bind_addr,
        instance = %cfg.instance_id,
        redis = cfg.redis_endpoint().as_deref().unwrap_or("unset"),
        location_refresh_secs = cfg.location_refresh.as_secs(),
        proxy_buffer = cfg.proxy_buffer,
        health_interval_secs = cfg.health_interval.as_secs(),
        "starting fleet-gateway"
    );
    metrics::BOOT_COUNTER.inc();
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .expect("bind");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server");

    bus.stop().await;
    info!("fleet-gateway stopped");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
