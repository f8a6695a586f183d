pub mod admin;
pub mod bus_redis;
pub mod config;
pub mod events;
pub mod location;
pub mod location_redis;
pub mod log_throttle;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod terminal_proxy;
pub mod ws_manager;
