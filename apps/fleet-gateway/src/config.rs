use std::net::SocketAddr;
use std::time::Duration;

use fleet_sdk::ids;

pub const DEFAULT_LOG_FILTER: &str = "info,fleet_gateway=debug,fleet_bus=info";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub log_json: bool,
    pub instance_id: String,
    pub redis_url: Option<String>,
    pub location_refresh: Duration,
    pub proxy_buffer: usize,
    pub health_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let bind_addr: SocketAddr = std::env::var("FLEET_GATEWAY_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8090)));
        let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
        let log_json = std::env::var("FLEET_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let instance_id = std::env::var("FLEET_INSTANCE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(ids::instance_id);
        let redis_url = std::env::var("REDIS_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let location_refresh_secs = std::env::var("FLEET_LOCATION_REFRESH_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .unwrap_or(20);
        let proxy_buffer = std::env::var("FLEET_PROXY_BUFFER")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(256);
        let health_interval_secs = std::env::var("FLEET_HEALTH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .unwrap_or(30);
        Self {
            bind_addr,
            log_filter,
            log_json,
            instance_id,
            redis_url,
            location_refresh: Duration::from_secs(location_refresh_secs),
            proxy_buffer,
            health_interval: Duration::from_secs(health_interval_secs),
        }
    }

    /// Redis endpoint safe for logs, with any credentials removed.
    pub fn redis_endpoint(&self) -> Option<String> {
        self.redis_url.as_deref().map(redact_credentials)
    }
}

fn redact_credentials(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let rest = match rest[..authority_end].rfind('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    };
    match scheme {
        Some(scheme) => format!("{scheme}://{rest}"),
        None => rest.to_string(),
    }
}
