use std::time::Duration;

use crate::app::DEFAULT_MAX_BODY_BYTES;
use crate::catalog::ServerCatalog;
use crate::durable::UpstashConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3100;
pub const SESSION_TTL_ENV: &str = "JETVISION_MCP_SESSION_TTL_SECS";
pub const RPC_TIMEOUT_ENV: &str = "JETVISION_MCP_RPC_TIMEOUT_MS";
pub const MAX_BODY_BYTES_ENV: &str = "JETVISION_MCP_MAX_BODY_BYTES";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub catalog: ServerCatalog,
    /// `None` disables durable persistence of harvested session ids.
    pub upstash: Option<UpstashConfig>,
    /// Expiry applied to durable entries. `None` keeps them forever.
    pub session_ttl: Option<Duration>,
    /// Bound on forwarded POSTs. `None` leaves it to the HTTP client.
    pub rpc_timeout: Option<Duration>,
    /// Largest POST body buffered before answering with a parse error.
    pub max_body_bytes: usize,
}

impl ServerConfig {
    /// Defaults plus whatever the environment provides.
    pub fn from_env() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            catalog: ServerCatalog::from_env(),
            upstash: UpstashConfig::from_env(),
            session_ttl: duration_from_env(SESSION_TTL_ENV, Duration::from_secs),
            rpc_timeout: duration_from_env(RPC_TIMEOUT_ENV, Duration::from_millis),
            max_body_bytes: max_body_bytes_from_env(),
        }
    }
}

fn max_body_bytes_from_env() -> usize {
    let Ok(raw) = std::env::var(MAX_BODY_BYTES_ENV) else {
        return DEFAULT_MAX_BODY_BYTES;
    };
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => value,
        _ => {
            tracing::warn!(key = MAX_BODY_BYTES_ENV, value = %raw, "ignoring invalid body limit");
            DEFAULT_MAX_BODY_BYTES
        }
    }
}

fn duration_from_env(key: &str, unit: fn(u64) -> Duration) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match parse_duration(&raw, unit) {
        Ok(duration) => duration,
        Err(()) => {
            tracing::warn!(key = key, value = %raw, "ignoring non-numeric duration");
            None
        }
    }
}

/// `0` disables the bound.
fn parse_duration(raw: &str, unit: fn(u64) -> Duration) -> Result<Option<Duration>, ()> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Ok(None),
        Ok(value) => Ok(Some(unit(value))),
        Err(_) => Err(()),
    }
}
