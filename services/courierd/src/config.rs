// Daemon configuration sourced from environment variables.
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub redis_address: String,
    pub source_key: String,
    pub registration_timeout: Duration,
    pub metrics_bind: SocketAddr,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        let redis_host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let redis_port = std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
        let source_key = std::env::var("COURIER_SOURCE_KEY")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "queue".to_string());
        let registration_timeout = std::env::var("COURIER_REGISTRATION_TIMEOUT_SECONDS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));
        let metrics_bind = std::env::var("COURIER_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("parse COURIER_METRICS_BIND")?;
        Ok(Self {
            redis_address: format!("{redis_host}:{redis_port}"),
            source_key,
            registration_timeout,
            metrics_bind,
        })
    }
}
