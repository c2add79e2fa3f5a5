//! Metrics configuration

use serde::Deserialize;
use std::net::SocketAddr;

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the HTTP endpoint is served
    pub enabled: bool,
    /// HTTP bind address for /metrics, /health and /version
    pub bind: SocketAddr,
}

pub(super) fn default_metrics_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 6070))
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_metrics_bind(),
        }
    }
}
