//! HTTP endpoint exposing `/metrics` and `/health`

use super::{MetricsError, MetricsRegistry};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Configuration for the metrics server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

impl MetricsServerConfig {
    pub fn new(bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, MetricsError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| MetricsError::BindError {
                address: format!("{}:{}", self.bind_address, self.port),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            })
    }
}

/// Health status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

impl HealthStatus {
    pub fn healthy_with_uptime(uptime: Duration) -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

#[derive(Clone)]
struct ServerState {
    registry: Arc<MetricsRegistry>,
    start_time: Instant,
}

/// HTTP server for the Prometheus scrape endpoint
pub struct MetricsServer {
    config: MetricsServerConfig,
    registry: Arc<MetricsRegistry>,
}

impl MetricsServer {
    /// Server over the global registry
    pub fn new(config: MetricsServerConfig) -> Self {
        Self {
            config,
            registry: MetricsRegistry::global(),
        }
    }

    pub fn with_registry(config: MetricsServerConfig, registry: Arc<MetricsRegistry>) -> Self {
        Self { config, registry }
    }

    fn router(registry: Arc<MetricsRegistry>) -> Router {
        let state = ServerState {
            registry,
            start_time: Instant::now(),
        };

        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }

    /// Bind and serve until the task is dropped
    pub async fn start(self) -> Result<(), MetricsError> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MetricsError::BindError {
                address: addr.to_string(),
                source: e,
            })?;

        info!(address = %addr, "Metrics server listening");

        axum::serve(listener, Self::router(self.registry))
            .await
            .map_err(|e| MetricsError::ServerStartError(e.to_string()))?;

        Ok(())
    }

    pub fn config(&self) -> &MetricsServerConfig {
        &self.config
    }
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    debug!("Metrics endpoint called");

    match state.registry.encode() {
        Ok(metrics) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            metrics,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn health_handler(State(state): State<ServerState>) -> Json<HealthStatus> {
    Json(HealthStatus::healthy_with_uptime(state.start_time.elapsed()))
}
