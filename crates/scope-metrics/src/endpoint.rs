//! HTTP endpoint for serving metrics
//!
//! Exposition runs beside the engine, never inside it: scrapes read the
//! registry, so a slow or absent scraper cannot slow a scheduler step.

use crate::{MetricRegistry, MetricsError, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// HTTP endpoint serving the Prometheus scrape surface and a health check
#[derive(Debug)]
pub struct MetricsEndpoint {
    registry: MetricRegistry,
    bind_addr: std::net::SocketAddr,
    server_handle: Option<Arc<tokio::task::JoinHandle<()>>>,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    pub fn new(registry: MetricRegistry, bind_addr: std::net::SocketAddr) -> Self {
        Self {
            registry,
            bind_addr,
            server_handle: None,
        }
    }

    /// Start the HTTP server
    pub async fn start(&mut self) -> Result<()> {
        if self.server_handle.is_some() {
            return Err(MetricsError::Config("Server already started".to_string()));
        }

        let app = create_app(self.registry.clone());
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.bind_addr = listener.local_addr()?;

        info!("Starting metrics endpoint server on {}", self.bind_addr);

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Metrics endpoint server error: {}", e);
            }
        });

        self.server_handle = Some(Arc::new(server_handle));
        Ok(())
    }

    /// Stop the HTTP server
    pub async fn stop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            if let Ok(handle) = Arc::try_unwrap(handle) {
                handle.abort();
                let _ = handle.await;
            }
        }
    }

    /// Address the server is bound to; once started this reflects the
    /// actual port even when the configured address used port 0
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.bind_addr
    }

    /// Get the metrics URL
    pub fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.bind_addr)
    }

    /// Get the health URL
    pub fn health_url(&self) -> String {
        format!("http://{}/health", self.bind_addr)
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.server_handle.is_some()
    }
}

impl Drop for MetricsEndpoint {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            if let Ok(handle) = Arc::try_unwrap(handle) {
                handle.abort();
            }
        }
    }
}

/// Create the Axum application
fn create_app(registry: MetricRegistry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(registry): State<MetricRegistry>) -> Response {
    match registry.render_text() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render metrics").into_response()
        }
    }
}

/// Handler for /health endpoint
async fn health_handler() -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
        .into_response()
}
