//! Pull-based scrape endpoint for the shard metrics registry

use super::ShardMetricsRegistry;
use crate::error::MetricsError;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use rand::rngs::OsRng;
use rand::Rng;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

const TOKEN_ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
/// 26 base-32 digits carry 130 random bits.
const TOKEN_LENGTH: usize = 26;

/// Random opaque token minted at startup.
///
/// Reserved for an authenticated shutdown endpoint; nothing consumes it yet.
pub fn generate_shutdown_token() -> String {
    let mut rng = OsRng;
    (0..TOKEN_LENGTH)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Router serving `/metrics` and `/health`
pub fn router(registry: Arc<ShardMetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
}

fn text_content_type() -> String {
    format!("{}; charset=utf-8", TextEncoder::new().format_type())
}

async fn metrics_handler(State(registry): State<Arc<ShardMetricsRegistry>>) -> impl IntoResponse {
    let content_type = [(header::CONTENT_TYPE, text_content_type())];
    match registry.encode_text() {
        Ok(body) => (StatusCode::OK, content_type, body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, content_type, String::new())
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Metrics server configuration
pub struct MetricsServer {
    registry: Arc<ShardMetricsRegistry>,
    port: u16,
    shutdown_token: String,
}

impl MetricsServer {
    pub fn new(registry: Arc<ShardMetricsRegistry>, port: u16) -> Self {
        Self {
            registry,
            port,
            shutdown_token: generate_shutdown_token(),
        }
    }

    pub fn shutdown_token(&self) -> &str {
        &self.shutdown_token
    }

    /// Bind the listening socket; a failure here is a bring-up failure
    pub async fn bind(self) -> Result<BoundMetricsServer, MetricsError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MetricsError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| MetricsError::Bind { addr, source })?;

        info!(
            port = local_addr.port(),
            shutdown_token = %self.shutdown_token,
            "Metrics server bound"
        );

        Ok(BoundMetricsServer {
            listener,
            local_addr,
            registry: self.registry,
        })
    }
}

/// A metrics server holding its listening socket
pub struct BoundMetricsServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<ShardMetricsRegistry>,
}

impl BoundMetricsServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve scrapes until `shutdown` resolves
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), MetricsError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(addr = %self.local_addr, "Serving metrics at /metrics");
        axum::serve(self.listener, router(self.registry))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| MetricsError::Serve(e.to_string()))
    }
}
