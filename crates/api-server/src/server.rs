//! API server: HTTP routes plus the Prometheus metrics listener.

use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use funnel_core::config::AppConfig;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Every route the service exposes, with middleware applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Dashboard queries
        .route("/v1/funnel", get(rest::funnel))
        .route("/v1/funnel/compare", get(rest::funnel_compare))
        .route("/v1/insights", get(rest::insights))
        .route("/v1/attribution", get(rest::attribution))
        .route("/v1/journeys", get(rest::journeys))
        .route("/v1/questions", get(rest::questions))
        // Session tracking
        .route("/v1/sessions", post(rest::open_session))
        .route("/v1/sessions/:id/start", post(rest::start_quiz))
        .route(
            "/v1/sessions/:id/questions/:index/view",
            post(rest::view_question),
        )
        .route(
            "/v1/sessions/:id/questions/:index/answer",
            post(rest::answer_question),
        )
        .route("/v1/sessions/:id/email", post(rest::capture_email))
        .route("/v1/sessions/:id/complete", post(rest::complete))
        .route("/v1/sessions/:id/abandon", post(rest::abandon))
        .route("/v1/sessions/:id/buy", post(rest::buy_click))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve HTTP until the listener fails.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Start the metrics exporter on its own port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
