//! Process shell for the order saga.
//!
//! Loads configuration, wires the stages selected by the service role onto
//! a broker, and exposes the HTTP order ingress with structured logging
//! (tracing) and Prometheus metrics. No choreography logic lives here.

pub mod config;
pub mod error;
pub mod roles;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use choreography::{OrderStage, SagaTracker};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError, Role};
pub use roles::{
    IdempotencyStores, Participants, StartupError, Workers, assemble, connect_broker, open_stores,
};

/// Shared state of the HTTP handlers.
///
/// `orders` and `tracker` are present only when the process runs the gateway.
#[derive(Clone)]
pub struct AppState {
    pub role: Role,
    pub orders: Option<Arc<OrderStage>>,
    pub tracker: Option<Arc<SagaTracker>>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: AppState, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/order", post(routes::orders::submit))
        .route("/order/{order_id}", get(routes::orders::saga))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
