//! stylequeue: asynchronous job dispatch for compute-heavy model inference.
//!
//! A stateless gateway accepts jobs of each kind, records them in the job
//! registry and hands them to a durable queue. Worker replicas, scaled from
//! zero by the pool controller, claim jobs, call the model server and publish
//! results to the result store. Clients poll the gateway for completion.

pub mod app_state;
pub mod backends;
pub mod config;
pub mod controller;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod shutdown;
pub mod telemetry;
pub mod worker;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use app_state::AppState;

/// HTTP API of the gateway.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::prometheus_metrics))
        .route("/jobs", post(routes::jobs::submit_style_transfer))
        .route("/chat/jobs", post(routes::jobs::submit_chat))
        .route(
            "/recommendations/jobs",
            post(routes::jobs::submit_recommendation),
        )
        .route("/jobs/{job_id}", get(routes::jobs::get_job_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}
