//! API Module
//!
//! Operational HTTP surface for the engine: health probe, change-event
//! intake, release-target inspection, and the job status-report endpoint
//! used by the agent integration. The management/front-end API lives
//! outside this engine.

pub mod error;
pub mod event;
pub mod health;
pub mod job;
pub mod target;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::queue::WorkQueue;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: Arc<dyn WorkQueue>,
}

/// Create the main API router with all endpoints
pub fn create_router(pool: PgPool, queue: Arc<dyn WorkQueue>) -> Router {
    let state = AppState { pool, queue };

    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Change-event intake
        .route("/event", post(event::ingest_event))
        // Release-target inspection
        .route("/release-target/{id}", get(target::get_release_target))
        // Job status intake
        .route("/job/{id}", get(job::get_job))
        .route("/job/{id}/status", post(job::report_job_status))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
