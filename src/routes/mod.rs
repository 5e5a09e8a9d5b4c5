pub mod health;
pub mod ingest;
pub mod quantities;
pub mod query;

use axum::{routing::get, routing::post, Router};
use std::sync::Arc;

use crate::app::AppState;

/// Build the API router with all routes
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        // Question answering
        .route("/projects/:project_id/query", post(query::ask_question))
        // Reconciled quantities and summary reads
        .route(
            "/projects/:project_id/quantities",
            get(quantities::list_quantities),
        )
        .route(
            "/projects/:project_id/summary",
            get(quantities::get_project_summary),
        )
        // Sheet extraction ingestion
        .route("/projects/:project_id/ingest", post(ingest::run_ingestion))
}
