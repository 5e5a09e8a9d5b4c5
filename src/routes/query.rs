//! Question-answering route.
//!
//! The single public entry point into the retrieval router. Routing results
//! are built fresh per question and never cached.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::response::DataResponse;
use crate::app::AppState;
use crate::error::{ApiError, ApiResult};
use crate::retrieval::router::RouteOptions;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub max_results: Option<i64>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

/// POST /projects/:project_id/query
pub async fn ask_question(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<impl IntoResponse> {
    let question = req.question.trim();
    if question.is_empty() {
        return Err(ApiError::bad_request("question must not be empty"));
    }

    let options = RouteOptions {
        max_results: req.max_results.unwrap_or(8).clamp(1, 50),
        min_confidence: req.min_confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        step_timeout: state.settings.route_step_timeout(),
    };

    let result = state.router.route(question, project_id, &options).await;

    tracing::info!(
        project_id = %project_id,
        method = ?result.method,
        status = ?result.status,
        timing_ms = result.timing_ms,
        "routed question"
    );

    Ok(Json(DataResponse::new(result)))
}
