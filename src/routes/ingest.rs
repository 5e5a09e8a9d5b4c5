//! Sheet-extraction ingestion route.

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
use crate::retrieval::sources::SheetPage;
use crate::services::cache::keys;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub sheets: Vec<SheetPage>,
}

/// POST /projects/:project_id/ingest
///
/// Run the batched extraction pipeline over the given sheets. Individual
/// sheet failures are reported in the result, never as an HTTP error.
pub async fn run_ingestion(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.sheets.is_empty() {
        return Err(ApiError::bad_request("sheets must not be empty"));
    }

    let report = state.ingest.process_sheets(project_id, &req.sheets).await;

    // New records invalidate every cached read for the project.
    if let Err(e) = state
        .cache
        .delete_pattern(&keys::project_pattern(project_id))
        .await
    {
        tracing::warn!(error = %e, "failed to invalidate project caches after ingestion");
    }

    Ok(Json(DataResponse::new(report)))
}
