//! Reconciled quantity and summary reads.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::response::DataResponse;
use crate::app::AppState;
use crate::domain::reconcile::{reconcile, QuantityFilters, ReconciledQuantities};
use crate::error::{ApiError, ApiResult};
use crate::retrieval::sources::{ProjectSummary, StructuredStore};
use crate::services::cache::keys;

#[derive(Debug, Deserialize)]
pub struct QuantityParams {
    pub category: String,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

/// GET /projects/:project_id/quantities?category=valve&size=12-IN
///
/// Reconciled take-off counts from previously extracted records.
pub async fn list_quantities(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(params): Query<QuantityParams>,
) -> ApiResult<impl IntoResponse> {
    if params.category.trim().is_empty() {
        return Err(ApiError::bad_request("category must not be empty"));
    }

    let cache_key = keys::quantities(project_id, &params.category, params.size.as_deref());
    if params.min_confidence.is_none() {
        if let Some(cached) = state.cache.get::<ReconciledQuantities>(&cache_key).await {
            return Ok(Json(DataResponse::new(cached)));
        }
    }

    let rows = state
        .store
        .search_components(project_id, &params.category)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let filters = QuantityFilters {
        category: Some(params.category.clone()),
        size: params.size.clone(),
        min_confidence: params.min_confidence.unwrap_or(0.0),
    };
    let reconciled = reconcile(&rows, &filters);

    if params.min_confidence.is_none() {
        if let Err(e) = state.cache.set(&cache_key, &reconciled).await {
            tracing::warn!(error = %e, "failed to cache quantities");
        }
    }

    Ok(Json(DataResponse::new(reconciled)))
}

/// GET /projects/:project_id/summary
///
/// Pre-aggregated project summary.
pub async fn get_project_summary(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let cache_key = keys::project_summary(project_id);
    if let Some(cached) = state.cache.get::<ProjectSummary>(&cache_key).await {
        return Ok(Json(DataResponse::new(cached)));
    }

    let summary = state
        .store
        .project_summary(project_id)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("no extracted data for this project"))?;

    if let Err(e) = state.cache.set(&cache_key, &summary).await {
        tracing::warn!(error = %e, "failed to cache project summary");
    }

    Ok(Json(DataResponse::new(summary)))
}
