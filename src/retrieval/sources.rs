//! Collaborator interfaces for the retrieval router.
//!
//! The router and ingestion pipeline never talk to Postgres, the embedding
//! service, or the vision service directly; they hold trait-object handles
//! injected at construction time, so tests run against in-memory fakes.
//! Every method is a read (or an ingestion write) that can fail; failures
//! are represented as [`SourceError`] and never cross a routing step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::components::{ExtractedComponent, TerminationPoint, UtilityCrossing};

/// Error from a single collaborator call. Converted to "no result for this
/// step" by the router; only ingestion surfaces these to the caller.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("collaborator call timed out")]
    Timeout,

    #[error("malformed collaborator response: {0}")]
    InvalidResponse(String),
}

pub type SourceResult<T> = Result<T, SourceError>;

// ============================================================================
// Structured datastore
// ============================================================================

/// One utility system's totals within the pre-aggregated summary view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTotals {
    pub system_name: String,
    pub component_count: i64,
    pub total_length_lf: Option<f64>,
}

/// Pre-aggregated per-project summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project_id: Uuid,
    pub sheet_count: i64,
    pub crossing_count: i64,
    pub systems: Vec<SystemTotals>,
    pub last_extraction_at: Option<DateTime<Utc>>,
}

/// An embedded document fragment with its drawing provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub sheet_number: Option<String>,
    pub system_name: Option<String>,
    pub content: String,
    pub stations: Vec<String>,
}

/// A chunk returned by nearest-neighbor search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub similarity: f64,
}

/// A stored component row: the domain record plus its storage identity,
/// needed by the ingestion merge path.
#[derive(Debug, Clone)]
pub struct StoredComponent {
    pub id: Uuid,
    pub component: ExtractedComponent,
}

/// Read paths over the structured datastore.
#[async_trait]
pub trait StructuredStore: Send + Sync {
    /// Pre-aggregated summary view; `None` when the project has no data.
    async fn project_summary(&self, project_id: Uuid) -> SourceResult<Option<ProjectSummary>>;

    /// Fuzzy name search over extracted components.
    async fn search_components(
        &self,
        project_id: Uuid,
        name_query: &str,
    ) -> SourceResult<Vec<ExtractedComponent>>;

    /// All components attributed to a system, or the whole project when
    /// `system_name` is `None`.
    async fn components_for_system(
        &self,
        project_id: Uuid,
        system_name: Option<&str>,
    ) -> SourceResult<Vec<ExtractedComponent>>;

    /// Every chunk for a system. The complete-data path never samples.
    async fn system_chunks(
        &self,
        project_id: Uuid,
        system_name: Option<&str>,
    ) -> SourceResult<Vec<DocumentChunk>>;

    /// How often each system name is mentioned across the project's
    /// document set, used for dominant-system auto-detection.
    async fn system_mention_counts(&self, project_id: Uuid)
        -> SourceResult<Vec<(String, i64)>>;

    /// Exact lookup of termination points by utility name.
    async fn termination_points(
        &self,
        project_id: Uuid,
        utility_name: &str,
    ) -> SourceResult<Vec<TerminationPoint>>;

    /// Stored crossings, optionally narrowed to one crossing utility.
    async fn crossings(
        &self,
        project_id: Uuid,
        utility_name: Option<&str>,
    ) -> SourceResult<Vec<UtilityCrossing>>;

    /// Nearest-neighbor search over embedded chunks.
    async fn nearest_chunks(
        &self,
        project_id: Uuid,
        embedding: &[f32],
        limit: i64,
        sheet_number: Option<&str>,
    ) -> SourceResult<Vec<ScoredChunk>>;

    /// Bounded sheet set handed to on-demand visual analysis, plan and
    /// profile sheets first.
    async fn candidate_sheets(
        &self,
        project_id: Uuid,
        limit: i64,
    ) -> SourceResult<Vec<SheetPage>>;
}

/// Write paths used only by the ingestion pipeline.
#[async_trait]
pub trait ExtractionSink: Send + Sync {
    /// Stored components with a similar name, fetched for the
    /// duplicate-check-then-insert merge.
    async fn components_named(
        &self,
        project_id: Uuid,
        name: &str,
    ) -> SourceResult<Vec<StoredComponent>>;

    async fn insert_component(
        &self,
        project_id: Uuid,
        component: &ExtractedComponent,
    ) -> SourceResult<Uuid>;

    async fn replace_component(
        &self,
        id: Uuid,
        component: &ExtractedComponent,
    ) -> SourceResult<()>;

    async fn insert_termination_points(
        &self,
        project_id: Uuid,
        points: &[TerminationPoint],
    ) -> SourceResult<usize>;

    async fn insert_crossings(
        &self,
        project_id: Uuid,
        crossings: &[UtilityCrossing],
    ) -> SourceResult<usize>;
}

// ============================================================================
// Embedding service
// ============================================================================

#[async_trait]
pub trait EmbeddingSource: Send + Sync {
    /// Embed free text into the fixed-length vector used for
    /// nearest-neighbor lookup.
    async fn embed(&self, text: &str) -> SourceResult<Vec<f32>>;
}

// ============================================================================
// Vision extraction service
// ============================================================================

/// Task-specific instruction profile sent with a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionProfile {
    SheetClassification,
    ComponentExtraction,
    CrossingDetection,
}

/// One rasterized drawing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetPage {
    pub sheet_id: Uuid,
    pub sheet_number: Option<String>,
    pub page_number: i32,
    pub image_url: String,
}

/// Token/cost metadata reported by the vision service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

/// Structured output of one extraction call. Treated as the output of a
/// fallible oracle: validated for structure and range, never assumed
/// accurate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetExtraction {
    pub sheet_kind: Option<String>,
    pub components: Vec<ExtractedComponent>,
    pub termination_points: Vec<TerminationPoint>,
    pub crossings: Vec<UtilityCrossing>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Parameters for on-demand visual inspection: what to look for, and the
/// bounded sheet set to look in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualTask {
    pub component_category: Option<String>,
    pub size_filter: Option<String>,
    pub utility_name: Option<String>,
    pub sheets: Vec<SheetPage>,
}

/// Findings from an on-demand inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualFindings {
    pub narrative: String,
    pub components: Vec<ExtractedComponent>,
    pub crossings: Vec<UtilityCrossing>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl VisualFindings {
    pub fn is_empty(&self) -> bool {
        self.narrative.trim().is_empty() && self.components.is_empty() && self.crossings.is_empty()
    }
}

#[async_trait]
pub trait VisionSource: Send + Sync {
    /// Extract structured records from one page under a profile.
    async fn extract_sheet(
        &self,
        page: &SheetPage,
        profile: ExtractionProfile,
    ) -> SourceResult<SheetExtraction>;

    /// Inspect a bounded sheet set for a specific question.
    async fn inspect(&self, task: &VisualTask) -> SourceResult<VisualFindings>;
}
