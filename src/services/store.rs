//! Postgres-backed datastore adapter.
//!
//! Implements the router's read paths ([`StructuredStore`]) and the
//! ingestion write paths ([`ExtractionSink`]) over sqlx. Fuzzy name search
//! relies on the pg_trgm extension; nearest-neighbor search on the pgvector
//! extension (the embedding is passed as text and cast to `vector` in the
//! query). Numeric columns surface as `Decimal` rows and convert to `f64`
//! at the domain boundary.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::components::{
    ExtractedComponent, SourceContext, TerminationKind, TerminationPoint, UtilityCrossing,
};
use crate::retrieval::sources::{
    DocumentChunk, ExtractionSink, ProjectSummary, ScoredChunk, SheetPage, SourceError,
    SourceResult, StoredComponent, StructuredStore, SystemTotals,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> SourceError {
    SourceError::Unavailable(format!("database error: {}", e))
}

fn decimal_to_f64(d: sqlx::types::Decimal) -> f64 {
    use std::str::FromStr;
    f64::from_str(&d.to_string()).unwrap_or(0.0)
}

fn decimal_opt_to_f64(d: Option<sqlx::types::Decimal>) -> Option<f64> {
    d.map(decimal_to_f64)
}

fn source_context_from_str(raw: &str) -> SourceContext {
    match raw {
        "callout" => SourceContext::Callout,
        "quantity_table" => SourceContext::QuantityTable,
        "plan_note" => SourceContext::PlanNote,
        "profile_view" => SourceContext::ProfileView,
        "index_sheet" => SourceContext::IndexSheet,
        other => {
            tracing::warn!(source_context = other, "unknown source context; treating as plan note");
            SourceContext::PlanNote
        }
    }
}

fn termination_kind_from_str(raw: &str) -> TerminationKind {
    match raw {
        "begin" => TerminationKind::Begin,
        "end" => TerminationKind::End,
        "tie_in" => TerminationKind::TieIn,
        _ => TerminationKind::Terminus,
    }
}

fn termination_kind_str(kind: TerminationKind) -> &'static str {
    match kind {
        TerminationKind::Begin => "begin",
        TerminationKind::End => "end",
        TerminationKind::TieIn => "tie_in",
        TerminationKind::Terminus => "terminus",
    }
}

/// Encode an embedding for the `::vector` cast.
fn vector_literal(embedding: &[f32]) -> String {
    let inner: Vec<String> = embedding.iter().map(|v| v.to_string()).collect();
    format!("[{}]", inner.join(","))
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ComponentRow {
    id: Uuid,
    name: String,
    size: Option<String>,
    quantity: i64,
    station: Option<String>,
    sheet_number: Option<String>,
    source_context: String,
    confidence: sqlx::types::Decimal,
}

impl ComponentRow {
    fn into_component(self) -> ExtractedComponent {
        ExtractedComponent {
            name: self.name,
            size: self.size,
            quantity: self.quantity,
            station: self.station,
            sheet_number: self.sheet_number,
            source_context: source_context_from_str(&self.source_context),
            confidence: decimal_to_f64(self.confidence),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TerminationRow {
    utility_name: String,
    kind: String,
    station: String,
    station_numeric: sqlx::types::Decimal,
    sheet_number: Option<String>,
    confidence: sqlx::types::Decimal,
}

impl TerminationRow {
    fn into_point(self) -> TerminationPoint {
        TerminationPoint {
            utility_name: self.utility_name,
            kind: termination_kind_from_str(&self.kind),
            station: self.station,
            station_numeric: decimal_to_f64(self.station_numeric),
            sheet_number: self.sheet_number,
            confidence: decimal_to_f64(self.confidence),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CrossingRow {
    crossing_utility_code: String,
    full_name: String,
    station: Option<String>,
    elevation: Option<sqlx::types::Decimal>,
    is_existing: bool,
    is_proposed: bool,
    size: Option<String>,
    confidence: sqlx::types::Decimal,
}

impl CrossingRow {
    fn into_crossing(self) -> UtilityCrossing {
        UtilityCrossing {
            crossing_utility_code: self.crossing_utility_code,
            full_name: self.full_name,
            station: self.station,
            elevation: decimal_opt_to_f64(self.elevation),
            is_existing: self.is_existing,
            is_proposed: self.is_proposed,
            size: self.size,
            confidence: decimal_to_f64(self.confidence),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChunkRow {
    id: Uuid,
    sheet_number: Option<String>,
    system_name: Option<String>,
    content: String,
    stations: Vec<String>,
}

impl ChunkRow {
    fn into_chunk(self) -> DocumentChunk {
        DocumentChunk {
            id: self.id,
            sheet_number: self.sheet_number,
            system_name: self.system_name,
            content: self.content,
            stations: self.stations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScoredChunkRow {
    id: Uuid,
    sheet_number: Option<String>,
    system_name: Option<String>,
    content: String,
    stations: Vec<String>,
    similarity: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct SheetRow {
    id: Uuid,
    sheet_number: Option<String>,
    page_number: i32,
    image_url: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SystemTotalsRow {
    system_name: String,
    component_count: i64,
    total_length_lf: Option<sqlx::types::Decimal>,
}

// ============================================================================
// StructuredStore
// ============================================================================

#[async_trait]
impl StructuredStore for PgStore {
    async fn project_summary(&self, project_id: Uuid) -> SourceResult<Option<ProjectSummary>> {
        let sheet_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sheets WHERE project_id = $1")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

        if sheet_count == 0 {
            return Ok(None);
        }

        let crossing_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM utility_crossings WHERE project_id = $1")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

        let rows: Vec<SystemTotalsRow> = sqlx::query_as(
            "SELECT system_name, component_count, total_length_lf
             FROM project_system_totals
             WHERE project_id = $1
             ORDER BY system_name",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let last_extraction_at: Option<chrono::DateTime<chrono::Utc>> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM extracted_components WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Some(ProjectSummary {
            project_id,
            sheet_count,
            crossing_count,
            systems: rows
                .into_iter()
                .map(|r| SystemTotals {
                    system_name: r.system_name,
                    component_count: r.component_count,
                    total_length_lf: decimal_opt_to_f64(r.total_length_lf),
                })
                .collect(),
            last_extraction_at,
        }))
    }

    async fn search_components(
        &self,
        project_id: Uuid,
        name_query: &str,
    ) -> SourceResult<Vec<ExtractedComponent>> {
        let rows: Vec<ComponentRow> = sqlx::query_as(
            "SELECT id, name, size, quantity, station, sheet_number, source_context, confidence
             FROM extracted_components
             WHERE project_id = $1
               AND (name % $2 OR name ILIKE '%' || $2 || '%')
             ORDER BY confidence DESC",
        )
        .bind(project_id)
        .bind(name_query)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(ComponentRow::into_component).collect())
    }

    async fn components_for_system(
        &self,
        project_id: Uuid,
        system_name: Option<&str>,
    ) -> SourceResult<Vec<ExtractedComponent>> {
        let rows: Vec<ComponentRow> = sqlx::query_as(
            "SELECT id, name, size, quantity, station, sheet_number, source_context, confidence
             FROM extracted_components
             WHERE project_id = $1
               AND ($2::text IS NULL OR utility_system ILIKE $2 OR name ILIKE '%' || $2 || '%')
             ORDER BY station NULLS LAST",
        )
        .bind(project_id)
        .bind(system_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(ComponentRow::into_component).collect())
    }

    async fn system_chunks(
        &self,
        project_id: Uuid,
        system_name: Option<&str>,
    ) -> SourceResult<Vec<DocumentChunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(
            "SELECT id, sheet_number, system_name, content, stations
             FROM document_chunks
             WHERE project_id = $1
               AND ($2::text IS NULL OR system_name ILIKE $2)
             ORDER BY sheet_number NULLS LAST, id",
        )
        .bind(project_id)
        .bind(system_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(ChunkRow::into_chunk).collect())
    }

    async fn system_mention_counts(
        &self,
        project_id: Uuid,
    ) -> SourceResult<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT system_name, COUNT(*) AS mentions
             FROM document_chunks
             WHERE project_id = $1 AND system_name IS NOT NULL
             GROUP BY system_name
             ORDER BY mentions DESC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows)
    }

    async fn termination_points(
        &self,
        project_id: Uuid,
        utility_name: &str,
    ) -> SourceResult<Vec<TerminationPoint>> {
        let rows: Vec<TerminationRow> = sqlx::query_as(
            "SELECT utility_name, kind, station, station_numeric, sheet_number, confidence
             FROM termination_points
             WHERE project_id = $1 AND UPPER(utility_name) = UPPER($2)
             ORDER BY station_numeric",
        )
        .bind(project_id)
        .bind(utility_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(TerminationRow::into_point).collect())
    }

    async fn crossings(
        &self,
        project_id: Uuid,
        utility_name: Option<&str>,
    ) -> SourceResult<Vec<UtilityCrossing>> {
        let rows: Vec<CrossingRow> = sqlx::query_as(
            "SELECT crossing_utility_code, full_name, station, elevation,
                    is_existing, is_proposed, size, confidence
             FROM utility_crossings
             WHERE project_id = $1
               AND ($2::text IS NULL OR full_name ILIKE '%' || $2 || '%')
             ORDER BY station NULLS LAST",
        )
        .bind(project_id)
        .bind(utility_name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(CrossingRow::into_crossing).collect())
    }

    async fn nearest_chunks(
        &self,
        project_id: Uuid,
        embedding: &[f32],
        limit: i64,
        sheet_number: Option<&str>,
    ) -> SourceResult<Vec<ScoredChunk>> {
        let rows: Vec<ScoredChunkRow> = sqlx::query_as(
            "SELECT id, sheet_number, system_name, content, stations,
                    1 - (embedding <=> $2::vector) AS similarity
             FROM document_chunks
             WHERE project_id = $1
               AND ($3::text IS NULL OR sheet_number = $3)
             ORDER BY embedding <=> $2::vector
             LIMIT $4",
        )
        .bind(project_id)
        .bind(vector_literal(embedding))
        .bind(sheet_number)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| ScoredChunk {
                chunk: DocumentChunk {
                    id: r.id,
                    sheet_number: r.sheet_number,
                    system_name: r.system_name,
                    content: r.content,
                    stations: r.stations,
                },
                similarity: r.similarity,
            })
            .collect())
    }

    async fn candidate_sheets(
        &self,
        project_id: Uuid,
        limit: i64,
    ) -> SourceResult<Vec<SheetPage>> {
        // Plan/profile sheets carry the callouts; index and cover sheets
        // go last.
        let rows: Vec<SheetRow> = sqlx::query_as(
            "SELECT id, sheet_number, page_number, image_url
             FROM sheets
             WHERE project_id = $1
             ORDER BY CASE WHEN sheet_kind IN ('plan', 'plan_profile', 'profile') THEN 0
                           WHEN sheet_kind = 'detail' THEN 1
                           ELSE 2 END,
                      page_number
             LIMIT $2",
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| SheetPage {
                sheet_id: r.id,
                sheet_number: r.sheet_number,
                page_number: r.page_number,
                image_url: r.image_url,
            })
            .collect())
    }
}

// ============================================================================
// ExtractionSink
// ============================================================================

#[async_trait]
impl ExtractionSink for PgStore {
    async fn components_named(
        &self,
        project_id: Uuid,
        name: &str,
    ) -> SourceResult<Vec<StoredComponent>> {
        let rows: Vec<ComponentRow> = sqlx::query_as(
            "SELECT id, name, size, quantity, station, sheet_number, source_context, confidence
             FROM extracted_components
             WHERE project_id = $1 AND name ILIKE $2",
        )
        .bind(project_id)
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let id = r.id;
                StoredComponent {
                    id,
                    component: r.into_component(),
                }
            })
            .collect())
    }

    async fn insert_component(
        &self,
        project_id: Uuid,
        component: &ExtractedComponent,
    ) -> SourceResult<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO extracted_components
                 (project_id, name, size, quantity, station, sheet_number,
                  source_context, confidence)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(project_id)
        .bind(&component.name)
        .bind(&component.size)
        .bind(component.quantity)
        .bind(&component.station)
        .bind(&component.sheet_number)
        .bind(component.source_context.to_string())
        .bind(component.confidence)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(id)
    }

    async fn replace_component(
        &self,
        id: Uuid,
        component: &ExtractedComponent,
    ) -> SourceResult<()> {
        sqlx::query(
            "UPDATE extracted_components
             SET quantity = $2, station = $3, sheet_number = $4,
                 source_context = $5, confidence = $6, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(component.quantity)
        .bind(&component.station)
        .bind(&component.sheet_number)
        .bind(component.source_context.to_string())
        .bind(component.confidence)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn insert_termination_points(
        &self,
        project_id: Uuid,
        points: &[TerminationPoint],
    ) -> SourceResult<usize> {
        let mut inserted = 0usize;
        for point in points {
            sqlx::query(
                "INSERT INTO termination_points
                     (project_id, utility_name, kind, station, station_numeric,
                      sheet_number, confidence)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(project_id)
            .bind(&point.utility_name)
            .bind(termination_kind_str(point.kind))
            .bind(&point.station)
            .bind(point.station_numeric)
            .bind(&point.sheet_number)
            .bind(point.confidence)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn insert_crossings(
        &self,
        project_id: Uuid,
        crossings: &[UtilityCrossing],
    ) -> SourceResult<usize> {
        let mut inserted = 0usize;
        for crossing in crossings {
            sqlx::query(
                "INSERT INTO utility_crossings
                     (project_id, crossing_utility_code, full_name, station,
                      elevation, is_existing, is_proposed, size, confidence)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(project_id)
            .bind(&crossing.crossing_utility_code)
            .bind(&crossing.full_name)
            .bind(&crossing.station)
            .bind(crossing.elevation)
            .bind(crossing.is_existing)
            .bind(crossing.is_proposed)
            .bind(&crossing.size)
            .bind(crossing.confidence)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            inserted += 1;
        }
        Ok(inserted)
    }
}
