//! Retrieval router.
//!
//! One routing operation per question: classify, then walk a fixed
//! priority chain of data sources, short-circuiting on the first one that
//! answers. Later steps are deliberately more expensive; they only run
//! when cheaper ones fail. Collaborator errors and timeouts are downgraded
//! to "no result for this step"; a routing operation never returns an
//! error, only a (possibly not-found) [`RoutingResult`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::classify::{classify, QueryClassification, QueryIntent, QueryType};
use crate::domain::components::{normalize_name, ExtractedComponent, SourceContext, UtilityCrossing};
use crate::domain::reconcile::{reconcile, reconcile_sum, QuantityFilters, ReconciledQuantities};
use crate::retrieval::length::{
    derive_lengths, resolve_length, LengthCandidate, LengthSource, ResolvedLength,
};
use crate::retrieval::sources::{
    DocumentChunk, EmbeddingSource, ProjectSummary, ScoredChunk, SourceResult, StructuredStore,
    VisionSource, VisualTask,
};

/// Sheets handed to on-demand visual analysis at most.
const VISUAL_SHEET_LIMIT: i64 = 6;

/// Share of document mentions a system must hold to be auto-detected as
/// the dominant one.
const DOMINANT_SYSTEM_SHARE: f64 = 0.8;

/// Caller-tunable routing options.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    pub max_results: i64,
    pub min_confidence: f64,
    /// Deadline for each step; an elapsed step is treated exactly like a
    /// failed collaborator call.
    pub step_timeout: Duration,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            max_results: 8,
            min_confidence: 0.0,
            step_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    DirectOnly,
    VectorOnly,
    Hybrid,
    CompleteData,
    VisualAnalysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Answered,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStep {
    SummaryLookup,
    DirectLookup,
    CompleteData,
    VectorSearch,
    VisualAnalysis,
}

impl RouteStep {
    const ALL: [RouteStep; 5] = [
        RouteStep::SummaryLookup,
        RouteStep::DirectLookup,
        RouteStep::CompleteData,
        RouteStep::VectorSearch,
        RouteStep::VisualAnalysis,
    ];
}

/// Provenance for one step of the chain.
#[derive(Debug, Clone, Serialize)]
pub struct SourceAttempt {
    pub step: RouteStep,
    pub attempted: bool,
    pub produced_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// The router's output. Built once per query and never cached across
/// queries; each question may require fresh structured data.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingResult {
    pub classification: QueryClassification,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<RetrievalMethod>,
    pub status: RouteStatus,
    pub sources: Vec<SourceAttempt>,
    pub cautions: Vec<String>,
    pub confidence: f64,
    pub timing_ms: u64,
}

#[derive(Default)]
struct Trace {
    attempts: Vec<SourceAttempt>,
    cautions: Vec<String>,
}

impl Trace {
    fn record(&mut self, step: RouteStep, produced_data: bool, note: Option<String>) {
        self.attempts.push(SourceAttempt {
            step,
            attempted: true,
            produced_data,
            note,
        });
    }

    fn caution(&mut self, message: impl Into<String>) {
        self.cautions.push(message.into());
    }
}

/// Run one collaborator call under the step deadline, downgrading errors
/// and timeouts to `None`.
async fn guarded<T, F>(step: RouteStep, deadline: Duration, call: F) -> Option<T>
where
    F: Future<Output = SourceResult<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(step = ?step, error = %e, "retrieval step failed; falling through");
            None
        }
        Err(_) => {
            warn!(step = ?step, "retrieval step timed out; falling through");
            None
        }
    }
}

/// The orchestrator. Holds injected collaborator handles; no global state.
pub struct RetrievalRouter {
    store: Arc<dyn StructuredStore>,
    embeddings: Arc<dyn EmbeddingSource>,
    vision: Arc<dyn VisionSource>,
}

impl RetrievalRouter {
    pub fn new(
        store: Arc<dyn StructuredStore>,
        embeddings: Arc<dyn EmbeddingSource>,
        vision: Arc<dyn VisionSource>,
    ) -> Self {
        Self {
            store,
            embeddings,
            vision,
        }
    }

    /// Route one question against one project.
    pub async fn route(
        &self,
        query: &str,
        project_id: Uuid,
        options: &RouteOptions,
    ) -> RoutingResult {
        let started = Instant::now();
        let classification = classify(query);
        debug!(
            query_type = ?classification.query_type,
            intent = ?classification.intent,
            "classified query"
        );

        let mut trace = Trace::default();
        let deadline = options.step_timeout;

        // Step 1: pre-aggregated summary store.
        if classification.query_type == QueryType::ProjectSummary {
            match guarded(
                RouteStep::SummaryLookup,
                deadline,
                self.store.project_summary(project_id),
            )
            .await
            {
                Some(Some(summary)) => {
                    trace.record(RouteStep::SummaryLookup, true, None);
                    let confidence = classification.confidence;
                    return finish(
                        classification,
                        render_summary(&summary),
                        Some(RetrievalMethod::DirectOnly),
                        RouteStatus::Answered,
                        trace,
                        confidence,
                        started,
                    );
                }
                Some(None) => trace.record(RouteStep::SummaryLookup, false, None),
                None => trace.record(
                    RouteStep::SummaryLookup,
                    false,
                    Some("summary lookup failed".to_string()),
                ),
            }
        }

        // Step 2: direct structured lookup.
        let mut direct_partial: Vec<ExtractedComponent> = Vec::new();
        if classification.needs_direct_lookup {
            if classification.query_type == QueryType::UtilityCrossing {
                if let Some(result) = self
                    .direct_crossings(&classification, project_id, deadline, &mut trace)
                    .await
                {
                    let confidence = classification.confidence;
                    return finish(
                        classification,
                        result,
                        Some(RetrievalMethod::DirectOnly),
                        RouteStatus::Answered,
                        trace,
                        confidence,
                        started,
                    );
                }
            } else if classification.is_aggregation
                && classification.system_name.is_some()
                && classification.item_name.is_none()
            {
                if let Some((context, resolved)) = self
                    .direct_length(&classification, project_id, deadline, &mut trace)
                    .await
                {
                    return finish(
                        classification,
                        context,
                        Some(RetrievalMethod::DirectOnly),
                        RouteStatus::Answered,
                        trace,
                        resolved.confidence,
                        started,
                    );
                }
            } else if classification.item_name.is_some() {
                match self
                    .direct_components(&classification, project_id, options, deadline, &mut trace)
                    .await
                {
                    DirectOutcome::Answered { context, confidence } => {
                        return finish(
                            classification,
                            context,
                            Some(RetrievalMethod::DirectOnly),
                            RouteStatus::Answered,
                            trace,
                            confidence,
                            started,
                        );
                    }
                    DirectOutcome::Partial(rows) => direct_partial = rows,
                    DirectOutcome::Nothing => {}
                }
            }
        }

        // Step 3: complete dataset for a system.
        if classification.needs_complete_data {
            let system = self
                .resolve_system(&classification, project_id, deadline)
                .await;
            match guarded(
                RouteStep::CompleteData,
                deadline,
                self.store.system_chunks(project_id, system.as_deref()),
            )
            .await
            {
                Some(chunks) if !chunks.is_empty() => {
                    trace.record(RouteStep::CompleteData, true, None);
                    if !direct_partial.is_empty() {
                        trace.caution(
                            "structured take-off records matched the component name but \
                             not the requested filters; answer assembled from full drawing text",
                        );
                    }
                    let confidence = classification.confidence;
                    return finish(
                        classification,
                        render_chunks(&chunks, &direct_partial),
                        Some(RetrievalMethod::CompleteData),
                        RouteStatus::Answered,
                        trace,
                        confidence,
                        started,
                    );
                }
                Some(_) => trace.record(RouteStep::CompleteData, false, None),
                None => trace.record(
                    RouteStep::CompleteData,
                    false,
                    Some("complete-data fetch failed".to_string()),
                ),
            }
        }

        // Step 4: similarity search over embedded chunks.
        if classification.needs_vector_search {
            if let Some(hits) = self
                .vector_search(query, &classification, project_id, options, deadline, &mut trace)
                .await
            {
                let method = if direct_partial.is_empty() {
                    RetrievalMethod::VectorOnly
                } else {
                    RetrievalMethod::Hybrid
                };
                if classification.needs_direct_lookup {
                    trace.caution(
                        "structured records did not answer this question directly; \
                         similarity-matched drawing text used instead",
                    );
                }
                let top_similarity = hits.first().map(|h| h.similarity).unwrap_or(0.0);
                let confidence = classification.confidence.min(top_similarity);
                return finish(
                    classification,
                    render_scored_chunks(&hits, &direct_partial),
                    Some(method),
                    RouteStatus::Answered,
                    trace,
                    confidence,
                    started,
                );
            }
        }

        // Step 5: on-demand visual analysis, the most expensive path.
        if classification.needs_visual_analysis {
            if let Some((context, confidence)) = self
                .visual_analysis(&classification, project_id, deadline, &mut trace)
                .await
            {
                trace.caution(
                    "answer produced by on-demand drawing inspection; \
                     not yet reconciled against structured records",
                );
                return finish(
                    classification,
                    context,
                    Some(RetrievalMethod::VisualAnalysis),
                    RouteStatus::Answered,
                    trace,
                    confidence,
                    started,
                );
            }
        }

        finish(
            classification,
            String::new(),
            None,
            RouteStatus::NotFound,
            trace,
            0.0,
            started,
        )
    }

    async fn direct_crossings(
        &self,
        classification: &QueryClassification,
        project_id: Uuid,
        deadline: Duration,
        trace: &mut Trace,
    ) -> Option<String> {
        match guarded(
            RouteStep::DirectLookup,
            deadline,
            self.store
                .crossings(project_id, classification.system_name.as_deref()),
        )
        .await
        {
            Some(crossings) if !crossings.is_empty() => {
                trace.record(RouteStep::DirectLookup, true, None);
                Some(render_crossings(&crossings))
            }
            Some(_) => {
                trace.record(RouteStep::DirectLookup, false, None);
                None
            }
            None => {
                trace.record(
                    RouteStep::DirectLookup,
                    false,
                    Some("crossing lookup failed".to_string()),
                );
                None
            }
        }
    }

    /// Length resolution for `total length of <system>` questions:
    /// termination-point pairs first, then stored aggregates, then
    /// index-sheet records.
    async fn direct_length(
        &self,
        classification: &QueryClassification,
        project_id: Uuid,
        deadline: Duration,
        trace: &mut Trace,
    ) -> Option<(String, ResolvedLength)> {
        let system = classification.system_name.as_deref()?;

        let points = guarded(
            RouteStep::DirectLookup,
            deadline,
            self.store.termination_points(project_id, system),
        )
        .await
        .unwrap_or_default();

        let stored = guarded(
            RouteStep::DirectLookup,
            deadline,
            self.store.components_for_system(project_id, Some(system)),
        )
        .await
        .unwrap_or_default();

        let mut candidates: Vec<LengthCandidate> = Vec::new();

        let derivation = derive_lengths(&points);
        for warning in &derivation.warnings {
            trace.caution(warning.clone());
        }
        if let Some(length) = derivation
            .lengths
            .iter()
            .find(|l| normalize_name(&l.utility_name) == normalize_name(system))
        {
            candidates.push(LengthCandidate {
                source: LengthSource::TerminationPoints,
                length_lf: length.length_lf,
                confidence: length.confidence,
            });
        }

        for record in &stored {
            if record.quantity <= 0 {
                continue;
            }
            let source = match record.source_context {
                SourceContext::QuantityTable => LengthSource::StoredAggregate,
                SourceContext::IndexSheet => LengthSource::IndexSheet,
                _ => continue,
            };
            candidates.push(LengthCandidate {
                source,
                length_lf: record.quantity as f64,
                confidence: record.confidence,
            });
        }

        match resolve_length(&candidates) {
            Some(resolved) => {
                trace.record(RouteStep::DirectLookup, true, None);
                if let Some(caution) = &resolved.caution {
                    trace.caution(caution.clone());
                }
                Some((render_length(system, &resolved), resolved))
            }
            None => {
                trace.record(RouteStep::DirectLookup, false, None);
                None
            }
        }
    }

    async fn direct_components(
        &self,
        classification: &QueryClassification,
        project_id: Uuid,
        options: &RouteOptions,
        deadline: Duration,
        trace: &mut Trace,
    ) -> DirectOutcome {
        let item_name = classification
            .item_name
            .as_deref()
            .unwrap_or_default()
            .to_string();

        let rows = match guarded(
            RouteStep::DirectLookup,
            deadline,
            self.store.search_components(project_id, &item_name),
        )
        .await
        {
            Some(rows) => rows,
            None => {
                trace.record(
                    RouteStep::DirectLookup,
                    false,
                    Some("component lookup failed".to_string()),
                );
                return DirectOutcome::Nothing;
            }
        };

        let filters = QuantityFilters {
            category: Some(item_name),
            size: classification.size_filter.clone(),
            min_confidence: options.min_confidence,
        };
        let reconciled = reconcile(&rows, &filters);

        if reconciled.excluded > 0 {
            trace.caution(format!(
                "{} record(s) with unparseable stations were excluded from the count",
                reconciled.excluded
            ));
        }

        if !reconciled.items.is_empty() {
            trace.record(RouteStep::DirectLookup, true, None);
            let confidence = weighted_confidence(&reconciled)
                .min(classification.confidence);
            let context = if classification.is_aggregation {
                render_aggregation(classification, &reconcile_sum(&rows, &filters))
            } else {
                render_quantities(classification, &reconciled)
            };
            return DirectOutcome::Answered {
                context,
                confidence,
            };
        }

        trace.record(RouteStep::DirectLookup, !rows.is_empty(), None);
        if rows.is_empty() {
            DirectOutcome::Nothing
        } else {
            // Name matched but filters did not: keep as partial data so a
            // later step's answer is merged and flagged, never silently
            // substituted.
            DirectOutcome::Partial(rows)
        }
    }

    /// Resolve the system to scope the complete-data fetch. When the query
    /// names none, auto-detect the dominant one by mention share; below
    /// the threshold the fetch stays unscoped.
    async fn resolve_system(
        &self,
        classification: &QueryClassification,
        project_id: Uuid,
        deadline: Duration,
    ) -> Option<String> {
        if let Some(system) = &classification.system_name {
            return Some(system.clone());
        }

        let mut counts = guarded(
            RouteStep::CompleteData,
            deadline,
            self.store.system_mention_counts(project_id),
        )
        .await?;

        counts.sort_by(|a, b| b.1.cmp(&a.1));
        let total: i64 = counts.iter().map(|(_, n)| n).sum();
        let (name, top) = counts.first()?;
        if total > 0 && (*top as f64) / (total as f64) > DOMINANT_SYSTEM_SHARE {
            debug!(system = %name, "auto-detected dominant system");
            Some(name.clone())
        } else {
            None
        }
    }

    async fn vector_search(
        &self,
        query: &str,
        classification: &QueryClassification,
        project_id: Uuid,
        options: &RouteOptions,
        deadline: Duration,
        trace: &mut Trace,
    ) -> Option<Vec<ScoredChunk>> {
        let embedding = match guarded(
            RouteStep::VectorSearch,
            deadline,
            self.embeddings.embed(query),
        )
        .await
        {
            Some(embedding) => embedding,
            None => {
                trace.record(
                    RouteStep::VectorSearch,
                    false,
                    Some("embedding failed".to_string()),
                );
                return None;
            }
        };

        let hits = match guarded(
            RouteStep::VectorSearch,
            deadline,
            self.store.nearest_chunks(
                project_id,
                &embedding,
                options.max_results,
                classification.sheet_number.as_deref(),
            ),
        )
        .await
        {
            Some(hits) => hits,
            None => {
                trace.record(
                    RouteStep::VectorSearch,
                    false,
                    Some("nearest-neighbor search failed".to_string()),
                );
                return None;
            }
        };

        let hits: Vec<ScoredChunk> = hits
            .into_iter()
            .filter(|h| h.similarity >= options.min_confidence)
            .collect();

        let produced = !hits.is_empty();
        trace.record(RouteStep::VectorSearch, produced, None);
        produced.then_some(hits)
    }

    async fn visual_analysis(
        &self,
        classification: &QueryClassification,
        project_id: Uuid,
        deadline: Duration,
        trace: &mut Trace,
    ) -> Option<(String, f64)> {
        let sheets = guarded(
            RouteStep::VisualAnalysis,
            deadline,
            self.store.candidate_sheets(project_id, VISUAL_SHEET_LIMIT),
        )
        .await
        .unwrap_or_default();

        if sheets.is_empty() {
            trace.record(
                RouteStep::VisualAnalysis,
                false,
                Some("no candidate sheets".to_string()),
            );
            return None;
        }

        let task = VisualTask {
            component_category: classification.item_name.clone(),
            size_filter: classification.size_filter.clone(),
            utility_name: classification.system_name.clone(),
            sheets,
        };

        match guarded(RouteStep::VisualAnalysis, deadline, self.vision.inspect(&task)).await {
            Some(findings) if !findings.is_empty() => {
                trace.record(RouteStep::VisualAnalysis, true, None);
                let confidence = findings
                    .components
                    .iter()
                    .map(|c| c.confidence)
                    .chain(findings.crossings.iter().map(|c| c.confidence))
                    .fold(f64::NAN, f64::min);
                let confidence = if confidence.is_nan() {
                    classification.confidence
                } else {
                    confidence.min(classification.confidence)
                };
                Some((render_findings(&findings), confidence))
            }
            Some(_) => {
                trace.record(RouteStep::VisualAnalysis, false, None);
                None
            }
            None => {
                trace.record(
                    RouteStep::VisualAnalysis,
                    false,
                    Some("visual inspection failed".to_string()),
                );
                None
            }
        }
    }
}

enum DirectOutcome {
    Answered { context: String, confidence: f64 },
    Partial(Vec<ExtractedComponent>),
    Nothing,
}

fn finish(
    classification: QueryClassification,
    context: String,
    method: Option<RetrievalMethod>,
    status: RouteStatus,
    mut trace: Trace,
    confidence: f64,
    started: Instant,
) -> RoutingResult {
    for step in RouteStep::ALL {
        if !trace.attempts.iter().any(|a| a.step == step) {
            trace.attempts.push(SourceAttempt {
                step,
                attempted: false,
                produced_data: false,
                note: None,
            });
        }
    }
    trace.attempts.sort_by_key(|a| a.step);

    RoutingResult {
        classification,
        context,
        method,
        status,
        sources: trace.attempts,
        cautions: trace.cautions,
        confidence,
        timing_ms: started.elapsed().as_millis() as u64,
    }
}

fn weighted_confidence(reconciled: &ReconciledQuantities) -> f64 {
    if reconciled.total_count == 0 {
        return 0.0;
    }
    reconciled
        .by_size
        .values()
        .map(|b| b.avg_confidence * b.quantity as f64)
        .sum::<f64>()
        / reconciled.total_count as f64
}

// ============================================================================
// Context rendering
// ============================================================================

fn render_summary(summary: &ProjectSummary) -> String {
    let mut out = format!(
        "Project summary: {} sheet(s), {} utility crossing(s).\n",
        summary.sheet_count, summary.crossing_count
    );
    for system in &summary.systems {
        match system.total_length_lf {
            Some(length) => out.push_str(&format!(
                "- {}: {} component(s), {:.2} LF\n",
                system.system_name, system.component_count, length
            )),
            None => out.push_str(&format!(
                "- {}: {} component(s), length not established\n",
                system.system_name, system.component_count
            )),
        }
    }
    out
}

fn render_crossings(crossings: &[UtilityCrossing]) -> String {
    let mut out = format!("{} utility crossing(s) on record:\n", crossings.len());
    for crossing in crossings {
        let status = match (crossing.is_existing, crossing.is_proposed) {
            (true, false) => "existing",
            (false, true) => "proposed",
            _ => "existing/proposed",
        };
        out.push_str(&format!(
            "- {} ({}, {})",
            crossing.full_name, crossing.crossing_utility_code, status
        ));
        if let Some(station) = &crossing.station {
            out.push_str(&format!(" at STA {}", station));
        }
        if let Some(size) = &crossing.size {
            out.push_str(&format!(", {}", size));
        }
        if let Some(elevation) = crossing.elevation {
            out.push_str(&format!(", EL {:.2}", elevation));
        }
        out.push('\n');
    }
    out
}

fn render_length(system: &str, resolved: &ResolvedLength) -> String {
    format!(
        "Total length of {}: {:.2} LF (source: {:?}, confidence {:.2}).\n",
        system, resolved.length_lf, resolved.source, resolved.confidence
    )
}

fn render_quantities(
    classification: &QueryClassification,
    reconciled: &ReconciledQuantities,
) -> String {
    let subject = classification.item_name.as_deref().unwrap_or("components");
    let mut out = format!(
        "{} matching {} found in structured records.\n",
        reconciled.total_count, subject
    );
    for (size, bucket) in &reconciled.by_size {
        out.push_str(&format!(
            "- {}: {} (avg confidence {:.2})\n",
            size, bucket.quantity, bucket.avg_confidence
        ));
    }
    if classification.intent == QueryIntent::Locational {
        for item in &reconciled.items {
            out.push_str(&format!("- {}", item.name));
            if let Some(station) = &item.station {
                out.push_str(&format!(" at STA {}", station));
            }
            if let Some(sheet) = &item.sheet_number {
                out.push_str(&format!(" (sheet {})", sheet));
            }
            out.push('\n');
        }
    }
    out
}

fn render_aggregation(
    classification: &QueryClassification,
    summary: &crate::domain::reconcile::AggregationResult,
) -> String {
    let subject = classification.item_name.as_deref().unwrap_or("components");
    let mut out = format!(
        "Total {}: {} across {} line item(s) (avg confidence {:.2}).\n",
        subject, summary.total_quantity, summary.line_items, summary.avg_confidence
    );
    match &summary.breakdown {
        Some(breakdown) => {
            for (size, quantity) in breakdown {
                out.push_str(&format!("- {}: {}\n", size, quantity));
            }
        }
        None => out.push_str("(breakdown omitted: too many line items)\n"),
    }
    out
}

fn render_partial(partial: &[ExtractedComponent], out: &mut String) {
    if partial.is_empty() {
        return;
    }
    out.push_str("Related structured records (did not match all filters):\n");
    for record in partial.iter().take(10) {
        out.push_str(&format!("- {}", record.name));
        if let Some(size) = &record.size {
            out.push_str(&format!(" {}", size));
        }
        if let Some(station) = &record.station {
            out.push_str(&format!(" at STA {}", station));
        }
        out.push('\n');
    }
}

fn render_chunks(chunks: &[DocumentChunk], partial: &[ExtractedComponent]) -> String {
    let mut out = String::new();
    render_partial(partial, &mut out);
    for chunk in chunks {
        if let Some(sheet) = &chunk.sheet_number {
            out.push_str(&format!("[sheet {}] ", sheet));
        }
        out.push_str(chunk.content.trim());
        out.push('\n');
    }
    out
}

fn render_scored_chunks(hits: &[ScoredChunk], partial: &[ExtractedComponent]) -> String {
    let mut out = String::new();
    render_partial(partial, &mut out);
    for hit in hits {
        if let Some(sheet) = &hit.chunk.sheet_number {
            out.push_str(&format!("[sheet {}, sim {:.2}] ", sheet, hit.similarity));
        } else {
            out.push_str(&format!("[sim {:.2}] ", hit.similarity));
        }
        out.push_str(hit.chunk.content.trim());
        out.push('\n');
    }
    out
}

fn render_findings(findings: &crate::retrieval::sources::VisualFindings) -> String {
    let mut out = String::new();
    if !findings.narrative.trim().is_empty() {
        out.push_str(findings.narrative.trim());
        out.push('\n');
    }
    if !findings.crossings.is_empty() {
        out.push_str(&render_crossings(&findings.crossings));
    }
    for component in &findings.components {
        out.push_str(&format!("- {} (x{})", component.name, component.quantity));
        if let Some(station) = &component.station {
            out.push_str(&format!(" at STA {}", station));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::components::{TerminationKind, TerminationPoint};
    use crate::domain::station::parse_station;
    use crate::retrieval::sources::{
        EmbeddingSource, ExtractionProfile, ProjectSummary, SheetExtraction, SheetPage,
        SourceError, StructuredStore, SystemTotals, TokenUsage, VisionSource, VisualFindings,
    };
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeStore {
        summary: Option<ProjectSummary>,
        components: Vec<ExtractedComponent>,
        chunks: Vec<DocumentChunk>,
        scored: Vec<ScoredChunk>,
        termination_points: Vec<TerminationPoint>,
        crossings: Vec<UtilityCrossing>,
        mentions: Vec<(String, i64)>,
        sheets: Vec<SheetPage>,
        fail_components: bool,
    }

    #[async_trait]
    impl StructuredStore for FakeStore {
        async fn project_summary(&self, _p: Uuid) -> SourceResult<Option<ProjectSummary>> {
            Ok(self.summary.clone())
        }

        async fn search_components(
            &self,
            _p: Uuid,
            _name: &str,
        ) -> SourceResult<Vec<ExtractedComponent>> {
            if self.fail_components {
                return Err(SourceError::Unavailable("store down".to_string()));
            }
            Ok(self.components.clone())
        }

        async fn components_for_system(
            &self,
            _p: Uuid,
            _system: Option<&str>,
        ) -> SourceResult<Vec<ExtractedComponent>> {
            Ok(self.components.clone())
        }

        async fn system_chunks(
            &self,
            _p: Uuid,
            _system: Option<&str>,
        ) -> SourceResult<Vec<DocumentChunk>> {
            Ok(self.chunks.clone())
        }

        async fn system_mention_counts(&self, _p: Uuid) -> SourceResult<Vec<(String, i64)>> {
            Ok(self.mentions.clone())
        }

        async fn termination_points(
            &self,
            _p: Uuid,
            _utility: &str,
        ) -> SourceResult<Vec<TerminationPoint>> {
            Ok(self.termination_points.clone())
        }

        async fn crossings(
            &self,
            _p: Uuid,
            _utility: Option<&str>,
        ) -> SourceResult<Vec<UtilityCrossing>> {
            Ok(self.crossings.clone())
        }

        async fn nearest_chunks(
            &self,
            _p: Uuid,
            _embedding: &[f32],
            _limit: i64,
            _sheet: Option<&str>,
        ) -> SourceResult<Vec<ScoredChunk>> {
            Ok(self.scored.clone())
        }

        async fn candidate_sheets(&self, _p: Uuid, _limit: i64) -> SourceResult<Vec<SheetPage>> {
            Ok(self.sheets.clone())
        }
    }

    struct FakeEmbeddings;

    #[async_trait]
    impl EmbeddingSource for FakeEmbeddings {
        async fn embed(&self, _text: &str) -> SourceResult<Vec<f32>> {
            Ok(vec![0.1; 4])
        }
    }

    #[derive(Default)]
    struct FakeVision {
        findings: Option<VisualFindings>,
    }

    #[async_trait]
    impl VisionSource for FakeVision {
        async fn extract_sheet(
            &self,
            _page: &SheetPage,
            _profile: ExtractionProfile,
        ) -> SourceResult<SheetExtraction> {
            Err(SourceError::Unavailable("not under test".to_string()))
        }

        async fn inspect(&self, _task: &VisualTask) -> SourceResult<VisualFindings> {
            self.findings
                .clone()
                .ok_or_else(|| SourceError::Unavailable("vision down".to_string()))
        }
    }

    fn component(name: &str, size: Option<&str>, station: &str, quantity: i64) -> ExtractedComponent {
        ExtractedComponent {
            name: name.to_string(),
            size: size.map(String::from),
            quantity,
            station: Some(station.to_string()),
            sheet_number: Some("C-4".to_string()),
            source_context: SourceContext::Callout,
            confidence: 0.9,
        }
    }

    fn chunk(content: &str) -> DocumentChunk {
        DocumentChunk {
            id: Uuid::new_v4(),
            sheet_number: Some("C-4".to_string()),
            system_name: Some("Water Line A".to_string()),
            content: content.to_string(),
            stations: vec![],
        }
    }

    fn scored(content: &str, similarity: f64) -> ScoredChunk {
        ScoredChunk {
            chunk: chunk(content),
            similarity,
        }
    }

    fn sheet() -> SheetPage {
        SheetPage {
            sheet_id: Uuid::new_v4(),
            sheet_number: Some("C-4".to_string()),
            page_number: 4,
            image_url: "https://sheets.example/c-4.png".to_string(),
        }
    }

    fn router(store: FakeStore, vision: FakeVision) -> RetrievalRouter {
        RetrievalRouter::new(Arc::new(store), Arc::new(FakeEmbeddings), Arc::new(vision))
    }

    fn attempt(result: &RoutingResult, step: RouteStep) -> &SourceAttempt {
        result
            .sources
            .iter()
            .find(|a| a.step == step)
            .expect("every step is listed")
    }

    #[tokio::test]
    async fn direct_result_wins_over_vector() {
        let store = FakeStore {
            components: vec![component("gate valve", Some("12-IN"), "12+05", 2)],
            scored: vec![scored("some similar text", 0.9)],
            ..Default::default()
        };
        let router = router(store, FakeVision::default());

        let result = router
            .route("how many gate valves", Uuid::new_v4(), &RouteOptions::default())
            .await;

        assert_eq!(result.status, RouteStatus::Answered);
        assert_eq!(result.method, Some(RetrievalMethod::DirectOnly));
        assert!(attempt(&result, RouteStep::DirectLookup).produced_data);
        assert!(!attempt(&result, RouteStep::VectorSearch).attempted);
        assert!(result.context.contains("2"));
    }

    #[tokio::test]
    async fn fallback_chain_reaches_vector_search() {
        // Direct lookup fails, complete data returns zero chunks; vector
        // search must still be attempted.
        let store = FakeStore {
            fail_components: true,
            scored: vec![scored("12-IN gate valves per plan", 0.82)],
            ..Default::default()
        };
        let router = router(store, FakeVision::default());

        let result = router
            .route("how many gate valves", Uuid::new_v4(), &RouteOptions::default())
            .await;

        assert_eq!(result.status, RouteStatus::Answered);
        assert_eq!(result.method, Some(RetrievalMethod::VectorOnly));
        assert!(attempt(&result, RouteStep::DirectLookup).attempted);
        assert!(!attempt(&result, RouteStep::DirectLookup).produced_data);
        assert!(attempt(&result, RouteStep::CompleteData).attempted);
        assert!(attempt(&result, RouteStep::VectorSearch).produced_data);
        assert!(!result.cautions.is_empty());
    }

    #[tokio::test]
    async fn filtered_out_direct_rows_yield_hybrid_with_caution() {
        // Name matches but the requested size does not exist: the direct
        // rows become partial data merged into the vector answer.
        let store = FakeStore {
            components: vec![component("gate valve", Some("8-IN"), "12+05", 1)],
            scored: vec![scored("valve schedule excerpt", 0.75)],
            ..Default::default()
        };
        let router = router(store, FakeVision::default());

        let result = router
            .route(
                "how many 12 inch gate valves",
                Uuid::new_v4(),
                &RouteOptions::default(),
            )
            .await;

        assert_eq!(result.method, Some(RetrievalMethod::Hybrid));
        assert!(result.context.contains("8-IN"));
        assert!(result
            .cautions
            .iter()
            .any(|c| c.contains("similarity-matched")));
    }

    #[tokio::test]
    async fn crossing_query_skips_vector_and_uses_visual() {
        let findings = VisualFindings {
            narrative: "Two existing utilities cross the alignment.".to_string(),
            components: vec![],
            crossings: vec![UtilityCrossing {
                crossing_utility_code: "EX-G".to_string(),
                full_name: "Existing Gas Main".to_string(),
                station: Some("14+20".to_string()),
                elevation: None,
                is_existing: true,
                is_proposed: false,
                size: Some("4-IN".to_string()),
                confidence: 0.7,
            }],
            usage: TokenUsage::default(),
        };
        let store = FakeStore {
            sheets: vec![sheet()],
            scored: vec![scored("unrelated", 0.95)],
            ..Default::default()
        };
        let router = router(
            store,
            FakeVision {
                findings: Some(findings),
            },
        );

        let result = router
            .route(
                "what utilities cross water line A",
                Uuid::new_v4(),
                &RouteOptions::default(),
            )
            .await;

        assert_eq!(result.method, Some(RetrievalMethod::VisualAnalysis));
        assert!(!attempt(&result, RouteStep::VectorSearch).attempted);
        assert!(attempt(&result, RouteStep::VisualAnalysis).produced_data);
        assert!(result.context.contains("Existing Gas Main"));
    }

    #[tokio::test]
    async fn stored_crossings_answer_before_visual() {
        let store = FakeStore {
            crossings: vec![UtilityCrossing {
                crossing_utility_code: "EX-SS".to_string(),
                full_name: "Existing Sanitary Sewer".to_string(),
                station: Some("8+10".to_string()),
                elevation: Some(812.4),
                is_existing: true,
                is_proposed: false,
                size: None,
                confidence: 0.85,
            }],
            sheets: vec![sheet()],
            ..Default::default()
        };
        let router = router(store, FakeVision::default());

        let result = router
            .route("any crossings on this line?", Uuid::new_v4(), &RouteOptions::default())
            .await;

        assert_eq!(result.method, Some(RetrievalMethod::DirectOnly));
        assert!(!attempt(&result, RouteStep::VisualAnalysis).attempted);
        assert!(result.context.contains("Existing Sanitary Sewer"));
    }

    #[tokio::test]
    async fn aggregation_length_uses_termination_points() {
        let begin = TerminationPoint {
            utility_name: "Water Line A".to_string(),
            kind: TerminationKind::Begin,
            station: "0+00".to_string(),
            station_numeric: parse_station("0+00").unwrap(),
            sheet_number: None,
            confidence: 0.9,
        };
        let end = TerminationPoint {
            utility_name: "Water Line A".to_string(),
            kind: TerminationKind::End,
            station: "32+62.01".to_string(),
            station_numeric: parse_station("32+62.01").unwrap(),
            sheet_number: None,
            confidence: 0.85,
        };
        let store = FakeStore {
            termination_points: vec![begin, end],
            ..Default::default()
        };
        let router = router(store, FakeVision::default());

        let result = router
            .route(
                "what is the total length of water line A",
                Uuid::new_v4(),
                &RouteOptions::default(),
            )
            .await;

        assert_eq!(result.method, Some(RetrievalMethod::DirectOnly));
        assert!(result.context.contains("3262.01"));
        assert!((result.confidence - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn all_steps_exhausted_returns_not_found() {
        let store = FakeStore {
            fail_components: true,
            ..Default::default()
        };
        let router = router(store, FakeVision::default());

        let result = router
            .route("how many gate valves", Uuid::new_v4(), &RouteOptions::default())
            .await;

        assert_eq!(result.status, RouteStatus::NotFound);
        assert!(result.method.is_none());
        assert!(result.context.is_empty());
        assert_eq!(result.sources.len(), 5);
    }

    #[tokio::test]
    async fn summary_query_served_from_summary_store() {
        let store = FakeStore {
            summary: Some(ProjectSummary {
                project_id: Uuid::new_v4(),
                sheet_count: 42,
                crossing_count: 3,
                systems: vec![SystemTotals {
                    system_name: "Water Line A".to_string(),
                    component_count: 18,
                    total_length_lf: Some(3262.01),
                }],
                last_extraction_at: None,
            }),
            ..Default::default()
        };
        let router = router(store, FakeVision::default());

        let result = router
            .route("give me a project summary", Uuid::new_v4(), &RouteOptions::default())
            .await;

        assert_eq!(result.method, Some(RetrievalMethod::DirectOnly));
        assert!(attempt(&result, RouteStep::SummaryLookup).produced_data);
        assert!(result.context.contains("Water Line A"));
    }

    #[tokio::test]
    async fn min_confidence_filters_vector_hits() {
        let store = FakeStore {
            scored: vec![scored("weak match", 0.2)],
            ..Default::default()
        };
        let router = router(store, FakeVision::default());

        let options = RouteOptions {
            min_confidence: 0.5,
            ..Default::default()
        };
        let result = router
            .route("anything about pavement?", Uuid::new_v4(), &options)
            .await;

        assert_eq!(result.status, RouteStatus::NotFound);
        assert!(attempt(&result, RouteStep::VectorSearch).attempted);
        assert!(!attempt(&result, RouteStep::VectorSearch).produced_data);
    }
}
