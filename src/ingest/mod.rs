//! Bulk extraction ingestion.
//!
//! Processes drawing sheets into structured records through the vision
//! service. Sheets run in small fixed-size batches with a pause between
//! batches so the number of simultaneous vision calls stays inside the
//! service's rate limits; calls within a batch run in parallel. One
//! sheet's failure never aborts its batch or the run; it is logged and
//! the sheet is skipped.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::components::{ExtractedComponent, TerminationPoint, UtilityCrossing};
use crate::domain::reconcile::{merge_decision, MergeDecision};
use crate::domain::station::parse_station;
use crate::retrieval::sources::{
    ExtractionProfile, ExtractionSink, SheetPage, SourceError, SourceResult, VisionSource,
};

/// Batch shape for vision calls.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            batch_delay: Duration::from_millis(2000),
        }
    }
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub sheets_processed: usize,
    pub sheets_failed: usize,
    pub components_inserted: usize,
    pub components_merged: usize,
    pub components_rejected: usize,
    pub termination_points_inserted: usize,
    pub crossings_inserted: usize,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Default)]
struct SheetTally {
    inserted: usize,
    merged: usize,
    rejected: usize,
    termination_points: usize,
    crossings: usize,
    input_tokens: i64,
    output_tokens: i64,
    cost_usd: f64,
}

pub struct IngestPipeline {
    vision: Arc<dyn VisionSource>,
    sink: Arc<dyn ExtractionSink>,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(
        vision: Arc<dyn VisionSource>,
        sink: Arc<dyn ExtractionSink>,
        config: IngestConfig,
    ) -> Self {
        Self {
            vision,
            sink,
            config,
        }
    }

    /// Process sheets in batches; parallel within a batch, sequential with
    /// a pause between batches.
    #[instrument(skip(self, sheets), fields(sheet_count = sheets.len()))]
    pub async fn process_sheets(&self, project_id: Uuid, sheets: &[SheetPage]) -> IngestReport {
        let mut report = IngestReport::default();
        let batch_size = self.config.batch_size.max(1);
        let batch_count = sheets.len().div_ceil(batch_size);

        for (batch_index, batch) in sheets.chunks(batch_size).enumerate() {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|sheet| self.process_one(project_id, sheet)),
            )
            .await;

            for (sheet, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    Ok(tally) => {
                        report.sheets_processed += 1;
                        report.components_inserted += tally.inserted;
                        report.components_merged += tally.merged;
                        report.components_rejected += tally.rejected;
                        report.termination_points_inserted += tally.termination_points;
                        report.crossings_inserted += tally.crossings;
                        report.input_tokens += tally.input_tokens;
                        report.output_tokens += tally.output_tokens;
                        report.cost_usd += tally.cost_usd;
                    }
                    Err(e) => {
                        warn!(
                            sheet_id = %sheet.sheet_id,
                            sheet_number = ?sheet.sheet_number,
                            error = %e,
                            "sheet extraction failed; skipping"
                        );
                        report.sheets_failed += 1;
                    }
                }
            }

            if batch_index + 1 < batch_count {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        info!(
            sheets_processed = report.sheets_processed,
            sheets_failed = report.sheets_failed,
            components_inserted = report.components_inserted,
            "ingestion run complete"
        );
        report
    }

    async fn process_one(
        &self,
        project_id: Uuid,
        sheet: &SheetPage,
    ) -> SourceResult<SheetTally> {
        let extraction = self.extract_with_retry(sheet).await?;

        let mut tally = SheetTally {
            input_tokens: extraction.usage.input_tokens,
            output_tokens: extraction.usage.output_tokens,
            cost_usd: extraction.usage.cost_usd,
            ..Default::default()
        };

        for component in &extraction.components {
            if !component_is_plausible(component) {
                tally.rejected += 1;
                continue;
            }
            self.merge_component(project_id, component, &mut tally).await?;
        }

        let points: Vec<TerminationPoint> = extraction
            .termination_points
            .iter()
            .filter(|p| termination_is_plausible(p))
            .cloned()
            .collect();
        if !points.is_empty() {
            tally.termination_points = self
                .sink
                .insert_termination_points(project_id, &points)
                .await?;
        }

        let crossings: Vec<UtilityCrossing> = extraction
            .crossings
            .iter()
            .filter(|c| crossing_is_plausible(c))
            .cloned()
            .collect();
        if !crossings.is_empty() {
            tally.crossings = self.sink.insert_crossings(project_id, &crossings).await?;
        }

        Ok(tally)
    }

    async fn extract_with_retry(
        &self,
        sheet: &SheetPage,
    ) -> SourceResult<crate::retrieval::sources::SheetExtraction> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        backoff::future::retry(policy, || async {
            self.vision
                .extract_sheet(sheet, ExtractionProfile::ComponentExtraction)
                .await
                .map_err(|e| match e {
                    SourceError::Unavailable(_) | SourceError::Timeout => {
                        backoff::Error::transient(e)
                    }
                    other => backoff::Error::permanent(other),
                })
        })
        .await
    }

    /// Best-effort duplicate check immediately before insert. Not a
    /// transactional guarantee: concurrent ingestion of the same document
    /// can still produce a duplicate, which query-time reconciliation
    /// masks.
    async fn merge_component(
        &self,
        project_id: Uuid,
        component: &ExtractedComponent,
        tally: &mut SheetTally,
    ) -> SourceResult<()> {
        let stored = self
            .sink
            .components_named(project_id, &component.name)
            .await?;
        let stored_components: Vec<ExtractedComponent> =
            stored.iter().map(|s| s.component.clone()).collect();

        match merge_decision(&stored_components, component) {
            (MergeDecision::Insert, _) => {
                self.sink.insert_component(project_id, component).await?;
                tally.inserted += 1;
            }
            (MergeDecision::KeepExisting, _) => {
                tally.merged += 1;
            }
            (MergeDecision::ReplaceExisting, Some(idx)) => {
                self.sink
                    .replace_component(stored[idx].id, component)
                    .await?;
                tally.merged += 1;
            }
            (MergeDecision::ReplaceExisting, None) => {
                // merge_decision always pairs a replace with an index.
                self.sink.insert_component(project_id, component).await?;
                tally.inserted += 1;
            }
        }
        Ok(())
    }
}

/// Structural/range validation of a vision-extracted component: plausible
/// quantity, and a parseable station when one is present.
fn component_is_plausible(component: &ExtractedComponent) -> bool {
    if component.name.trim().is_empty() || component.quantity < 1 {
        return false;
    }
    if !(0.0..=1.0).contains(&component.confidence) {
        return false;
    }
    match &component.station {
        Some(station) => parse_station(station).is_some(),
        None => true,
    }
}

fn termination_is_plausible(point: &TerminationPoint) -> bool {
    !point.utility_name.trim().is_empty() && parse_station(&point.station).is_some()
}

fn crossing_is_plausible(crossing: &UtilityCrossing) -> bool {
    if crossing.full_name.trim().is_empty() {
        return false;
    }
    match &crossing.station {
        Some(station) => parse_station(station).is_some(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::components::SourceContext;
    use crate::retrieval::sources::{SheetExtraction, StoredComponent, TokenUsage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedVision {
        /// Sheet numbers that fail extraction permanently.
        failing: Vec<String>,
        calls: AtomicUsize,
        extraction: SheetExtraction,
    }

    #[async_trait]
    impl VisionSource for ScriptedVision {
        async fn extract_sheet(
            &self,
            page: &SheetPage,
            _profile: ExtractionProfile,
        ) -> SourceResult<SheetExtraction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let number = page.sheet_number.clone().unwrap_or_default();
            if self.failing.contains(&number) {
                return Err(SourceError::InvalidResponse("bad JSON".to_string()));
            }
            Ok(self.extraction.clone())
        }

        async fn inspect(
            &self,
            _task: &crate::retrieval::sources::VisualTask,
        ) -> SourceResult<crate::retrieval::sources::VisualFindings> {
            Err(SourceError::Unavailable("not under test".to_string()))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        rows: Mutex<Vec<StoredComponent>>,
        termination_points: Mutex<Vec<TerminationPoint>>,
        crossings: Mutex<Vec<UtilityCrossing>>,
    }

    #[async_trait]
    impl ExtractionSink for MemorySink {
        async fn components_named(
            &self,
            _project_id: Uuid,
            name: &str,
        ) -> SourceResult<Vec<StoredComponent>> {
            let rows = self.rows.lock().unwrap();
            Ok(rows
                .iter()
                .filter(|s| s.component.name.eq_ignore_ascii_case(name))
                .cloned()
                .collect())
        }

        async fn insert_component(
            &self,
            _project_id: Uuid,
            component: &ExtractedComponent,
        ) -> SourceResult<Uuid> {
            let id = Uuid::new_v4();
            self.rows.lock().unwrap().push(StoredComponent {
                id,
                component: component.clone(),
            });
            Ok(id)
        }

        async fn replace_component(
            &self,
            id: Uuid,
            component: &ExtractedComponent,
        ) -> SourceResult<()> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|s| s.id == id) {
                row.component = component.clone();
            }
            Ok(())
        }

        async fn insert_termination_points(
            &self,
            _project_id: Uuid,
            points: &[TerminationPoint],
        ) -> SourceResult<usize> {
            self.termination_points
                .lock()
                .unwrap()
                .extend_from_slice(points);
            Ok(points.len())
        }

        async fn insert_crossings(
            &self,
            _project_id: Uuid,
            crossings: &[UtilityCrossing],
        ) -> SourceResult<usize> {
            self.crossings.lock().unwrap().extend_from_slice(crossings);
            Ok(crossings.len())
        }
    }

    fn sheet(number: &str) -> SheetPage {
        SheetPage {
            sheet_id: Uuid::new_v4(),
            sheet_number: Some(number.to_string()),
            page_number: 1,
            image_url: format!("https://sheets.example/{}.png", number),
        }
    }

    fn component(name: &str, station: Option<&str>, confidence: f64) -> ExtractedComponent {
        ExtractedComponent {
            name: name.to_string(),
            size: Some("12-IN".to_string()),
            quantity: 1,
            station: station.map(String::from),
            sheet_number: None,
            source_context: SourceContext::Callout,
            confidence,
        }
    }

    fn extraction(components: Vec<ExtractedComponent>) -> SheetExtraction {
        SheetExtraction {
            sheet_kind: Some("plan_profile".to_string()),
            components,
            termination_points: vec![],
            crossings: vec![],
            usage: TokenUsage {
                input_tokens: 1000,
                output_tokens: 200,
                cost_usd: 0.01,
            },
        }
    }

    fn pipeline(vision: ScriptedVision, sink: Arc<MemorySink>) -> IngestPipeline {
        let config = IngestConfig {
            batch_size: 2,
            batch_delay: Duration::from_millis(0),
        };
        IngestPipeline::new(Arc::new(vision), sink, config)
    }

    #[tokio::test]
    async fn failed_sheet_is_skipped_not_fatal() {
        let vision = ScriptedVision {
            failing: vec!["C-2".to_string()],
            calls: AtomicUsize::new(0),
            extraction: extraction(vec![component("gate valve", Some("1+00"), 0.9)]),
        };
        let sink = Arc::new(MemorySink::default());
        let pipeline = pipeline(vision, Arc::clone(&sink));

        let sheets = vec![sheet("C-1"), sheet("C-2"), sheet("C-3")];
        let report = pipeline
            .process_sheets(Uuid::new_v4(), &sheets)
            .await;

        assert_eq!(report.sheets_processed, 2);
        assert_eq!(report.sheets_failed, 1);
        assert!(report.components_inserted >= 1);
    }

    #[tokio::test]
    async fn duplicate_extraction_merges_instead_of_inserting() {
        // The same callout read from two sheets: nearby station, same name
        // and size. The second read must not create a second row.
        let vision = ScriptedVision {
            failing: vec![],
            calls: AtomicUsize::new(0),
            extraction: extraction(vec![component("gate valve", Some("12+05"), 0.8)]),
        };
        let sink = Arc::new(MemorySink::default());
        let pipeline = pipeline(vision, Arc::clone(&sink));

        let project_id = Uuid::new_v4();
        pipeline.process_sheets(project_id, &[sheet("C-1")]).await;
        let report = pipeline.process_sheets(project_id, &[sheet("C-4")]).await;

        assert_eq!(report.components_inserted, 0);
        assert_eq!(report.components_merged, 1);
        assert_eq!(sink.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn higher_confidence_rereading_replaces_stored_row() {
        let sink = Arc::new(MemorySink::default());
        let project_id = Uuid::new_v4();

        let first = ScriptedVision {
            failing: vec![],
            calls: AtomicUsize::new(0),
            extraction: extraction(vec![component("gate valve", Some("12+05"), 0.6)]),
        };
        pipeline(first, Arc::clone(&sink))
            .process_sheets(project_id, &[sheet("C-1")])
            .await;

        let second = ScriptedVision {
            failing: vec![],
            calls: AtomicUsize::new(0),
            extraction: extraction(vec![component("gate valve", Some("12+05"), 0.95)]),
        };
        let report = pipeline(second, Arc::clone(&sink))
            .process_sheets(project_id, &[sheet("C-1")])
            .await;

        assert_eq!(report.components_merged, 1);
        let rows = sink.rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].component.confidence, 0.95);
    }

    #[tokio::test]
    async fn implausible_records_are_rejected() {
        let vision = ScriptedVision {
            failing: vec![],
            calls: AtomicUsize::new(0),
            extraction: extraction(vec![
                component("gate valve", Some("2+16-27 RT"), 0.9),
                component("", Some("1+00"), 0.9),
                component("fire hydrant", Some("1+00"), 0.9),
            ]),
        };
        let sink = Arc::new(MemorySink::default());
        let pipeline = pipeline(vision, Arc::clone(&sink));

        let report = pipeline
            .process_sheets(Uuid::new_v4(), &[sheet("C-1")])
            .await;

        assert_eq!(report.components_rejected, 2);
        assert_eq!(report.components_inserted, 1);
    }
}
