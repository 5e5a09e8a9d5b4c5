//! Quantity reconciliation engine.
//!
//! Merges structured records extracted from drawings into answerable
//! quantities: validity-filters stations, applies category and size
//! predicates, deduplicates on the identity key, and aggregates per size
//! with a component-level audit trail. Also hosts the cross-source
//! duplicate check used when freshly extracted records are merged against
//! already-stored ones.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::components::{normalize_name, ComponentKey, ExtractedComponent};
use crate::domain::entities::{category_by_key, leading_size_inches, match_category};
use crate::domain::station::{
    parse_station, stations_approximately_equal, DEFAULT_STATION_TOLERANCE_FT,
};

/// Filters applied during reconciliation. `category` accepts either a
/// canonical category key ("valve") or free text that maps to one; `size`
/// accepts any size spelling and compares on the leading integer only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuantityFilters {
    pub category: Option<String>,
    pub size: Option<String>,
    #[serde(default)]
    pub min_confidence: f64,
}

/// Per-size aggregate: summed quantity and a confidence-weighted average.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeBucket {
    pub quantity: i64,
    pub line_items: usize,
    pub avg_confidence: f64,
}

/// Reconciliation output: totals, per-size breakdown, and the surviving
/// records in deterministic order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciledQuantities {
    pub total_count: i64,
    pub by_size: BTreeMap<String, SizeBucket>,
    pub items: Vec<ExtractedComponent>,
    /// Records dropped by the station validity filter. Suspicious stations
    /// are excluded and logged, never silently counted.
    pub excluded: usize,
}

/// Largest number of line items for which an aggregation answer carries a
/// per-size breakdown; beyond this only the summary line is emitted.
pub const AGGREGATION_BREAKDOWN_LIMIT: usize = 10;

/// Aggregation-variant output (`sum`/`total` intents): quantities summed
/// directly, breakdown bounded to keep the response size in check.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationResult {
    pub total_quantity: i64,
    pub line_items: usize,
    pub breakdown: Option<BTreeMap<String, i64>>,
    pub avg_confidence: f64,
}

/// Reconcile raw extracted records into counts.
///
/// Pipeline order: station validity filter, category/size predicate,
/// identity-key deduplication (higher confidence wins), per-size
/// aggregation.
pub fn reconcile(
    records: &[ExtractedComponent],
    filters: &QuantityFilters,
) -> ReconciledQuantities {
    let mut excluded = 0usize;
    let mut survivors: Vec<&ExtractedComponent> = Vec::with_capacity(records.len());

    for record in records {
        if let Some(station) = &record.station {
            if parse_station(station).is_none() {
                tracing::debug!(
                    name = %record.name,
                    station = %station,
                    "excluding record with unparseable station"
                );
                excluded += 1;
                continue;
            }
        }
        if record.confidence < filters.min_confidence {
            continue;
        }
        if !matches_category_filter(record, filters.category.as_deref()) {
            continue;
        }
        if !matches_size_filter(record, filters.size.as_deref()) {
            continue;
        }
        survivors.push(record);
    }

    let mut deduped: HashMap<ComponentKey, ExtractedComponent> = HashMap::new();
    for record in survivors {
        let key = record.identity_key();
        match deduped.get(&key) {
            Some(existing) if existing.confidence >= record.confidence => {}
            _ => {
                deduped.insert(key, record.clone());
            }
        }
    }

    let mut items: Vec<ExtractedComponent> = deduped.into_values().collect();
    items.sort_by(|a, b| {
        (&a.name, &a.size, &a.station)
            .cmp(&(&b.name, &b.size, &b.station))
    });

    let mut by_size: BTreeMap<String, SizeBucket> = BTreeMap::new();
    let mut total_count = 0i64;
    for item in &items {
        total_count += item.quantity;
        let size_key = item
            .size
            .as_deref()
            .and_then(leading_size_inches)
            .map(|n| format!("{}-IN", n))
            .unwrap_or_else(|| "unsized".to_string());

        let bucket = by_size.entry(size_key).or_insert(SizeBucket {
            quantity: 0,
            line_items: 0,
            avg_confidence: 0.0,
        });
        // Running confidence-weighted average over summed quantity.
        let prior_weight = bucket.quantity as f64;
        let new_weight = prior_weight + item.quantity as f64;
        bucket.avg_confidence =
            (bucket.avg_confidence * prior_weight + item.confidence * item.quantity as f64)
                / new_weight;
        bucket.quantity += item.quantity;
        bucket.line_items += 1;
    }

    ReconciledQuantities {
        total_count,
        by_size,
        items,
        excluded,
    }
}

/// Aggregation-variant reconciliation for `sum`/`total` intents.
pub fn reconcile_sum(
    records: &[ExtractedComponent],
    filters: &QuantityFilters,
) -> AggregationResult {
    let reconciled = reconcile(records, filters);
    let line_items = reconciled.items.len();
    let avg_confidence = if reconciled.total_count > 0 {
        reconciled
            .by_size
            .values()
            .map(|b| b.avg_confidence * b.quantity as f64)
            .sum::<f64>()
            / reconciled.total_count as f64
    } else {
        0.0
    };

    let breakdown = if line_items <= AGGREGATION_BREAKDOWN_LIMIT {
        Some(
            reconciled
                .by_size
                .iter()
                .map(|(size, bucket)| (size.clone(), bucket.quantity))
                .collect(),
        )
    } else {
        None
    };

    AggregationResult {
        total_quantity: reconciled.total_count,
        line_items,
        breakdown,
        avg_confidence,
    }
}

fn matches_category_filter(record: &ExtractedComponent, category: Option<&str>) -> bool {
    let Some(requested) = category else {
        return true;
    };

    // Resolve the request to a known family, by key first, then by text.
    let family = category_by_key(requested).or_else(|| match_category(requested));
    match family {
        Some(family) => {
            match_category(&record.name).map(|c| c.key) == Some(family.key)
        }
        // Unknown category: fall back to case-insensitive containment.
        None => normalize_name(&record.name).contains(&normalize_name(requested)),
    }
}

/// Exact match on the leading integer only; a record with no size never
/// matches a size-filtered query.
fn matches_size_filter(record: &ExtractedComponent, size: Option<&str>) -> bool {
    let Some(requested) = size else {
        return true;
    };
    let Some(requested_inches) = leading_size_inches(requested) else {
        return false;
    };
    match record.size.as_deref().and_then(leading_size_inches) {
        Some(actual) => actual == requested_inches,
        None => false,
    }
}

// ============================================================================
// Cross-source deduplication
// ============================================================================

/// Outcome of checking a freshly extracted record against stored ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// No stored twin; insert the new record.
    Insert,
    /// A stored twin exists with equal or higher confidence; keep it.
    KeepExisting,
    /// A stored twin exists with lower confidence; replace it.
    ReplaceExisting,
}

/// Best-effort duplicate check used before insert during ingestion. Two
/// records are twins when their normalized names and leading sizes agree
/// and their stations fall within the matching tolerance (or are both
/// absent). This is a read-then-insert check, not a transactional
/// guarantee; query-time deduplication masks the race window.
pub fn merge_decision(
    stored: &[ExtractedComponent],
    incoming: &ExtractedComponent,
) -> (MergeDecision, Option<usize>) {
    let incoming_key = incoming.identity_key();

    for (idx, candidate) in stored.iter().enumerate() {
        let key = candidate.identity_key();
        if key.name != incoming_key.name || key.size != incoming_key.size {
            continue;
        }
        let stations_match = match (&candidate.station, &incoming.station) {
            (Some(a), Some(b)) => {
                stations_approximately_equal(a, b, DEFAULT_STATION_TOLERANCE_FT)
            }
            (None, None) => true,
            _ => false,
        };
        if !stations_match {
            continue;
        }
        return if candidate.confidence >= incoming.confidence {
            (MergeDecision::KeepExisting, Some(idx))
        } else {
            (MergeDecision::ReplaceExisting, Some(idx))
        };
    }

    (MergeDecision::Insert, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::components::SourceContext;

    fn component(
        name: &str,
        size: Option<&str>,
        station: Option<&str>,
        quantity: i64,
        confidence: f64,
    ) -> ExtractedComponent {
        ExtractedComponent {
            name: name.to_string(),
            size: size.map(String::from),
            quantity,
            station: station.map(String::from),
            sheet_number: None,
            source_context: SourceContext::Callout,
            confidence,
        }
    }

    #[test]
    fn duplicate_key_keeps_higher_confidence() {
        let records = vec![
            component("gate valve", Some("12-IN"), Some("12+05"), 1, 0.7),
            component("Gate Valve", Some("12 inch"), Some("012+05"), 1, 0.95),
        ];
        let result = reconcile(&records, &QuantityFilters::default());
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].confidence, 0.95);
        assert_eq!(result.total_count, 1);
    }

    #[test]
    fn size_filter_is_exact_on_leading_integer() {
        let records = vec![
            component("gate valve", Some("12-IN"), Some("1+00"), 1, 0.9),
            component("gate valve", Some("8-IN"), Some("2+00"), 1, 0.9),
            component("gate valve", None, Some("3+00"), 1, 0.9),
        ];
        let filters = QuantityFilters {
            size: Some("12-IN".to_string()),
            ..Default::default()
        };
        let result = reconcile(&records, &filters);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].size.as_deref(), Some("12-IN"));
    }

    #[test]
    fn suspicious_station_excluded_not_counted() {
        let records = vec![
            component("gate valve", Some("12-IN"), Some("2+16-27 RT"), 4, 0.9),
            component("gate valve", Some("12-IN"), Some("1+00"), 1, 0.9),
        ];
        let result = reconcile(&records, &QuantityFilters::default());
        assert_eq!(result.excluded, 1);
        assert_eq!(result.total_count, 1);
    }

    #[test]
    fn category_filter_matches_subtypes() {
        let records = vec![
            component("butterfly valve", Some("8-IN"), Some("1+00"), 2, 0.9),
            component("fire hydrant", None, Some("2+00"), 1, 0.9),
        ];
        let filters = QuantityFilters {
            category: Some("valve".to_string()),
            ..Default::default()
        };
        let result = reconcile(&records, &filters);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].name, "butterfly valve");
        assert_eq!(result.total_count, 2);
    }

    #[test]
    fn confidence_floor_applies() {
        let records = vec![
            component("gate valve", None, Some("1+00"), 1, 0.4),
            component("gate valve", None, Some("2+00"), 1, 0.9),
        ];
        let filters = QuantityFilters {
            min_confidence: 0.5,
            ..Default::default()
        };
        let result = reconcile(&records, &filters);
        assert_eq!(result.total_count, 1);
    }

    #[test]
    fn quantities_sum_per_size() {
        let records = vec![
            component("gate valve", Some("12-IN"), Some("1+00"), 2, 0.9),
            component("gate valve", Some("12-IN"), Some("5+00"), 3, 0.8),
            component("gate valve", Some("8-IN"), Some("9+00"), 1, 0.7),
        ];
        let result = reconcile(&records, &QuantityFilters::default());
        assert_eq!(result.total_count, 6);
        assert_eq!(result.by_size["12-IN"].quantity, 5);
        assert_eq!(result.by_size["8-IN"].quantity, 1);
        let avg = result.by_size["12-IN"].avg_confidence;
        assert!((avg - (0.9 * 2.0 + 0.8 * 3.0) / 5.0).abs() < 1e-9);
    }

    #[test]
    fn aggregation_breakdown_bounded() {
        let few: Vec<_> = (0..3)
            .map(|i| component("pipe", Some("12-IN"), Some(&format!("{}+00", i)), 100, 0.9))
            .collect();
        let summary = reconcile_sum(&few, &QuantityFilters::default());
        assert_eq!(summary.total_quantity, 300);
        assert!(summary.breakdown.is_some());

        let many: Vec<_> = (0..AGGREGATION_BREAKDOWN_LIMIT as i64 + 5)
            .map(|i| {
                component(
                    "pipe",
                    Some(&format!("{}-IN", i + 1)),
                    Some(&format!("{}+00", i)),
                    10,
                    0.9,
                )
            })
            .collect();
        let summary = reconcile_sum(&many, &QuantityFilters::default());
        assert!(summary.breakdown.is_none());
        assert_eq!(summary.line_items, AGGREGATION_BREAKDOWN_LIMIT + 5);
    }

    #[test]
    fn merge_decision_prefers_higher_confidence() {
        let stored = vec![component("gate valve", Some("12-IN"), Some("12+05"), 1, 0.8)];

        let weaker = component("gate valve", Some("12-IN"), Some("12+05.40"), 1, 0.6);
        assert_eq!(merge_decision(&stored, &weaker).0, MergeDecision::KeepExisting);

        let stronger = component("gate valve", Some("12-IN"), Some("12+05.40"), 1, 0.95);
        assert_eq!(
            merge_decision(&stored, &stronger).0,
            MergeDecision::ReplaceExisting
        );

        let different = component("gate valve", Some("12-IN"), Some("40+00"), 1, 0.9);
        assert_eq!(merge_decision(&stored, &different).0, MergeDecision::Insert);
    }
}
