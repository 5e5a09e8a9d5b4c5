//! Length derivation and resolution.
//!
//! A utility run's length comes from one of three places, in strict
//! preference order: a BEGIN+END termination-point pair, a structurally
//! stored aggregate (quantity-table record), or an index-sheet record.
//! Index-sourced lengths get a fixed confidence penalty and an explicit
//! caution; a missing endpoint is surfaced as a warning, never silently
//! dropped.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::domain::components::{
    normalize_name, LengthResult, TerminationKind, TerminationPoint,
};

/// Fixed multiplier applied to lengths that only exist on an index sheet.
pub const INDEX_SHEET_CONFIDENCE_PENALTY: f64 = 0.7;

/// Derived lengths plus partial-data warnings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LengthDerivation {
    pub lengths: Vec<LengthResult>,
    pub warnings: Vec<String>,
}

/// Pair up BEGIN/END termination points per normalized utility name.
///
/// A length is only reported when both endpoints exist for the same
/// utility; the higher-confidence marker wins when a kind repeats.
pub fn derive_lengths(points: &[TerminationPoint]) -> LengthDerivation {
    let mut by_utility: BTreeMap<String, Vec<&TerminationPoint>> = BTreeMap::new();
    for point in points {
        by_utility
            .entry(normalize_name(&point.utility_name))
            .or_default()
            .push(point);
    }

    let mut derivation = LengthDerivation::default();
    for (utility, markers) in by_utility {
        let begin = best_marker(&markers, TerminationKind::Begin);
        let end = best_marker(&markers, TerminationKind::End);

        match (begin, end) {
            (Some(begin), Some(end)) => derivation.lengths.push(LengthResult {
                utility_name: begin.utility_name.clone(),
                begin_station: begin.station.clone(),
                end_station: end.station.clone(),
                length_lf: end.station_numeric - begin.station_numeric,
                confidence: begin.confidence.min(end.confidence),
            }),
            (Some(_), None) => derivation.warnings.push(format!(
                "{}: BEGIN marker found but no END; length cannot be computed",
                utility
            )),
            (None, Some(_)) => derivation.warnings.push(format!(
                "{}: END marker found but no BEGIN; length cannot be computed",
                utility
            )),
            (None, None) => derivation.warnings.push(format!(
                "{}: only tie-in/terminus markers found; length cannot be computed",
                utility
            )),
        }
    }

    derivation
}

fn best_marker<'a>(
    markers: &[&'a TerminationPoint],
    kind: TerminationKind,
) -> Option<&'a TerminationPoint> {
    markers
        .iter()
        .filter(|m| m.kind == kind)
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .copied()
}

/// Where a length answer came from, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthSource {
    TerminationPoints,
    StoredAggregate,
    IndexSheet,
}

/// One possible answer for a run's length.
#[derive(Debug, Clone)]
pub struct LengthCandidate {
    pub source: LengthSource,
    pub length_lf: f64,
    pub confidence: f64,
}

/// The winning length with any applied penalty and caution.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedLength {
    pub length_lf: f64,
    pub confidence: f64,
    pub source: LengthSource,
    pub caution: Option<String>,
}

/// Pick the highest-priority candidate. Termination-derived lengths always
/// beat stored aggregates, which beat index-sheet values; an index-only
/// answer is penalized and flagged.
pub fn resolve_length(candidates: &[LengthCandidate]) -> Option<ResolvedLength> {
    let winner = candidates.iter().min_by_key(|c| c.source)?;

    let (confidence, caution) = match winner.source {
        LengthSource::IndexSheet => (
            winner.confidence * INDEX_SHEET_CONFIDENCE_PENALTY,
            Some(
                "length comes from an index sheet and may be incomplete".to_string(),
            ),
        ),
        _ => (winner.confidence, None),
    };

    Some(ResolvedLength {
        length_lf: winner.length_lf,
        confidence,
        source: winner.source,
        caution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::station::parse_station;

    fn marker(utility: &str, kind: TerminationKind, station: &str, confidence: f64) -> TerminationPoint {
        TerminationPoint {
            utility_name: utility.to_string(),
            kind,
            station: station.to_string(),
            station_numeric: parse_station(station).expect("test station parses"),
            sheet_number: None,
            confidence,
        }
    }

    #[test]
    fn begin_end_pair_yields_exact_length() {
        let points = vec![
            marker("Water Line A", TerminationKind::Begin, "0+00", 0.9),
            marker("Water Line A", TerminationKind::End, "32+62.01", 0.8),
        ];
        let derivation = derive_lengths(&points);
        assert!(derivation.warnings.is_empty());
        assert_eq!(derivation.lengths.len(), 1);
        let length = &derivation.lengths[0];
        assert!((length.length_lf - 3262.01).abs() < 1e-9);
        assert_eq!(length.confidence, 0.8);
    }

    #[test]
    fn missing_endpoint_becomes_warning() {
        let points = vec![marker("Water Line B", TerminationKind::Begin, "1+00", 0.9)];
        let derivation = derive_lengths(&points);
        assert!(derivation.lengths.is_empty());
        assert_eq!(derivation.warnings.len(), 1);
        assert!(derivation.warnings[0].contains("no END"));
    }

    #[test]
    fn utilities_pair_independently() {
        let points = vec![
            marker("Water Line A", TerminationKind::Begin, "0+00", 0.9),
            marker("Water Line A", TerminationKind::End, "10+00", 0.9),
            marker("Force Main B", TerminationKind::Begin, "2+00", 0.9),
        ];
        let derivation = derive_lengths(&points);
        assert_eq!(derivation.lengths.len(), 1);
        assert_eq!(derivation.warnings.len(), 1);
    }

    #[test]
    fn termination_points_beat_stored_aggregate() {
        let candidates = vec![
            LengthCandidate {
                source: LengthSource::StoredAggregate,
                length_lf: 3300.0,
                confidence: 0.9,
            },
            LengthCandidate {
                source: LengthSource::TerminationPoints,
                length_lf: 3262.01,
                confidence: 0.8,
            },
        ];
        let resolved = resolve_length(&candidates).expect("a candidate wins");
        assert_eq!(resolved.source, LengthSource::TerminationPoints);
        assert!((resolved.length_lf - 3262.01).abs() < 1e-9);
        assert!(resolved.caution.is_none());
    }

    #[test]
    fn index_only_answer_is_penalized_and_flagged() {
        let candidates = vec![LengthCandidate {
            source: LengthSource::IndexSheet,
            length_lf: 3200.0,
            confidence: 0.8,
        }];
        let resolved = resolve_length(&candidates).expect("a candidate wins");
        assert!((resolved.confidence - 0.8 * INDEX_SHEET_CONFIDENCE_PENALTY).abs() < 1e-9);
        assert!(resolved.caution.is_some());
    }

    #[test]
    fn no_candidates_resolves_to_none() {
        assert!(resolve_length(&[]).is_none());
    }
}
