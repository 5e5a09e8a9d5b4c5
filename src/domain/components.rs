//! Extraction domain types
//!
//! Value objects produced by the vision extraction service and consumed by
//! the reconciliation engine and retrieval router: take-off components,
//! termination points, utility crossings, and derived lengths. All are
//! created per request; none are mutated in place, reconciliation only
//! builds new aggregates.

use serde::{Deserialize, Serialize};

use crate::domain::entities::normalize_size;
use crate::domain::station::normalize_station;

// ============================================================================
// Extracted Components
// ============================================================================

/// Where on a drawing a record was read from. Determines how much an
/// extracted value can be trusted: callouts and quantity tables are
/// authoritative, index sheets are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceContext {
    Callout,
    QuantityTable,
    PlanNote,
    ProfileView,
    IndexSheet,
}

impl std::fmt::Display for SourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceContext::Callout => write!(f, "callout"),
            SourceContext::QuantityTable => write!(f, "quantity_table"),
            SourceContext::PlanNote => write!(f, "plan_note"),
            SourceContext::ProfileView => write!(f, "profile_view"),
            SourceContext::IndexSheet => write!(f, "index_sheet"),
        }
    }
}

/// A single physical item found on a drawing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedComponent {
    pub name: String,
    pub size: Option<String>,
    pub quantity: i64,
    pub station: Option<String>,
    pub sheet_number: Option<String>,
    pub source_context: SourceContext,
    pub confidence: f64,
}

/// Deduplication identity: normalized name, size, and station. Two records
/// with the same key describe the same physical item read twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    pub name: String,
    pub size: Option<String>,
    pub station: Option<String>,
}

impl ExtractedComponent {
    pub fn identity_key(&self) -> ComponentKey {
        ComponentKey {
            name: normalize_name(&self.name),
            size: self.size.as_deref().and_then(normalize_size),
            station: self.station.as_deref().and_then(normalize_station),
        }
    }
}

/// Uppercased, whitespace-collapsed name used in identity keys and
/// utility-name grouping.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

// ============================================================================
// Termination Points & Lengths
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationKind {
    Begin,
    End,
    TieIn,
    Terminus,
}

/// A labeled BEGIN/END marker on a drawing, used to compute a run's length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationPoint {
    pub utility_name: String,
    pub kind: TerminationKind,
    pub station: String,
    pub station_numeric: f64,
    pub sheet_number: Option<String>,
    pub confidence: f64,
}

/// Length derived from a BEGIN+END pair for one utility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LengthResult {
    pub utility_name: String,
    pub begin_station: String,
    pub end_station: String,
    pub length_lf: f64,
    pub confidence: f64,
}

// ============================================================================
// Utility Crossings
// ============================================================================

/// A different utility intersecting the alignment under analysis. Distinct
/// from [`ExtractedComponent`]: a crossing is never a component of the
/// alignment itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilityCrossing {
    pub crossing_utility_code: String,
    pub full_name: String,
    pub station: Option<String>,
    pub elevation: Option<f64>,
    pub is_existing: bool,
    pub is_proposed: bool,
    pub size: Option<String>,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, size: Option<&str>, station: Option<&str>) -> ExtractedComponent {
        ExtractedComponent {
            name: name.to_string(),
            size: size.map(String::from),
            quantity: 1,
            station: station.map(String::from),
            sheet_number: None,
            source_context: SourceContext::Callout,
            confidence: 0.9,
        }
    }

    #[test]
    fn identity_key_ignores_formatting_variance() {
        let a = component("Gate  Valve", Some("12-IN"), Some("012+05"));
        let b = component("gate valve", Some("12 inch"), Some("12+05.00"));
        assert_eq!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn identity_key_distinguishes_sizes() {
        let a = component("gate valve", Some("12-IN"), Some("12+05"));
        let b = component("gate valve", Some("8-IN"), Some("12+05"));
        assert_ne!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn invalid_station_normalizes_to_none() {
        let a = component("gate valve", None, Some("2+16-27 RT"));
        assert_eq!(a.identity_key().station, None);
    }
}
