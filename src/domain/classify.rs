//! Query classification.
//!
//! Turns a free-text question into a [`QueryClassification`]: a query type,
//! an intent, extracted entities, and the strategy flags the retrieval
//! router acts on. Classification is an ordered table of pattern families,
//! first match wins, so the priority order is an explicit, testable list
//! rather than implicit code structure. Confidence is a fixed per-family
//! constant rather than a function of match strength.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::entities::{
    extract_item_name, extract_sheet_number, extract_size_filter, extract_station,
    extract_system_name,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Quantitative,
    ProjectSummary,
    UtilityCrossing,
    Location,
    Specification,
    Detail,
    Reference,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Quantitative,
    Informational,
    Locational,
}

/// Classification of one question. Created fresh per query, immutable,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryClassification {
    pub query_type: QueryType,
    pub intent: QueryIntent,
    pub confidence: f64,
    pub item_name: Option<String>,
    pub system_name: Option<String>,
    pub station: Option<String>,
    pub sheet_number: Option<String>,
    pub size_filter: Option<String>,
    pub needs_direct_lookup: bool,
    pub needs_complete_data: bool,
    pub needs_vector_search: bool,
    pub needs_visual_analysis: bool,
    pub is_aggregation: bool,
}

/// One pattern family: the patterns that select it and the fixed
/// classification it produces.
struct FamilySpec {
    query_type: QueryType,
    intent: QueryIntent,
    confidence: f64,
    patterns: &'static [&'static str],
    needs_direct_lookup: bool,
    needs_complete_data: bool,
    needs_vector_search: bool,
    needs_visual_analysis: bool,
    is_aggregation: bool,
}

/// Priority-ordered family table. Earlier entries win ties:
/// aggregation-flagged quantitative > project summary > utility crossing >
/// location > specification > detail > reference. A general/informational
/// fallback applies when nothing matches.
static FAMILIES: &[FamilySpec] = &[
    // Aggregation: sum/total questions across a system or category.
    FamilySpec {
        query_type: QueryType::Quantitative,
        intent: QueryIntent::Quantitative,
        confidence: 0.9,
        patterns: &[
            r"(?i)\btotal\b",
            r"(?i)\bsum\s+of\b",
            r"(?i)\bcombined\b",
            r"(?i)\boverall\s+(?:length|quantity|count|footage)\b",
            r"(?i)\baltogether\b",
        ],
        needs_direct_lookup: true,
        needs_complete_data: true,
        needs_vector_search: true,
        needs_visual_analysis: false,
        is_aggregation: true,
    },
    // Count questions about a component category.
    FamilySpec {
        query_type: QueryType::Quantitative,
        intent: QueryIntent::Quantitative,
        confidence: 0.85,
        patterns: &[
            r"(?i)\bhow\s+many\b",
            r"(?i)\bhow\s+much\b",
            r"(?i)\bcount\s+of\b",
            r"(?i)\bnumber\s+of\b",
            r"(?i)\bquantit(?:y|ies)\b",
            r"(?i)\btake-?off\b",
        ],
        needs_direct_lookup: true,
        needs_complete_data: true,
        needs_vector_search: true,
        needs_visual_analysis: false,
        is_aggregation: false,
    },
    // Whole-project summary.
    FamilySpec {
        query_type: QueryType::ProjectSummary,
        intent: QueryIntent::Informational,
        confidence: 0.8,
        patterns: &[
            r"(?i)\bproject\s+(?:summary|overview)\b",
            r"(?i)\bsummar(?:y|ize)\b.*\bproject\b",
            r"(?i)\boverview\s+of\s+(?:this|the)\s+project\b",
            r"(?i)\bwhat(?:'s|\s+is)\s+(?:in|on)\s+(?:this|the)\s+project\b",
            r"(?i)\bscope\s+of\s+work\b",
        ],
        needs_direct_lookup: true,
        needs_complete_data: false,
        needs_vector_search: true,
        needs_visual_analysis: false,
        is_aggregation: false,
    },
    // Utility crossings. Crossing labels are not reliably indexed as text,
    // so vector search is disabled and visual analysis is mandatory.
    FamilySpec {
        query_type: QueryType::UtilityCrossing,
        intent: QueryIntent::Informational,
        confidence: 0.85,
        patterns: &[
            r"(?i)\bcross(?:es|ing|ings)?\b",
            r"(?i)\bconflicts?\b",
            r"(?i)\bintersect(?:s|ions?)?\b",
        ],
        needs_direct_lookup: true,
        needs_complete_data: false,
        needs_vector_search: false,
        needs_visual_analysis: true,
        is_aggregation: false,
    },
    // Location questions.
    FamilySpec {
        query_type: QueryType::Location,
        intent: QueryIntent::Locational,
        confidence: 0.75,
        patterns: &[
            r"(?i)\bwhere\b",
            r"(?i)\bat\s+what\s+station\b",
            r"(?i)\bwhat\s+station\b",
            r"(?i)\blocat(?:ed|ion)\b",
        ],
        needs_direct_lookup: true,
        needs_complete_data: false,
        needs_vector_search: true,
        needs_visual_analysis: false,
        is_aggregation: false,
    },
    // Specification/material questions.
    FamilySpec {
        query_type: QueryType::Specification,
        intent: QueryIntent::Informational,
        confidence: 0.7,
        patterns: &[
            r"(?i)\bspec(?:ification)?s?\b",
            r"(?i)\bmaterial\s+requirements?\b",
            r"(?i)\bbedding\b",
            r"(?i)\bpressure\s+class\b",
            r"(?i)\bthickness\b",
            r"(?i)\bcover\s+depth\b",
        ],
        needs_direct_lookup: false,
        needs_complete_data: false,
        needs_vector_search: true,
        needs_visual_analysis: false,
        is_aggregation: false,
    },
    // Construction details.
    FamilySpec {
        query_type: QueryType::Detail,
        intent: QueryIntent::Informational,
        confidence: 0.65,
        patterns: &[
            r"(?i)\bdetails?\b",
            r"(?i)\btypical\s+section\b",
            r"(?i)\bsection\s+view\b",
            r"(?i)\bcallouts?\b",
        ],
        needs_direct_lookup: false,
        needs_complete_data: false,
        needs_vector_search: true,
        needs_visual_analysis: false,
        is_aggregation: false,
    },
    // Sheet/index references.
    FamilySpec {
        query_type: QueryType::Reference,
        intent: QueryIntent::Informational,
        confidence: 0.6,
        patterns: &[
            r"(?i)\bwhich\s+sheets?\b",
            r"(?i)\bsheet\s+index\b",
            r"(?i)\blegend\b",
            r"(?i)\babbreviations?\b",
            r"(?i)\bsheet\s+[A-Z]{0,3}-?\d",
        ],
        needs_direct_lookup: false,
        needs_complete_data: false,
        needs_vector_search: true,
        needs_visual_analysis: false,
        is_aggregation: false,
    },
];

static COMPILED_FAMILIES: Lazy<Vec<Vec<Regex>>> = Lazy::new(|| {
    FAMILIES
        .iter()
        .map(|family| {
            family
                .patterns
                .iter()
                .map(|p| Regex::new(p).expect("family pattern is valid"))
                .collect()
        })
        .collect()
});

/// Classify a question. Deterministic and side-effect-free; a query that
/// matches no family resolves to the general/informational fallback; that
/// is a normal outcome, never an error.
pub fn classify(query: &str) -> QueryClassification {
    let item_name = extract_item_name(query);
    let system_name = extract_system_name(query);
    let station = extract_station(query);
    let sheet_number = extract_sheet_number(query);
    let size_filter = extract_size_filter(query);

    for (family, regexes) in FAMILIES.iter().zip(COMPILED_FAMILIES.iter()) {
        if regexes.iter().any(|re| re.is_match(query)) {
            return QueryClassification {
                query_type: family.query_type,
                intent: family.intent,
                confidence: family.confidence,
                item_name,
                system_name,
                station,
                sheet_number,
                size_filter,
                needs_direct_lookup: family.needs_direct_lookup,
                needs_complete_data: family.needs_complete_data,
                needs_vector_search: family.needs_vector_search,
                needs_visual_analysis: family.needs_visual_analysis,
                is_aggregation: family.is_aggregation,
            };
        }
    }

    // No family matched: general/informational fallback with no entities.
    // A normal outcome, never an error.
    QueryClassification {
        query_type: QueryType::General,
        intent: QueryIntent::Informational,
        confidence: 0.5,
        item_name: None,
        system_name: None,
        station: None,
        sheet_number: None,
        size_filter: None,
        needs_direct_lookup: false,
        needs_complete_data: false,
        needs_vector_search: true,
        needs_visual_analysis: false,
        is_aggregation: false,
    }
}
