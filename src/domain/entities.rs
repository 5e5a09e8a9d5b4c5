//! Entity extraction from free-text questions.
//!
//! Pure, order-sensitive pattern lists (most specific first) that pull a
//! utility system name, component name, size filter, station, and sheet
//! reference out of a question. Every extractor returns `Option<String>`;
//! absence is always representable and nothing here can fail.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::station::parse_station;

// ============================================================================
// Component Categories
// ============================================================================

/// A recognizable component family: the canonical key used in filters and
/// the name pattern used to match both questions and extracted records.
pub struct ComponentCategory {
    pub key: &'static str,
    pub pattern: &'static str,
}

/// Known take-off component families, most specific first. The pattern for
/// a family must match every subtype name the vision service emits for it
/// ("gate valve", "butterfly valve", ... all belong to `valve`).
pub static COMPONENT_CATEGORIES: &[ComponentCategory] = &[
    ComponentCategory {
        key: "hydrant",
        pattern: r"(?i)\b(?:fire\s+)?hydrants?\b",
    },
    ComponentCategory {
        key: "valve",
        pattern: r"(?i)\b(?:gate|butterfly|check|plug|ball|air\s*release|blow[-\s]?off|tapping)?\s*valves?\b",
    },
    ComponentCategory {
        key: "fitting",
        pattern: r"(?i)\b(?:bends?|tees?|crosses|reducers?|couplings?|elbows?|caps?|plugs|fittings?)\b",
    },
    ComponentCategory {
        key: "manhole",
        pattern: r"(?i)\bmanholes?\b|\bMH\b",
    },
    ComponentCategory {
        key: "meter",
        pattern: r"(?i)\b(?:water\s+)?meters?\b",
    },
    ComponentCategory {
        key: "service",
        pattern: r"(?i)\bservice\s+(?:connections?|laterals?|lines?)\b",
    },
    ComponentCategory {
        key: "pipe",
        pattern: r"(?i)\b(?:pipes?|piping|mains?)\b",
    },
];

/// Resolve a category by its canonical key.
pub fn category_by_key(key: &str) -> Option<&'static ComponentCategory> {
    COMPONENT_CATEGORIES.iter().find(|c| c.key.eq_ignore_ascii_case(key))
}

/// First category whose pattern matches anywhere in `text`.
pub fn match_category(text: &str) -> Option<&'static ComponentCategory> {
    let regexes = category_regexes();
    COMPONENT_CATEGORIES
        .iter()
        .zip(regexes.iter())
        .find(|(_, re)| re.is_match(text))
        .map(|(cat, _)| cat)
}

fn category_regexes() -> &'static [Regex] {
    static COMPILED: Lazy<Vec<Regex>> = Lazy::new(|| {
        COMPONENT_CATEGORIES
            .iter()
            .map(|c| Regex::new(c.pattern).expect("category pattern is valid"))
            .collect()
    });
    &COMPILED
}

// ============================================================================
// Extractors
// ============================================================================

// The designation stays case-sensitive so "water line is" never captures
// "IS" as a system letter.
static LETTERED_SYSTEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"\b((?i:water\s*line|force\s*main|sewer\s*line|gas\s*line|reclaimed\s*water\s*line))\s+['"]?([A-Z0-9]{1,2})\b"#,
    )
    .expect("lettered system regex is valid")
});

static BARE_SYSTEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(sanitary\s+sewer|storm\s+drain|reclaimed\s+water|force\s+main|water\s*line|gas\s*line)\b",
    )
    .expect("bare system regex is valid")
});

/// Utility system name, e.g. "Water Line A" or "Force Main".
///
/// Lettered designations win over bare system mentions so that
/// "water line A" never collapses to just "Water Line".
pub fn extract_system_name(text: &str) -> Option<String> {
    if let Some(caps) = LETTERED_SYSTEM_RE.captures(text) {
        let base = title_case(&caps[1]);
        let designation = caps[2].to_uppercase();
        return Some(format!("{} {}", base, designation));
    }

    BARE_SYSTEM_RE.captures(text).map(|caps| title_case(&caps[1]))
}

/// Component/item name: the matched phrase for the first known category.
pub fn extract_item_name(text: &str) -> Option<String> {
    let regexes = category_regexes();
    for re in regexes {
        if let Some(m) = re.find(text) {
            let found = m.as_str().trim();
            if !found.is_empty() {
                return Some(found.to_lowercase());
            }
        }
    }
    None
}

static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(\d{1,3})\s*(?:-?\s*in(?:ch(?:es)?)?\.?\b|["”])"#)
        .expect("size regex is valid")
});

/// Numeric size filter, normalized to the canonical `N-IN` form:
/// `"12 inch"`, `"12-in"`, and `"12\""` all yield `"12-IN"`.
pub fn extract_size_filter(text: &str) -> Option<String> {
    SIZE_RE
        .captures(text)
        .map(|caps| format!("{}-IN", &caps[1]))
}

/// Canonical size for an extracted record's size field, keyed on the
/// leading integer. Returns `None` when no leading integer exists.
pub fn normalize_size(raw: &str) -> Option<String> {
    leading_size_inches(raw).map(|n| format!("{}-IN", n))
}

/// Leading integer of a size string; `"12-IN"`, `"12 inch"`, `"12"` all
/// yield 12. Size comparison is defined on this value only.
pub fn leading_size_inches(raw: &str) -> Option<i64> {
    let digits: String = raw.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

static STATION_IN_TEXT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:station|sta\.?)?\s*(\d{1,3}\+\d{2}(?:\.\d{1,2})?)")
        .expect("station-in-text regex is valid")
});

/// First valid station mentioned in the text.
pub fn extract_station(text: &str) -> Option<String> {
    for caps in STATION_IN_TEXT_RE.captures_iter(text) {
        let candidate = &caps[1];
        if parse_station(candidate).is_some() {
            return Some(candidate.to_string());
        }
    }
    None
}

static SHEET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bsheet\s+([A-Z]{0,3}-?\d{1,4}[A-Z]?)\b|\b([CPMEWS]-\d{1,3})\b")
        .expect("sheet regex is valid")
});

/// Sheet identifier, e.g. "C-12" or "sheet 14".
pub fn extract_sheet_number(text: &str) -> Option<String> {
    SHEET_RE.captures(text).and_then(|caps| {
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().to_uppercase())
    })
}

fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_lettered_system_names() {
        assert_eq!(
            extract_system_name("total length of water line A"),
            Some("Water Line A".to_string())
        );
        assert_eq!(
            extract_system_name("force main 'B' alignment"),
            Some("Force Main B".to_string())
        );
    }

    #[test]
    fn extracts_bare_system_names() {
        assert_eq!(
            extract_system_name("where does the sanitary sewer run"),
            Some("Sanitary Sewer".to_string())
        );
        assert_eq!(extract_system_name("how many valves"), None);
    }

    #[test]
    fn normalizes_sizes() {
        assert_eq!(extract_size_filter("12 inch gate valve"), Some("12-IN".to_string()));
        assert_eq!(extract_size_filter("12-in bend"), Some("12-IN".to_string()));
        assert_eq!(extract_size_filter("12\" pipe"), Some("12-IN".to_string()));
        assert_eq!(extract_size_filter("no size here"), None);
        assert_eq!(normalize_size("8-IN"), Some("8-IN".to_string()));
        assert_eq!(leading_size_inches("12-IN"), Some(12));
        assert_eq!(leading_size_inches("DIP"), None);
    }

    #[test]
    fn extracts_stations_from_text() {
        assert_eq!(
            extract_station("what is installed at station 24+93.06"),
            Some("24+93.06".to_string())
        );
        assert_eq!(extract_station("nothing to see"), None);
    }

    #[test]
    fn extracts_sheet_numbers() {
        assert_eq!(extract_sheet_number("see sheet C-12"), Some("C-12".to_string()));
        assert_eq!(extract_sheet_number("on sheet 14"), Some("14".to_string()));
        assert_eq!(extract_sheet_number("what is on C-4"), Some("C-4".to_string()));
        assert_eq!(extract_sheet_number("no reference"), None);
    }

    #[test]
    fn matches_component_categories() {
        assert_eq!(match_category("how many gate valves").map(|c| c.key), Some("valve"));
        assert_eq!(match_category("fire hydrant assembly").map(|c| c.key), Some("hydrant"));
        assert_eq!(match_category("45 degree bends").map(|c| c.key), Some("fitting"));
        assert!(match_category("pavement section").is_none());
    }

    #[test]
    fn item_name_prefers_most_specific_category() {
        // "fire hydrant" must not be swallowed by the valve family.
        assert_eq!(
            extract_item_name("12 inch fire hydrant count"),
            Some("fire hydrant".to_string())
        );
    }
}
