//! Station parsing and normalization.
//!
//! Stations are linear-distance markers along a utility alignment, written
//! `major+minor` in feet ("12+34.56" is 1234.56 LF from the origin). OCR
//! text from drawings is full of station-shaped strings that are not usable
//! as component locations (offset callouts, road stationing for a different
//! alignment, match-line labels), so parsing is deliberately strict:
//! anything carrying a disqualifying marker is rejected outright rather
//! than partially parsed.

use once_cell::sync::Lazy;
use regex::Regex;

/// Default tolerance when matching drawing-derived stations against stored
/// ones, in feet.
pub const DEFAULT_STATION_TOLERANCE_FT: f64 = 1.0;

static STATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:STA\.?\s*)?(\d{1,3})\+(\d{2}(?:\.\d{1,2})?)$")
        .expect("station regex is valid")
});

/// Markers that disqualify a candidate string: left/right offsets,
/// offset shorthand, deflection notes, road references, match lines.
static REJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \b(?:RT|LT)\b
      | [OQ]/S
      | \bDEFL\w*
      | \bROAD\b | \bRD\b | \bHWY\b | \bAVENUE\b | \bBLVD\b
      | MATCH\s*LINE | MATCHLINE
        ",
    )
    .expect("station reject regex is valid")
});

/// Parse a station string to its numeric form in feet.
///
/// Accepts `\d{1,3}+\d{2}(.\d{1,2})?`, optionally prefixed with `STA`.
/// Returns `None` for malformed values and for strings carrying offset,
/// road-reference, or match-line markers.
pub fn parse_station(raw: &str) -> Option<f64> {
    let upper = raw.trim().to_uppercase();
    if upper.is_empty() || REJECT_RE.is_match(&upper) {
        return None;
    }

    let caps = STATION_RE.captures(&upper)?;
    let major: f64 = caps[1].parse().ok()?;
    let minor: f64 = caps[2].parse().ok()?;
    Some(major * 100.0 + minor)
}

/// Canonical `major+minor.ff` form used in deduplication keys.
///
/// Tolerant of leading zeros, whitespace, and an optional `STA` prefix:
/// `"STA 012+05"`, `" 12+05.00"`, and `"12+05"` all normalize to
/// `"12+05.00"`.
pub fn normalize_station(raw: &str) -> Option<String> {
    parse_station(raw).map(format_station)
}

/// Render a numeric station back to canonical text.
pub fn format_station(value: f64) -> String {
    let major = (value / 100.0).floor() as i64;
    let minor = value - (major as f64) * 100.0;
    format!("{}+{:05.2}", major, minor)
}

/// Whether two station strings refer to the same physical location within
/// `tolerance_ft`. Unparseable stations never match anything.
pub fn stations_approximately_equal(a: &str, b: &str, tolerance_ft: f64) -> bool {
    match (parse_station(a), parse_station(b)) {
        (Some(a), Some(b)) => (a - b).abs() <= tolerance_ft,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_station() {
        assert_eq!(parse_station("24+93.06"), Some(2493.06));
        assert_eq!(parse_station("0+00"), Some(0.0));
        assert_eq!(parse_station("132+05.5"), Some(13205.5));
    }

    #[test]
    fn tolerates_prefix_and_whitespace() {
        assert_eq!(parse_station("  STA 40+45.77 "), Some(4045.77));
        assert_eq!(parse_station("sta. 12+34"), Some(1234.0));
        assert_eq!(parse_station("012+05"), Some(1205.0));
    }

    #[test]
    fn rejects_offset_markers() {
        assert_eq!(parse_station("2+16-27 RT"), None);
        assert_eq!(parse_station("14+20 LT"), None);
        assert_eq!(parse_station("3+50 O/S"), None);
    }

    #[test]
    fn rejects_road_references_and_match_lines() {
        assert_eq!(parse_station("ROAD 'A' B STA 40+45.77"), None);
        assert_eq!(parse_station("MATCH LINE - STA 4+38.83"), None);
        assert_eq!(parse_station("MATCHLINE STA 4+38"), None);
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(parse_station(""), None);
        assert_eq!(parse_station("12+3"), None);
        assert_eq!(parse_station("12-34"), None);
        assert_eq!(parse_station("1234.56"), None);
        assert_eq!(parse_station("12+34.567"), None);
    }

    #[test]
    fn normalizes_variants_to_one_key() {
        assert_eq!(normalize_station("012+05"), Some("12+05.00".to_string()));
        assert_eq!(normalize_station(" 12+05.00"), Some("12+05.00".to_string()));
        assert_eq!(normalize_station("STA 12+05"), Some("12+05.00".to_string()));
        assert_eq!(normalize_station("24+93.06"), Some("24+93.06".to_string()));
        assert_eq!(normalize_station("0+00"), Some("0+00.00".to_string()));
    }

    #[test]
    fn approximate_equality_uses_tolerance() {
        assert!(stations_approximately_equal("12+34", "12+34.50", 1.0));
        assert!(!stations_approximately_equal("12+34", "12+36", 1.0));
        assert!(stations_approximately_equal("12+34", "12+36", 2.5));
        assert!(!stations_approximately_equal("12+34", "garbage", 100.0));
    }
}
