//! Module for SRS Diagnostic trouble code data
//!
//! The SRS ECU reports a fault as two raw bytes, which are presented as a
//! code string such as `"53-89"`. Descriptions are resolved against a [DtcTable] of
//! mask patterns, where an `'x'` in a pattern matches any character at that position.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Description returned when no entry in the table matches a code
pub const UNKNOWN_DTC_DESCRIPTION: &str = "Unknown";

/// Wildcard character of a mask pattern
pub const MASK_WILDCARD: char = 'x';

/// Formats the two raw DTC bytes of the ECU as a code string, EG: `"53-89"`
pub fn format_dtc_code(high: u8, low: u8) -> String {
    format!("{high:02X}-{low:02X}")
}

/// Returns true if `candidate` matches the mask `pattern`.
///
/// Both are compared position by position. An `'x'` in the pattern matches any
/// character, every other character must match exactly. The pattern must cover
/// the candidate exactly: a pattern that is longer or shorter than the candidate
/// never matches.
pub fn mask_matches(pattern: &str, candidate: &str) -> bool {
    let mut pattern_chars = pattern.chars();
    for c in candidate.chars() {
        match pattern_chars.next() {
            Some(MASK_WILDCARD) => {}
            Some(p) if p == c => {}
            _ => return false,
        }
    }
    // Candidate exhausted, pattern must be too
    pattern_chars.next().is_none()
}

/// A single entry of the fault code table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DtcMask {
    /// Code pattern, which may contain `'x'` wildcards
    pub pattern: String,
    /// Human readable description of the fault
    pub description: String,
}

/// Ordered table of fault code descriptions.
///
/// Lookup is a linear scan and the first matching entry wins, so the order
/// of entries is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtcTable {
    entries: Vec<DtcMask>,
}

impl DtcTable {
    /// Creates an empty table. Every lookup will resolve to [UNKNOWN_DTC_DESCRIPTION]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table from an ordered list of entries
    pub fn from_entries(entries: Vec<DtcMask>) -> Self {
        Self { entries }
    }

    /// Loads a table from a JSON array of `{"pattern": .., "description": ..}` objects
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            entries: serde_json::from_str(json)?,
        })
    }

    /// Appends an entry to the end of the table
    pub fn push<P: Into<String>, D: Into<String>>(&mut self, pattern: P, description: D) {
        self.entries.push(DtcMask {
            pattern: pattern.into(),
            description: description.into(),
        })
    }

    /// Number of entries in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the first entry whose pattern matches the code
    pub fn lookup(&self, code: &str) -> Option<&DtcMask> {
        self.entries.iter().find(|e| mask_matches(&e.pattern, code))
    }

    /// Resolves a code string to its description
    pub fn resolve(&self, code: &str) -> &str {
        match self.lookup(code) {
            Some(entry) => &entry.description,
            None => {
                log::debug!("No description found for DTC {code}");
                UNKNOWN_DTC_DESCRIPTION
            }
        }
    }
}

/// Active fault code read from the SRS ECU
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SrsDtc {
    /// Code string, EG: `"53-89"`
    pub code: String,
    /// Raw bytes of the code as reported by the ECU
    pub raw: [u8; 2],
    /// Description resolved from the [DtcTable]
    pub description: String,
}

impl SrsDtc {
    /// Builds a DTC from the two raw bytes, resolving its description in `table`
    pub fn new(high: u8, low: u8, table: &DtcTable) -> Self {
        let code = format_dtc_code(high, low);
        let description = table.resolve(&code).to_string();
        Self {
            code,
            raw: [high, low],
            description,
        }
    }
}

impl std::fmt::Display for SrsDtc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.code, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_code_as_hex_pair() {
        assert_eq!(format_dtc_code(0x53, 0x89), "53-89");
        assert_eq!(format_dtc_code(0x01, 0x0A), "01-0A");
    }

    #[test]
    fn wildcard_matches_any_char() {
        assert!(mask_matches("5x89", "5389"));
        assert!(!mask_matches("5x89", "5390"));
        assert!(mask_matches("xx-xx", "53-89"));
    }

    #[test]
    fn length_must_agree() {
        assert!(!mask_matches("5389-", "5389"));
        assert!(!mask_matches("538", "5389"));
        assert!(mask_matches("", ""));
    }

    #[test]
    fn first_match_wins() {
        let mut table = DtcTable::new();
        table.push("53-8x", "Specific");
        table.push("53-xx", "Generic");
        assert_eq!(table.resolve("53-89"), "Specific");
        assert_eq!(table.resolve("53-90"), "Generic");
        assert_eq!(table.resolve("54-00"), UNKNOWN_DTC_DESCRIPTION);
    }

    #[test]
    fn dtc_resolves_description() {
        let table = DtcTable::from_entries(vec![DtcMask {
            pattern: "53-89".into(),
            description: "Passenger side airbag".into(),
        }]);
        let dtc = SrsDtc::new(0x53, 0x89, &table);
        assert_eq!(dtc.code, "53-89");
        assert_eq!(dtc.raw, [0x53, 0x89]);
        assert_eq!(dtc.to_string(), "53-89 - Passenger side airbag");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn loads_table_from_json() {
        let table = DtcTable::from_json_str(
            r#"[{"pattern": "1x-01", "description": "Driver"}, {"pattern": "xx-xx", "description": "Other"}]"#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("12-01"), "Driver");
        assert_eq!(table.resolve("22-01"), "Other");
    }
}
