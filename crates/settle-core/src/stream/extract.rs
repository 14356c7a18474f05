//! Detection of submitted operations in tool output.

use std::sync::LazyLock;

use regex::Regex;
use settle_types::OperationId;

/// Phrase the wallet tools print when an operation has been submitted.
pub const OPERATION_MARKER: &str = "User Operation Hash";

static OPERATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"User Operation Hash: (0x[a-fA-F0-9]+)").expect("valid operation hash pattern")
});

/// Result of scanning tool text for a submitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// No marker phrase: ordinary tool output.
    Unmarked,
    /// Marker phrase present but no identifier follows it.
    MarkedWithoutId,
    /// Marker followed by an operation identifier.
    Operation(OperationId),
}

/// Scans tool text for the submitted-operation marker and its identifier.
pub fn extract(text: &str) -> Extraction {
    if !text.contains(OPERATION_MARKER) {
        return Extraction::Unmarked;
    }

    match OPERATION_PATTERN.captures(text).and_then(|caps| caps.get(1)) {
        Some(id) => Extraction::Operation(OperationId::new(id.as_str())),
        None => Extraction::MarkedWithoutId,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_operation_id() {
        assert_eq!(
            extract("User Operation Hash: 0xabc123"),
            Extraction::Operation(OperationId::new("0xabc123"))
        );
    }

    #[test]
    fn test_extracts_from_multiline_text() {
        let text = "Transaction submitted! User Operation Hash: 0xDEADbeef01\n\nThis operation will be bundled.";
        assert_eq!(
            extract(text),
            Extraction::Operation(OperationId::new("0xDEADbeef01"))
        );
    }

    #[test]
    fn test_identifier_stops_at_first_non_hex() {
        assert_eq!(
            extract("User Operation Hash: 0x12ab.Done"),
            Extraction::Operation(OperationId::new("0x12ab"))
        );
    }

    #[test]
    fn test_marker_without_identifier() {
        assert_eq!(
            extract("User Operation Hash: pending"),
            Extraction::MarkedWithoutId
        );
        assert_eq!(
            extract("User Operation Hash:\n0xabc"),
            Extraction::MarkedWithoutId
        );
    }

    #[test]
    fn test_unmarked_text() {
        assert_eq!(extract("Balance: 12 USDC"), Extraction::Unmarked);
        assert_eq!(extract(""), Extraction::Unmarked);
    }
}
