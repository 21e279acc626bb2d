//! Error types for data parsing in meterlink-types.

use thiserror::Error;

/// Errors that can occur when interpreting decoded meter data.
///
/// This error type is transport-agnostic and does not include
/// session or I/O errors (those belong in meterlink-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Not enough bytes for the encoding being parsed.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Number of bytes required.
        expected: usize,
        /// Number of bytes available.
        actual: usize,
    },

    /// A mandatory date-time field carried the "not specified" sentinel.
    #[error("Date-time field '{0}' is not specified")]
    UnspecifiedField(&'static str),

    /// A value was structurally valid but out of range or otherwise unusable.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// An OBIS code string could not be parsed.
    #[error("Invalid OBIS code '{0}'")]
    InvalidObis(String),
}

/// Result type alias using meterlink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParseError::InsufficientBytes {
            expected: 12,
            actual: 5,
        };
        assert_eq!(err.to_string(), "Insufficient bytes: expected 12, got 5");

        let err = ParseError::UnspecifiedField("year");
        assert!(err.to_string().contains("year"));

        let err = ParseError::InvalidObis("1.2.3".to_string());
        assert!(err.to_string().contains("1.2.3"));
    }
}
