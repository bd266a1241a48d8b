//! Error types shared across the Magpie crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling messages and timelines.
#[derive(Error, Debug)]
pub enum Error {
    /// A wire document was structurally valid JSON but not a timeline.
    #[error("malformed timeline document: {0}")]
    MalformedTimeline(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_timeline_display() {
        let err = Error::MalformedTimeline("missing 'statuses' array".to_string());
        assert!(err.to_string().contains("statuses"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("JSON error"));
    }
}
