//! Phase-tagged pipeline errors

use shared_types::{ErrorBody, ErrorKind};
use thiserror::Error;

use crate::lifecycle::Phase;

/// Error produced by any pipeline phase
///
/// The kind is fixed by the phase that failed. Nothing upstream rewrites it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    /// Phase in which the error was raised (None for pre-admission checks)
    pub phase: Option<Phase>,
    /// Machine-readable cause, e.g. `TIMEOUT` or an HTTP status code
    pub details: Option<String>,
    pub suggestion: Option<String>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            phase: None,
            details: None,
            suggestion: Some(kind.default_suggestion().to_string()),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Tag the error with the phase it came from, keeping an existing tag
    pub fn in_phase(mut self, phase: Phase) -> Self {
        if self.phase.is_none() {
            self.phase = Some(phase);
        }
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::SandboxTimeout | ErrorKind::AnalysisTimeout | ErrorKind::PollExhausted
        ) || self.details.as_deref() == Some("TIMEOUT")
    }

    /// Convert into the wire error body
    pub fn to_body(&self, url: Option<&str>) -> ErrorBody {
        ErrorBody {
            success: false,
            message: self.message.clone(),
            error: self.kind,
            details: self.details.clone(),
            url: url.map(str::to_string),
            suggestion: self.suggestion.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_suggestion_attached() {
        let err = PipelineError::new(ErrorKind::TooComplex, "4000 elements");
        assert_eq!(
            err.suggestion.as_deref(),
            Some(ErrorKind::TooComplex.default_suggestion())
        );
        assert_eq!(err.to_string(), "TOO_COMPLEX: 4000 elements");
    }

    #[test]
    fn test_phase_tag_is_sticky() {
        let err = PipelineError::new(ErrorKind::NetworkError, "refused")
            .in_phase(Phase::Fetching)
            .in_phase(Phase::Analyzing);
        assert_eq!(err.phase, Some(Phase::Fetching));
    }

    #[test]
    fn test_timeout_detection() {
        let fetch_timeout =
            PipelineError::new(ErrorKind::NetworkError, "timed out").with_details("TIMEOUT");
        assert!(fetch_timeout.is_timeout());
        assert!(PipelineError::new(ErrorKind::AnalysisTimeout, "late").is_timeout());
        assert!(!PipelineError::new(ErrorKind::HttpError, "404").is_timeout());
    }

    #[test]
    fn test_to_body() {
        let body = PipelineError::new(ErrorKind::HttpError, "Server returned 404")
            .with_details("404")
            .to_body(Some("https://example.com/missing"));

        assert!(!body.success);
        assert_eq!(body.error, ErrorKind::HttpError);
        assert_eq!(body.details.as_deref(), Some("404"));
        assert_eq!(body.url.as_deref(), Some("https://example.com/missing"));
    }
}
