use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure categories surfaced to callers.
///
/// The wire form is SCREAMING_SNAKE_CASE (`"TOO_COMPLEX"`), matching the
/// `error` field of [`ErrorBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidUrl,
    InvalidProtocol,
    MemoryExhausted,
    NetworkError,
    HttpError,
    OversizedResponse,
    InvalidContent,
    SandboxTimeout,
    TooComplex,
    AnalysisTimeout,
    PollExhausted,
    EngineError,
    ResultProcessingError,
    ServerError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidUrl => "INVALID_URL",
            ErrorKind::InvalidProtocol => "INVALID_PROTOCOL",
            ErrorKind::MemoryExhausted => "MEMORY_EXHAUSTED",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::HttpError => "HTTP_ERROR",
            ErrorKind::OversizedResponse => "OVERSIZED_RESPONSE",
            ErrorKind::InvalidContent => "INVALID_CONTENT",
            ErrorKind::SandboxTimeout => "SANDBOX_TIMEOUT",
            ErrorKind::TooComplex => "TOO_COMPLEX",
            ErrorKind::AnalysisTimeout => "ANALYSIS_TIMEOUT",
            ErrorKind::PollExhausted => "POLL_EXHAUSTED",
            ErrorKind::EngineError => "ENGINE_ERROR",
            ErrorKind::ResultProcessingError => "RESULT_PROCESSING_ERROR",
            ErrorKind::ServerError => "SERVER_ERROR",
        }
    }

    /// Human-readable hint shown alongside the error
    pub fn default_suggestion(&self) -> &'static str {
        match self {
            ErrorKind::InvalidUrl => "Check the URL for typos and include the scheme",
            ErrorKind::InvalidProtocol => "Only http:// and https:// URLs can be analyzed",
            ErrorKind::MemoryExhausted => "The service is under heavy load, try again shortly",
            ErrorKind::NetworkError => "Make sure the site is reachable and responding",
            ErrorKind::HttpError => "The site returned an error page, check the URL",
            ErrorKind::OversizedResponse => "The page is too large, try a simpler page",
            ErrorKind::InvalidContent => "The URL must point to an HTML page",
            ErrorKind::SandboxTimeout => "The page took too long to load, try a simpler page",
            ErrorKind::TooComplex => "The page has too many elements, try a simpler page",
            ErrorKind::AnalysisTimeout => "Analysis took too long, try a simpler page",
            ErrorKind::PollExhausted => "The analysis engine stalled, try again",
            ErrorKind::EngineError => "The analysis engine failed on this page",
            ErrorKind::ResultProcessingError => "The results could not be processed, try again",
            ErrorKind::ServerError => "An unexpected error occurred, try again",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error returned in place of a report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    pub error: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Severity reported by the rule engine for a finding or a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Minor,
    Moderate,
    Serious,
    Critical,
}

/// One offending element in the analyzed document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvidence {
    /// Outer markup snippet of the element
    #[serde(default)]
    pub html: String,
    /// CSS selector path to the element
    #[serde(default)]
    pub target: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<Impact>,
}

/// A rule that failed (violation) or could not be decided (incomplete)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Rule identifier, e.g. `image-alt`
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<Impact>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub help_url: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub nodes: Vec<NodeEvidence>,
}

/// A passing rule, reduced to its identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSummary {
    pub id: String,
    #[serde(default)]
    pub node_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
}

/// Unbounded result as produced by the rule engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAnalysis {
    #[serde(default)]
    pub violations: Vec<Finding>,
    #[serde(default)]
    pub incomplete: Vec<Finding>,
    #[serde(default)]
    pub passes: Vec<RuleSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineInfo>,
    /// Engine-internal run time in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_ms: Option<u64>,
}

/// Counts before capping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTotals {
    pub violations: usize,
    pub incomplete: usize,
}

/// Wall-clock spend per pipeline phase, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTimings {
    pub fetch_ms: u64,
    pub sanitize_ms: u64,
    pub sandbox_ms: u64,
    pub analysis_ms: u64,
    pub shaping_ms: u64,
    pub total_ms: u64,
}

/// The size- and count-capped result returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundedReport {
    pub success: bool,
    pub url: String,
    pub final_url: String,
    pub violations: Vec<Finding>,
    pub incomplete: Vec<Finding>,
    pub pass_count: usize,
    pub totals: ReportTotals,
    pub elapsed_ms: u64,
    pub timings: PhaseTimings,
    pub results_truncated: bool,
    pub html_truncated: bool,
    pub complex_site: bool,
    pub element_count: usize,
    pub html_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineInfo>,
    pub analyzed_at: String,
}
