pub mod types;

pub use types::{
    BoundedReport, EngineInfo, ErrorBody, ErrorKind, Finding, Impact, NodeEvidence,
    PhaseTimings, RawAnalysis, ReportTotals, RuleSummary,
};
