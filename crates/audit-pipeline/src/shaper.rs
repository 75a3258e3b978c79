//! Bounds the engine's raw output into the report returned to callers
//!
//! Shaping caps the number of findings and the per-finding evidence, and
//! truncates evidence strings. Shaping an already shaped report changes
//! nothing.

use shared_types::{
    BoundedReport, EngineInfo, ErrorKind, Finding, NodeEvidence, PhaseTimings, RawAnalysis,
    ReportTotals,
};
use tracing::debug;

use crate::config::ReportLimits;
use crate::error::PipelineError;

const ELLIPSIS: &str = "...";

/// Request facts the report carries alongside the findings
#[derive(Debug, Clone, Default)]
pub struct ShapeContext {
    pub url: String,
    pub final_url: String,
    pub html_truncated: bool,
    pub complex_site: bool,
    pub element_count: usize,
    pub html_bytes: usize,
    pub timings: PhaseTimings,
    pub analyzed_at: String,
}

#[derive(Debug, Clone)]
pub struct ResultShaper {
    limits: ReportLimits,
}

impl ResultShaper {
    pub fn new(limits: ReportLimits) -> Self {
        Self { limits }
    }

    /// Parse the engine's serialized result
    pub fn parse(&self, json: &str) -> Result<RawAnalysis, PipelineError> {
        serde_json::from_str(json).map_err(|e| {
            PipelineError::new(
                ErrorKind::ResultProcessingError,
                format!("Failed to parse analysis results: {}", e),
            )
        })
    }

    pub fn shape(&self, raw: RawAnalysis, ctx: ShapeContext) -> BoundedReport {
        let totals = ReportTotals {
            violations: raw.violations.len(),
            incomplete: raw.incomplete.len(),
        };
        let mut truncated = false;
        let violations =
            self.bound_findings(raw.violations, self.limits.max_violations, &mut truncated);
        let incomplete =
            self.bound_findings(raw.incomplete, self.limits.max_incomplete, &mut truncated);

        if truncated {
            debug!(
                "Report truncated: {}/{} violations, {}/{} incomplete kept",
                violations.len(),
                totals.violations,
                incomplete.len(),
                totals.incomplete
            );
        }

        BoundedReport {
            success: true,
            url: ctx.url,
            final_url: ctx.final_url,
            violations,
            incomplete,
            pass_count: raw.passes.len(),
            totals,
            elapsed_ms: ctx.timings.total_ms,
            timings: ctx.timings,
            results_truncated: truncated,
            html_truncated: ctx.html_truncated,
            complex_site: ctx.complex_site,
            element_count: ctx.element_count,
            html_bytes: ctx.html_bytes,
            engine: raw.engine.map(|e| self.bound_engine(e)),
            analyzed_at: ctx.analyzed_at,
        }
    }

    /// Re-apply the caps to an existing report
    pub fn reshape(&self, mut report: BoundedReport) -> BoundedReport {
        let mut truncated = report.results_truncated;
        report.violations =
            self.bound_findings(report.violations, self.limits.max_violations, &mut truncated);
        report.incomplete =
            self.bound_findings(report.incomplete, self.limits.max_incomplete, &mut truncated);
        report.results_truncated = truncated;
        report
    }

    fn bound_findings(
        &self,
        mut findings: Vec<Finding>,
        cap: usize,
        truncated: &mut bool,
    ) -> Vec<Finding> {
        if findings.len() > cap {
            findings.truncate(cap);
            *truncated = true;
        }
        findings
            .into_iter()
            .map(|f| self.bound_finding(f, truncated))
            .collect()
    }

    fn bound_finding(&self, mut finding: Finding, truncated: &mut bool) -> Finding {
        if finding.nodes.len() > self.limits.max_nodes_per_finding {
            finding.nodes.truncate(self.limits.max_nodes_per_finding);
            *truncated = true;
        }
        finding.description = truncate_chars(&finding.description, self.limits.max_summary_chars);
        finding.help = truncate_chars(&finding.help, self.limits.max_summary_chars);
        finding.nodes = finding
            .nodes
            .into_iter()
            .map(|node| self.bound_node(node, truncated))
            .collect();
        finding
    }

    fn bound_node(&self, mut node: NodeEvidence, truncated: &mut bool) -> NodeEvidence {
        if node.target.len() > self.limits.max_targets_per_node {
            node.target.truncate(self.limits.max_targets_per_node);
            *truncated = true;
        }
        NodeEvidence {
            html: truncate_chars(&node.html, self.limits.max_html_chars),
            target: node
                .target
                .iter()
                .map(|t| truncate_chars(t, self.limits.max_target_chars))
                .collect(),
            failure_summary: node
                .failure_summary
                .map(|s| truncate_chars(&s, self.limits.max_summary_chars)),
            ..node
        }
    }

    fn bound_engine(&self, engine: EngineInfo) -> EngineInfo {
        EngineInfo {
            name: truncate_chars(&engine.name, 64),
            version: truncate_chars(&engine.version, 64),
        }
    }
}

/// Cut `s` to at most `max` characters, ending in an ellipsis when cut
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut out: String = s.chars().take(keep).collect();
    if max >= ELLIPSIS.len() {
        out.push_str(ELLIPSIS);
    }
    out
}
