//! Pipeline configuration
//!
//! All ceilings and deadlines the pipeline enforces come from here. The
//! configuration is TOML; every section and field is optional and falls
//! back to the production defaults.
//!
//! ```toml
//! total_budget_ms = 55000
//!
//! [fetch]
//! timeout_ms = 15000
//! max_content_length = 5242880
//! max_redirects = 5
//!
//! [sanitize]
//! max_html_bytes = 1048576
//!
//! [sandbox]
//! construction_timeout_ms = 10000
//! max_elements = 3000
//! complex_site_threshold = 1500
//!
//! [sandbox.capabilities]
//! timers = "disabled"
//!
//! [analysis]
//! timeout_ms = 30000
//! poll_interval_ms = 100
//! max_poll_attempts = 250
//!
//! [report]
//! max_violations = 30
//! max_incomplete = 20
//!
//! [memory]
//! elevated_bytes = 314572800
//! critical_bytes = 471859200
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::sandbox::CapabilityTable;

const MIB: u64 = 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Wall-clock budget for fetch + sandbox build + analysis
    pub total_budget_ms: u64,
    pub fetch: FetchConfig,
    pub sanitize: SanitizeConfig,
    pub sandbox: SandboxConfig,
    pub analysis: AnalysisConfig,
    pub report: ReportLimits,
    pub memory: MemoryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            total_budget_ms: 55_000,
            fetch: FetchConfig::default(),
            sanitize: SanitizeConfig::default(),
            sandbox: SandboxConfig::default(),
            analysis: AnalysisConfig::default(),
            report: ReportLimits::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the TOML is malformed,
    /// or the values are inconsistent (see [`PipelineConfig::validate`]).
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(s).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that could never produce a report
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.total_budget_ms == 0 {
            bail!("total_budget_ms must be greater than zero");
        }
        if self.fetch.timeout_ms == 0 || self.fetch.max_content_length == 0 {
            bail!("fetch.timeout_ms and fetch.max_content_length must be greater than zero");
        }
        if self.sanitize.max_html_bytes < SanitizeConfig::MIN_HTML_BYTES {
            bail!(
                "sanitize.max_html_bytes must be at least {} bytes",
                SanitizeConfig::MIN_HTML_BYTES
            );
        }
        if self.sandbox.max_elements == 0 || self.sandbox.construction_timeout_ms == 0 {
            bail!("sandbox.max_elements and sandbox.construction_timeout_ms must be greater than zero");
        }
        if self.sandbox.complex_site_threshold > self.sandbox.max_elements {
            bail!(
                "sandbox.complex_site_threshold ({}) exceeds sandbox.max_elements ({})",
                self.sandbox.complex_site_threshold,
                self.sandbox.max_elements
            );
        }
        if self.analysis.poll_interval_ms == 0 || self.analysis.max_poll_attempts == 0 {
            bail!("analysis.poll_interval_ms and analysis.max_poll_attempts must be greater than zero");
        }
        if self.analysis.poll_interval_ms >= self.analysis.timeout_ms {
            bail!(
                "analysis.poll_interval_ms ({}) must be shorter than analysis.timeout_ms ({})",
                self.analysis.poll_interval_ms,
                self.analysis.timeout_ms
            );
        }
        if self.memory.elevated_bytes >= self.memory.critical_bytes {
            bail!(
                "memory.elevated_bytes ({}) must be below memory.critical_bytes ({})",
                self.memory.elevated_bytes,
                self.memory.critical_bytes
            );
        }
        Ok(())
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_millis(self.total_budget_ms)
    }
}

/// Governed retrieval limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    /// Body size at which the download is aborted
    pub max_content_length: u64,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            max_content_length: 5 * MIB,
            max_redirects: 5,
            user_agent: concat!("audit-pipeline/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeConfig {
    /// Ceiling on the sanitized markup size
    pub max_html_bytes: usize,
}

impl SanitizeConfig {
    pub const MIN_HTML_BYTES: usize = 1024;
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            max_html_bytes: MIB as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Deadline for loading markup into the sandbox and counting elements
    pub construction_timeout_ms: u64,
    /// Element count above which analysis is refused
    pub max_elements: usize,
    /// Element count above which expensive rules are switched off
    pub complex_site_threshold: usize,
    pub capabilities: CapabilityTable,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            construction_timeout_ms: 10_000,
            max_elements: 3_000,
            complex_site_threshold: 1_500,
            capabilities: CapabilityTable::default(),
        }
    }
}

impl SandboxConfig {
    pub fn construction_timeout(&self) -> Duration {
        Duration::from_millis(self.construction_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Probes after which a silent engine is reported as stalled
    pub max_poll_attempts: u32,
    /// Guideline levels the engine is restricted to
    pub rule_tags: Vec<String>,
    /// Rules switched off for complex sites or under memory pressure
    pub expensive_rules: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            poll_interval_ms: 100,
            max_poll_attempts: 250,
            rule_tags: vec!["wcag2a".to_string(), "wcag2aa".to_string()],
            expensive_rules: [
                "color-contrast",
                "duplicate-id",
                "duplicate-id-active",
                "duplicate-id-aria",
                "region",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Caps applied by the result shaper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportLimits {
    pub max_violations: usize,
    pub max_incomplete: usize,
    pub max_nodes_per_finding: usize,
    pub max_html_chars: usize,
    pub max_summary_chars: usize,
    /// Selectors kept per node; frame-nested nodes carry one per frame
    pub max_targets_per_node: usize,
    pub max_target_chars: usize,
}

impl Default for ReportLimits {
    fn default() -> Self {
        Self {
            max_violations: 30,
            max_incomplete: 20,
            max_nodes_per_finding: 5,
            max_html_chars: 250,
            max_summary_chars: 300,
            max_targets_per_node: 5,
            max_target_chars: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub sample_interval_ms: u64,
    /// Usage at which reclamation hints start
    pub elevated_bytes: u64,
    /// Usage at which new requests are refused
    pub critical_bytes: u64,
    /// Pause after teardown before the secondary reclamation hint
    pub reclaim_delay_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            elevated_bytes: 300 * MIB,
            critical_bytes: 450 * MIB,
            reclaim_delay_ms: 100,
        }
    }
}

impl MemoryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn reclaim_delay(&self) -> Duration {
        Duration::from_millis(self.reclaim_delay_ms)
    }
}
