//! Rule engine execution observed through condition polling
//!
//! The engine runs inside the sandbox and finishes asynchronously. Nothing
//! in the sandbox can call back into the host, so completion is observed by
//! probing two sentinels at a fixed interval:
//!
//! ```text
//!            probe                     probe
//! Pending ──────────► Pending ─ ... ─────────► Resolved(json) | EngineFailed(msg)
//!    │                                    │
//!    └──── deadline passed ──► TimedOut   └── attempts spent ──► Exhausted
//! ```
//!
//! Every probe is bounded by the same monotonic deadline, so a probe that
//! hangs cannot extend the wait.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use shared_types::ErrorKind;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, instrument, warn};

use crate::config::AnalysisConfig;
use crate::error::PipelineError;
use crate::sandbox::{Sandbox, SandboxError, SentinelState, ERROR_SENTINEL, RESULT_SENTINEL};

/// Options handed to the engine's `run` call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    pub run_only: RunOnly,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rules: BTreeMap<String, RuleToggle>,
    pub result_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOnly {
    #[serde(rename = "type")]
    pub kind: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RuleToggle {
    pub enabled: bool,
}

impl EngineOptions {
    /// Options restricted to the configured guideline levels, with the
    /// expensive rules switched off when `degraded`
    pub fn new(config: &AnalysisConfig, degraded: bool) -> Self {
        let rules = if degraded {
            config
                .expensive_rules
                .iter()
                .map(|id| (id.clone(), RuleToggle { enabled: false }))
                .collect()
        } else {
            BTreeMap::new()
        };

        Self {
            run_only: RunOnly {
                kind: "tag".to_string(),
                values: config.rule_tags.clone(),
            },
            rules,
            result_types: vec!["violations".to_string(), "incomplete".to_string()],
        }
    }

    pub fn disabled_rules(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|(_, toggle)| !toggle.enabled)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Script that starts the engine and returns immediately
    ///
    /// The engine's outcome lands in the result or error sentinel. Findings
    /// are reduced to the fields the report uses before serialization.
    pub fn kickoff_script(&self) -> Result<String, serde_json::Error> {
        let options = serde_json::to_string(self)?;
        Ok(format!(
            r#"(function () {{
  var options = {options};
  var started = Date.now();
  window.{result} = null;
  window.{error} = null;
  if (typeof window.axe === 'undefined' || typeof window.axe.run !== 'function') {{
    window.{error} = 'rule engine is not loaded';
    return false;
  }}
  var node = function (n) {{
    return {{
      html: String(n.html || ''),
      target: (n.target || []).map(String),
      failureSummary: n.failureSummary || null,
      impact: n.impact || null
    }};
  }};
  var finding = function (f) {{
    return {{
      id: f.id,
      impact: f.impact || null,
      description: f.description || '',
      help: f.help || '',
      helpUrl: f.helpUrl || '',
      tags: f.tags || [],
      nodes: (f.nodes || []).map(node)
    }};
  }};
  window.axe.run(document, options).then(function (r) {{
    window.{result} = JSON.stringify({{
      violations: (r.violations || []).map(finding),
      incomplete: (r.incomplete || []).map(finding),
      passes: (r.passes || []).map(function (p) {{
        return {{ id: p.id, nodeCount: (p.nodes || []).length }};
      }}),
      engine: r.testEngine ? {{ name: r.testEngine.name, version: r.testEngine.version }} : null,
      engineMs: Date.now() - started
    }});
  }}).catch(function (e) {{
    window.{error} = String((e && e.message) || e || 'unknown engine error');
  }});
  return true;
}})()"#,
            options = options,
            result = RESULT_SENTINEL,
            error = ERROR_SENTINEL,
        ))
    }
}

/// How a polling run ended
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Resolved(String),
    EngineFailed(String),
    /// The deadline passed
    TimedOut { attempts: u32 },
    /// Every allowed probe found both sentinels empty
    Exhausted { attempts: u32 },
}

/// Bounded condition poller
#[derive(Debug)]
pub struct ConditionPoller {
    interval: Duration,
    deadline: Instant,
    max_attempts: u32,
    attempts: u32,
}

impl ConditionPoller {
    pub fn new(interval: Duration, timeout: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            deadline: Instant::now() + timeout,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Probe until a sentinel is populated, the deadline passes, or attempts run out
    pub async fn run(&mut self, sandbox: &dyn Sandbox) -> Result<PollOutcome, SandboxError> {
        loop {
            if Instant::now() >= self.deadline {
                return Ok(PollOutcome::TimedOut {
                    attempts: self.attempts,
                });
            }
            if self.attempts >= self.max_attempts {
                return Ok(PollOutcome::Exhausted {
                    attempts: self.attempts,
                });
            }

            self.attempts += 1;
            let state = match timeout_at(self.deadline, sandbox.poll_sentinels()).await {
                Ok(state) => state?,
                Err(_) => {
                    return Ok(PollOutcome::TimedOut {
                        attempts: self.attempts,
                    })
                }
            };

            match state {
                SentinelState::Resolved(json) => return Ok(PollOutcome::Resolved(json)),
                SentinelState::Failed(message) => return Ok(PollOutcome::EngineFailed(message)),
                SentinelState::Pending => {}
            }

            sleep_until((Instant::now() + self.interval).min(self.deadline)).await;
        }
    }
}

/// Runs the engine in a constructed sandbox and waits for its result
#[derive(Debug, Clone)]
pub struct AnalysisRunner {
    config: AnalysisConfig,
}

impl AnalysisRunner {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn options(&self, degraded: bool) -> EngineOptions {
        EngineOptions::new(&self.config, degraded)
    }

    /// Launch the engine and return its serialized result
    ///
    /// The wait is bounded by the analysis timeout or `remaining`, whichever
    /// is shorter. The caller owns teardown.
    #[instrument(skip_all, fields(disabled_rules = options.rules.len()))]
    pub async fn run(
        &self,
        sandbox: &dyn Sandbox,
        options: &EngineOptions,
        remaining: Duration,
    ) -> Result<String, PipelineError> {
        let limit = self.config.timeout().min(remaining);
        let mut poller =
            ConditionPoller::new(self.config.poll_interval(), limit, self.config.max_poll_attempts);

        match timeout_at(poller.deadline, sandbox.launch_engine(options)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(PipelineError::new(
                    ErrorKind::EngineError,
                    format!("Failed to start the analysis engine: {}", e),
                ))
            }
            Err(_) => return Err(analysis_timeout(limit, 0)),
        }
        debug!("Engine launched, polling every {:?}", self.config.poll_interval());

        let outcome = poller.run(sandbox).await.map_err(|e| {
            PipelineError::new(
                ErrorKind::EngineError,
                format!("Failed to read analysis state: {}", e),
            )
        })?;

        match outcome {
            PollOutcome::Resolved(json) => {
                debug!("Engine finished after {} probes", poller.attempts());
                Ok(json)
            }
            PollOutcome::EngineFailed(message) => Err(PipelineError::new(
                ErrorKind::EngineError,
                format!("Analysis engine failed: {}", message),
            )),
            PollOutcome::TimedOut { attempts } => {
                warn!("Analysis timed out after {:?} ({} probes)", limit, attempts);
                Err(analysis_timeout(limit, attempts))
            }
            PollOutcome::Exhausted { attempts } => {
                warn!("Engine stalled: {} probes without a result", attempts);
                Err(PipelineError::new(
                    ErrorKind::PollExhausted,
                    format!(
                        "Analysis engine produced neither a result nor an error after {} checks",
                        attempts
                    ),
                )
                .with_details(attempts.to_string()))
            }
        }
    }
}

fn analysis_timeout(limit: Duration, attempts: u32) -> PipelineError {
    PipelineError::new(
        ErrorKind::AnalysisTimeout,
        format!("Analysis did not finish within {}ms", limit.as_millis()),
    )
    .with_details(attempts.to_string())
}
