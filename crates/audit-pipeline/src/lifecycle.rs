//! Per-request lifecycle controller
//!
//! ```text
//! Admitted ─▶ Fetching ─▶ Sanitizing ─▶ SandboxBuilding ─▶ Analyzing ─▶ Shaping ─▶ Completed
//!    │            └────────────┴──────────────┴───────────────┴───────────┴──▶ Failed(kind)
//!    └──▶ Rejected(kind)
//! ```
//!
//! Transitions only move forward. Every phase runs under its own limit,
//! shortened to whatever is left of the request's total budget. The sandbox
//! slot is torn down at a single site after analysis, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;
use shared_types::{BoundedReport, ErrorKind, PhaseTimings};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::analysis::AnalysisRunner;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::fetcher::{DocumentFetcher, FetchLimits};
use crate::governor::{Pressure, ResourceGovernor};
use crate::sandbox::{SandboxError, SandboxFactory, SandboxGuard};
use crate::sanitizer::{decode_body, Sanitizer};
use crate::shaper::{ResultShaper, ShapeContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Admitted,
    Fetching,
    Sanitizing,
    SandboxBuilding,
    Analyzing,
    Shaping,
    Completed,
    Failed(ErrorKind),
    Rejected(ErrorKind),
}

impl Phase {
    fn ordinal(&self) -> Option<u8> {
        match self {
            Phase::Admitted => Some(0),
            Phase::Fetching => Some(1),
            Phase::Sanitizing => Some(2),
            Phase::SandboxBuilding => Some(3),
            Phase::Analyzing => Some(4),
            Phase::Shaping => Some(5),
            Phase::Completed => Some(6),
            Phase::Failed(_) | Phase::Rejected(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Completed | Phase::Failed(_) | Phase::Rejected(_)
        )
    }

    /// Whether `next` is a legal transition from this phase
    pub fn can_advance_to(&self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Phase::Rejected(_) => *self == Phase::Admitted,
            Phase::Failed(_) => true,
            _ => match (self.ordinal(), next.ordinal()) {
                (Some(from), Some(to)) => to == from + 1,
                _ => false,
            },
        }
    }
}

/// A validated request with its budget
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub id: Uuid,
    pub url: Url,
    started: Instant,
    deadline: Instant,
}

impl AnalysisRequest {
    /// Validate `raw` and start the request's budget clock
    pub fn new(raw: &str, config: &PipelineConfig) -> Result<Self, PipelineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::new(ErrorKind::InvalidUrl, "URL is required"));
        }

        let url = Url::parse(trimmed).map_err(|e| {
            PipelineError::new(ErrorKind::InvalidUrl, format!("Invalid URL: {}", e))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(PipelineError::new(
                ErrorKind::InvalidProtocol,
                format!("Unsupported protocol: {}", url.scheme()),
            )
            .with_details(url.scheme().to_string()));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(PipelineError::new(ErrorKind::InvalidUrl, "URL has no host"));
        }

        let started = Instant::now();
        Ok(Self {
            id: Uuid::new_v4(),
            url,
            started,
            deadline: started + config.total_budget(),
        })
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Current phase plus the time spent in each finished phase
#[derive(Debug)]
pub struct PhaseTracker {
    phase: Phase,
    started: Instant,
    entered: Instant,
    timings: PhaseTimings,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            phase: Phase::Admitted,
            started: now,
            entered: now,
            timings: PhaseTimings::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn timings(&self) -> PhaseTimings {
        self.timings
    }

    pub fn enter(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.phase,
            next
        );
        self.close_current();
        debug!("Phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        self.entered = Instant::now();
    }

    /// Move to the matching terminal state and tag the error with the phase it came from
    pub fn fail(&mut self, err: PipelineError) -> PipelineError {
        self.close_current();
        let (terminal, err) = if self.phase == Phase::Admitted {
            (Phase::Rejected(err.kind), err)
        } else {
            let phase = self.phase;
            (Phase::Failed(err.kind), err.in_phase(phase))
        };
        self.phase = terminal;
        self.timings.total_ms = millis(self.started.elapsed());
        err
    }

    pub fn complete(&mut self) -> PhaseTimings {
        self.enter(Phase::Completed);
        self.timings.total_ms = millis(self.started.elapsed());
        self.timings
    }

    fn close_current(&mut self) {
        let spent = millis(self.entered.elapsed());
        match self.phase {
            Phase::Fetching => self.timings.fetch_ms = spent,
            Phase::Sanitizing => self.timings.sanitize_ms = spent,
            Phase::SandboxBuilding => self.timings.sandbox_ms = spent,
            Phase::Analyzing => self.timings.analysis_ms = spent,
            Phase::Shaping => self.timings.shaping_ms = spent,
            _ => {}
        }
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Facts gathered before shaping
struct Analyzed {
    json: String,
    final_url: String,
    html_truncated: bool,
    html_bytes: usize,
    element_count: usize,
    degraded: bool,
}

/// Drives requests through the phases
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    fetcher: Arc<dyn DocumentFetcher>,
    sandboxes: Arc<dyn SandboxFactory>,
    governor: Arc<ResourceGovernor>,
    sanitizer: Sanitizer,
    runner: AnalysisRunner,
    shaper: ResultShaper,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        fetcher: Arc<dyn DocumentFetcher>,
        sandboxes: Arc<dyn SandboxFactory>,
        governor: Arc<ResourceGovernor>,
    ) -> Self {
        Self {
            sanitizer: Sanitizer::new(&config.sanitize),
            runner: AnalysisRunner::new(config.analysis.clone()),
            shaper: ResultShaper::new(config.report.clone()),
            config,
            fetcher,
            sandboxes,
            governor,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    /// Validate `url` and run it through every phase
    pub async fn run(&self, url: &str) -> Result<BoundedReport, PipelineError> {
        let request = AnalysisRequest::new(url, &self.config).map_err(|e| {
            debug!("Rejected request for {:?}: {}", url, e);
            e
        })?;
        self.execute(request).await
    }

    #[instrument(skip(self, request), fields(request_id = %request.id, url = %request.url))]
    pub async fn execute(&self, request: AnalysisRequest) -> Result<BoundedReport, PipelineError> {
        let mut tracker = PhaseTracker::new();

        if let Err(e) = self.governor.admit() {
            warn!("Refusing request under memory pressure: {}", e.message);
            return Err(tracker.fail(e));
        }

        let mut sandbox: Option<SandboxGuard> = None;
        let outcome = self.drive(&request, &mut tracker, &mut sandbox).await;

        if let Some(mut guard) = sandbox.take() {
            guard.teardown().await;
            self.reclaim_after_teardown().await;
        }

        let analyzed = match outcome {
            Ok(analyzed) => analyzed,
            Err(e) => {
                let err = tracker.fail(e);
                warn!(
                    "Request failed in {:?}: {} ({}ms)",
                    err.phase,
                    err,
                    millis(request.elapsed())
                );
                return Err(err);
            }
        };

        tracker.enter(Phase::Shaping);
        let raw = match self.shaper.parse(&analyzed.json) {
            Ok(raw) => raw,
            Err(e) => return Err(tracker.fail(e)),
        };
        let ctx = ShapeContext {
            url: request.url.to_string(),
            final_url: analyzed.final_url,
            html_truncated: analyzed.html_truncated,
            complex_site: analyzed.degraded,
            element_count: analyzed.element_count,
            html_bytes: analyzed.html_bytes,
            timings: PhaseTimings::default(),
            analyzed_at: chrono::Utc::now().to_rfc3339(),
        };
        let mut report = self.shaper.shape(raw, ctx);
        let timings = tracker.complete();
        report.timings = timings;
        report.elapsed_ms = timings.total_ms;

        info!(
            "Analysis complete: {} violations ({} reported), {} incomplete, {} elements in {}ms",
            report.totals.violations,
            report.violations.len(),
            report.totals.incomplete,
            report.element_count,
            report.elapsed_ms
        );
        Ok(report)
    }

    /// Fetch through analysis; a created sandbox is left in `slot` for the caller to tear down
    async fn drive(
        &self,
        request: &AnalysisRequest,
        tracker: &mut PhaseTracker,
        slot: &mut Option<SandboxGuard>,
    ) -> Result<Analyzed, PipelineError> {
        tracker.enter(Phase::Fetching);
        let limits = FetchLimits::from_config(&self.config.fetch, request.remaining());
        let fetched = timeout(limits.timeout, self.fetcher.fetch(&request.url, &limits)).await;
        let document = match fetched {
            Ok(result) => result?,
            Err(_) => {
                return Err(PipelineError::new(
                    ErrorKind::NetworkError,
                    format!(
                        "Fetching the page did not finish within {}ms",
                        limits.timeout.as_millis()
                    ),
                )
                .with_details("TIMEOUT"))
            }
        };

        tracker.enter(Phase::Sanitizing);
        let text = decode_body(&document)?;
        let sanitized = self.sanitizer.sanitize(&text)?;
        drop(text);
        debug!(
            "Sanitized {} -> {} bytes (truncated: {})",
            sanitized.original_bytes, sanitized.sanitized_bytes, sanitized.truncated
        );

        tracker.enter(Phase::SandboxBuilding);
        let element_count = self
            .build_sandbox(request, &sanitized.markup, &document.final_url, slot)
            .await?;

        tracker.enter(Phase::Analyzing);
        let complex = element_count > self.config.sandbox.complex_site_threshold;
        let pressure = self.governor.pressure();
        let degraded = complex || pressure >= Pressure::Elevated;
        let options = self.runner.options(degraded);
        if degraded {
            info!(
                "Degraded analysis ({} elements, {:?} pressure), disabled rules: {:?}",
                element_count,
                pressure,
                options.disabled_rules()
            );
        }

        let guard = slot.as_ref().ok_or_else(torn_down)?;
        let sandbox = guard.sandbox().map_err(|_| torn_down())?;
        let json = self
            .runner
            .run(sandbox, &options, request.remaining())
            .await?;

        Ok(Analyzed {
            json,
            final_url: document.final_url,
            html_truncated: sanitized.truncated,
            html_bytes: sanitized.sanitized_bytes,
            element_count,
            degraded,
        })
    }

    /// Create the sandbox, load the markup and enforce the element ceiling
    #[instrument(skip_all, fields(html_bytes = markup.len()))]
    async fn build_sandbox(
        &self,
        request: &AnalysisRequest,
        markup: &str,
        origin: &str,
        slot: &mut Option<SandboxGuard>,
    ) -> Result<usize, PipelineError> {
        let limit = self
            .config
            .sandbox
            .construction_timeout()
            .min(request.remaining());
        let deadline = Instant::now() + limit;

        let created = match timeout_at(deadline, self.spawn_create()).await {
            Ok(Ok(created)) => created,
            Ok(Err(_)) => Err(SandboxError::Launch("creation task ended early".to_string())),
            Err(_) => return Err(sandbox_timeout(limit)),
        };
        let guard = match created {
            Ok(guard) => slot.insert(guard),
            Err(e) => return Err(sandbox_failure("SANDBOX_CREATE", e)),
        };

        let loaded = timeout_at(deadline, async {
            let sandbox = guard.sandbox()?;
            sandbox.load(markup, origin).await?;
            sandbox.element_count().await
        })
        .await;
        let element_count = match loaded {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => return Err(sandbox_failure("SANDBOX_LOAD", e)),
            Err(_) => return Err(sandbox_timeout(limit)),
        };

        let ceiling = self.config.sandbox.max_elements;
        if element_count > ceiling {
            warn!("Document has {} elements, ceiling is {}", element_count, ceiling);
            return Err(PipelineError::new(
                ErrorKind::TooComplex,
                format!(
                    "Page has {} elements, more than the {} that can be analyzed",
                    element_count, ceiling
                ),
            )
            .with_details(element_count.to_string()));
        }

        debug!("Sandbox built with {} elements", element_count);
        Ok(element_count)
    }

    /// Create a sandbox on its own task
    ///
    /// A sandbox that finishes creating after the receiver is gone (deadline
    /// hit, request cancelled) is torn down by the task itself.
    fn spawn_create(&self) -> oneshot::Receiver<Result<SandboxGuard, SandboxError>> {
        let (tx, rx) = oneshot::channel();
        let factory = Arc::clone(&self.sandboxes);
        let capabilities = self.config.sandbox.capabilities.clone();
        tokio::spawn(async move {
            let created = factory.create(&capabilities).await.map(SandboxGuard::new);
            if let Err(Ok(mut orphan)) = tx.send(created) {
                debug!("Sandbox finished creating after its request gave up");
                orphan.teardown().await;
            }
        });
        rx
    }

    /// Secondary reclamation after a sandbox is released under pressure
    async fn reclaim_after_teardown(&self) {
        if self.governor.pressure() == Pressure::Normal {
            return;
        }
        sleep(self.config.memory.reclaim_delay()).await;
        self.governor.reclaim_hint();
    }
}

fn sandbox_timeout(limit: Duration) -> PipelineError {
    PipelineError::new(
        ErrorKind::SandboxTimeout,
        format!(
            "Building the page sandbox did not finish within {}ms",
            limit.as_millis()
        ),
    )
}

fn sandbox_failure(code: &str, err: SandboxError) -> PipelineError {
    PipelineError::new(
        ErrorKind::ServerError,
        format!("Failed to build the page sandbox: {}", err),
    )
    .with_details(code)
}

fn torn_down() -> PipelineError {
    sandbox_failure("SANDBOX_GONE", SandboxError::TornDown)
}
