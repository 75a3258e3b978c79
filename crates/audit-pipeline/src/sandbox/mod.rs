//! Isolated execution environment for the sanitized document
//!
//! A [`SandboxFactory`] hands out one [`Sandbox`] per request. Every sandbox
//! is created with its capability table applied and must be torn down
//! exactly once, which [`SandboxGuard`] enforces.

pub mod browser;
pub mod capabilities;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::analysis::EngineOptions;

pub use browser::{BrowserOptions, BrowserSandboxFactory, EngineScript};
pub use capabilities::{CapabilityTable, Slot, ERROR_SENTINEL, RESULT_SENTINEL};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("failed to create sandbox: {0}")]
    Launch(String),

    #[error("failed to load document: {0}")]
    Load(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("sandbox has already been torn down")]
    TornDown,
}

/// Observed state of the two completion sentinels
#[derive(Debug, Clone, PartialEq)]
pub enum SentinelState {
    Pending,
    /// Serialized engine result
    Resolved(String),
    /// Engine error message
    Failed(String),
}

impl SentinelState {
    /// Build from raw sentinel values, result first
    pub fn from_values(result: Option<String>, error: Option<String>) -> Self {
        match (result, error) {
            (Some(result), _) => SentinelState::Resolved(result),
            (None, Some(error)) => SentinelState::Failed(error),
            (None, None) => SentinelState::Pending,
        }
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Replace the sandbox document with `markup`, resolving relative URLs against `origin`
    async fn load(&self, markup: &str, origin: &str) -> Result<(), SandboxError>;

    /// Number of elements in the loaded document
    async fn element_count(&self) -> Result<usize, SandboxError>;

    /// Inject the rule engine and start it without waiting for completion
    async fn launch_engine(&self, options: &EngineOptions) -> Result<(), SandboxError>;

    async fn poll_sentinels(&self) -> Result<SentinelState, SandboxError>;

    /// Release everything the sandbox holds
    async fn teardown(&mut self);
}

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(
        &self,
        capabilities: &CapabilityTable,
    ) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// Owns a sandbox and tears it down exactly once
///
/// The pipeline calls [`SandboxGuard::teardown`] on every path. If the
/// request future is dropped first, `Drop` hands the sandbox to the runtime
/// for teardown.
pub struct SandboxGuard {
    sandbox: Option<Box<dyn Sandbox>>,
}

impl SandboxGuard {
    pub fn new(sandbox: Box<dyn Sandbox>) -> Self {
        Self {
            sandbox: Some(sandbox),
        }
    }

    pub fn sandbox(&self) -> Result<&dyn Sandbox, SandboxError> {
        self.sandbox.as_deref().ok_or(SandboxError::TornDown)
    }

    pub fn is_torn_down(&self) -> bool {
        self.sandbox.is_none()
    }

    /// Tear the sandbox down, returning false if that already happened
    pub async fn teardown(&mut self) -> bool {
        match self.sandbox.take() {
            Some(mut sandbox) => {
                sandbox.teardown().await;
                debug!("Sandbox torn down");
                true
            }
            None => false,
        }
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if let Some(mut sandbox) = self.sandbox.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    debug!("Sandbox dropped without teardown, scheduling it");
                    handle.spawn(async move {
                        sandbox.teardown().await;
                    });
                }
                Err(_) => warn!("Sandbox dropped outside a runtime, teardown skipped"),
            }
        }
    }
}
