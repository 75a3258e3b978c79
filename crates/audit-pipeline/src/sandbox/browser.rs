//! Headless Chromium sandbox backend
//!
//! One browser process serves every request. Each request gets its own page
//! with networking switched off and the capability init script installed
//! before the document is written into it.

#![allow(deprecated)] // EmulateNetworkConditionsParams is deprecated but still functional

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    ConnectionType, EmulateNetworkConditionsParams,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{
    CapabilityTable, Sandbox, SandboxError, SandboxFactory, SentinelState, ERROR_SENTINEL,
    RESULT_SENTINEL,
};
use crate::analysis::EngineOptions;

/// Browser launch settings
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Chrome binary; chromiumoxide searches the usual locations when unset
    pub chrome_executable: Option<PathBuf>,
    /// Pass `--no-sandbox` (needed when running as root in containers)
    pub no_sandbox: bool,
    pub user_data_dir: Option<PathBuf>,
    pub launch_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            no_sandbox: false,
            user_data_dir: None,
            launch_timeout: Duration::from_secs(20),
        }
    }
}

impl BrowserOptions {
    fn to_config(&self) -> Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .launch_timeout(self.launch_timeout)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--mute-audio");

        if let Some(path) = &self.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        if self.no_sandbox {
            builder = builder.no_sandbox();
        }

        let user_data_dir = self.user_data_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("audit-pipeline-{}", std::process::id()))
        });
        builder = builder.user_data_dir(user_data_dir);

        builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))
    }
}

/// Source of the rule engine injected into every sandbox
#[derive(Debug, Clone)]
pub struct EngineScript {
    source: Arc<str>,
}

impl EngineScript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine script: {}", path.display()))?;
        if source.trim().is_empty() {
            anyhow::bail!("Engine script is empty: {}", path.display());
        }
        Ok(Self::from_source(source))
    }

    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Arc::from(source.into()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Sandbox factory backed by a shared headless browser
pub struct BrowserSandboxFactory {
    browser: Mutex<Browser>,
    engine: EngineScript,
    _handler: JoinHandle<()>,
}

impl BrowserSandboxFactory {
    pub async fn launch(options: BrowserOptions, engine: EngineScript) -> Result<Self> {
        info!("Launching headless browser for sandboxes");
        let (browser, mut handler) = Browser::launch(options.to_config()?)
            .await
            .context("Failed to launch browser")?;

        let handle = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("Browser handler error: {:?}", e);
                    break;
                }
            }
        });

        info!("Browser launched successfully");
        Ok(Self {
            browser: Mutex::new(browser),
            engine,
            _handler: handle,
        })
    }

    /// Close the browser process
    pub async fn close(&self) -> Result<()> {
        info!("Closing browser");
        self.browser
            .lock()
            .await
            .close()
            .await
            .context("Failed to close browser")?;
        Ok(())
    }

    async fn lock_down(page: &Page, capabilities: &CapabilityTable) -> Result<(), SandboxError> {
        if capabilities.network.is_disabled() {
            let params = EmulateNetworkConditionsParams::builder()
                .offline(true)
                .latency(0.0)
                .download_throughput(0.0)
                .upload_throughput(0.0)
                .connection_type(ConnectionType::None)
                .build()
                .map_err(SandboxError::Launch)?;
            page.execute(params)
                .await
                .map_err(|e| SandboxError::Launch(e.to_string()))?;
        }

        let script = capabilities.init_script();
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script.clone()))
            .await
            .map_err(|e| SandboxError::Launch(e.to_string()))?;
        // The blank page already exists, so apply the script to it as well
        page.evaluate(script)
            .await
            .map_err(|e| SandboxError::Launch(e.to_string()))?;

        debug!(
            "Sandbox locked down, disabled slots: {:?}",
            capabilities.disabled_slots()
        );
        Ok(())
    }
}

#[async_trait]
impl SandboxFactory for BrowserSandboxFactory {
    #[instrument(skip_all)]
    async fn create(
        &self,
        capabilities: &CapabilityTable,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| SandboxError::Launch(e.to_string()))?;

        if let Err(e) = Self::lock_down(&page, capabilities).await {
            if let Err(close_err) = page.close().await {
                warn!("Failed to close page after lock-down failure: {}", close_err);
            }
            return Err(e);
        }

        Ok(Box::new(BrowserSandbox {
            page: Some(page),
            engine: self.engine.clone(),
        }))
    }
}

/// A single browser page holding one request's document
pub struct BrowserSandbox {
    page: Option<Page>,
    engine: EngineScript,
}

impl BrowserSandbox {
    fn page(&self) -> Result<&Page, SandboxError> {
        self.page.as_ref().ok_or(SandboxError::TornDown)
    }

    async fn evaluate_silently(&self, expression: &str) -> Result<(), SandboxError> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(false)
            .return_by_value(true)
            .build()
            .map_err(SandboxError::Script)?;
        self.page()?
            .evaluate_expression(params)
            .await
            .map_err(|e| SandboxError::Script(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Sandbox for BrowserSandbox {
    async fn load(&self, markup: &str, origin: &str) -> Result<(), SandboxError> {
        let document = with_base(markup, origin);
        self.page()?
            .set_content(document)
            .await
            .map_err(|e| SandboxError::Load(e.to_string()))?;
        Ok(())
    }

    async fn element_count(&self) -> Result<usize, SandboxError> {
        self.page()?
            .evaluate("document.getElementsByTagName('*').length")
            .await
            .map_err(|e| SandboxError::Script(e.to_string()))?
            .into_value::<usize>()
            .map_err(|e| SandboxError::Script(e.to_string()))
    }

    async fn launch_engine(&self, options: &EngineOptions) -> Result<(), SandboxError> {
        self.evaluate_silently(self.engine.source()).await?;
        let kickoff = options
            .kickoff_script()
            .map_err(|e| SandboxError::Script(e.to_string()))?;
        self.evaluate_silently(&kickoff).await
    }

    async fn poll_sentinels(&self) -> Result<SentinelState, SandboxError> {
        let probe = format!(
            "[window.{} || null, window.{} || null]",
            RESULT_SENTINEL, ERROR_SENTINEL
        );
        let (result, error): (Option<String>, Option<String>) = self
            .page()?
            .evaluate(probe)
            .await
            .map_err(|e| SandboxError::Script(e.to_string()))?
            .into_value()
            .map_err(|e| SandboxError::Script(e.to_string()))?;
        Ok(SentinelState::from_values(result, error))
    }

    async fn teardown(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("Failed to close sandbox page: {}", e);
            }
        }
    }
}

/// Prefix the document with a `<base>` so relative references resolve against the origin
fn with_base(markup: &str, origin: &str) -> String {
    let escaped = origin
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!("<base href=\"{}\">{}", escaped, markup)
}
