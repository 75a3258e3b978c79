//! Bounded accessibility-audit pipeline
//!
//! Fetches a remote HTML document, sanitizes it, loads it into a
//! capability-stripped sandbox, runs a rule engine inside the sandbox and
//! returns a size-capped report.
//!
//! ```text
//! ┌──────────┐  ┌───────────┐  ┌─────────┐  ┌──────────┐  ┌────────┐
//! │ Fetcher  │─▶│ Sanitizer │─▶│ Sandbox │─▶│ Analysis │─▶│ Shaper │─▶ BoundedReport
//! └──────────┘  └───────────┘  └─────────┘  └──────────┘  └────────┘
//!       ▲
//!       └──── admission ◀── ResourceGovernor (background sampler)
//! ```
//!
//! [`lifecycle::Pipeline`] drives one request through these phases and
//! tears the sandbox down exactly once on every exit path.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use audit_pipeline::{
//!     config::PipelineConfig,
//!     fetcher::HttpFetcher,
//!     governor::ResourceGovernor,
//!     lifecycle::Pipeline,
//!     sandbox::browser::{BrowserOptions, BrowserSandboxFactory, EngineScript},
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Arc::new(PipelineConfig::default());
//! let engine = EngineScript::from_file("axe.min.js")?;
//! let sandboxes = BrowserSandboxFactory::launch(BrowserOptions::default(), engine).await?;
//! let governor = ResourceGovernor::for_process(config.memory.clone());
//! let _sampler = governor.spawn_sampler();
//!
//! let pipeline = Pipeline::new(config, Arc::new(HttpFetcher), Arc::new(sandboxes), governor);
//! let report = pipeline.run("https://example.com").await?;
//! println!("{} violations", report.totals.violations);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod governor;
pub mod lifecycle;
pub mod sandbox;
pub mod sanitizer;
pub mod shaper;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use lifecycle::{AnalysisRequest, Phase, Pipeline};
pub use shared_types::{BoundedReport, ErrorKind};
