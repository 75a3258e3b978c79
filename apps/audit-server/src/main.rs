//! Accessibility audit server
//!
//! HTTP front end for the audit pipeline:
//!
//! - `POST /api/analyze` runs one bounded analysis of a URL
//! - `GET /health` reports liveness and the memory governor's state
//!
//! ## Architecture
//!
//! One headless browser serves every request, each in its own page
//! sandbox. A background sampler publishes memory pressure; requests are
//! refused while it is critical. Per-IP rate limiting sits in front of
//! everything.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use audit_pipeline::config::PipelineConfig;
use audit_pipeline::fetcher::HttpFetcher;
use audit_pipeline::governor::ResourceGovernor;
use audit_pipeline::sandbox::{BrowserOptions, BrowserSandboxFactory, EngineScript};
use audit_pipeline::Pipeline;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod error;

use api::{handle_analyze, handle_health};

/// Command-line arguments for the audit server
#[derive(Parser, Debug)]
#[command(name = "audit-server")]
#[command(about = "Bounded accessibility audits of remote pages")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Pipeline configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule engine script injected into every sandbox
    #[arg(long, default_value = "axe.min.js")]
    engine_script: PathBuf,

    /// Chrome/Chromium executable
    #[arg(long)]
    chrome: Option<PathBuf>,

    /// Launch the browser without its own OS sandbox (containers running as root)
    #[arg(long)]
    no_sandbox: bool,

    /// Rate limit: requests per second per IP
    #[arg(long, default_value = "10")]
    rate_limit: u32,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

/// Routes without the rate limiter, which needs the peer address
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/analyze", post(handle_analyze))
        .with_state(state)
}

fn init_tracing(verbose: bool, json: bool) {
    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_json);

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let config = Arc::new(config);

    info!("Starting audit server on {}:{}", args.host, args.port);

    let engine = EngineScript::from_file(&args.engine_script)?;
    let browser = BrowserOptions {
        chrome_executable: args.chrome.clone(),
        no_sandbox: args.no_sandbox,
        ..BrowserOptions::default()
    };
    let sandboxes = Arc::new(BrowserSandboxFactory::launch(browser, engine).await?);

    let governor = ResourceGovernor::for_process(config.memory.clone());
    let sampler = governor.spawn_sampler();

    let pipeline = Pipeline::new(
        config.clone(),
        Arc::new(HttpFetcher),
        sandboxes.clone(),
        governor,
    );
    let state = AppState {
        pipeline: Arc::new(pipeline),
    };

    // Create rate limiter configuration
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(args.rate_limit.into())
            .burst_size(args.rate_limit * 2)
            .finish()
            .context("Rate limit must be greater than zero")?,
    );

    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = app(state)
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        );

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    info!("Rate limit: {} requests/second per IP", args.rate_limit);
    info!(
        "Budget: {}ms total, {} element ceiling",
        config.total_budget_ms, config.sandbox.max_elements
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sampler.shutdown();
    if let Err(e) = sandboxes.close().await {
        warn!("Browser did not close cleanly: {:#}", e);
    }
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining connections");
}
