//! End-to-end pipeline scenarios against fake fetchers and sandboxes

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use audit_pipeline::config::PipelineConfig;
use audit_pipeline::error::PipelineError;
use audit_pipeline::sandbox::Slot;
use audit_pipeline::{ErrorKind, Phase};
use common::*;
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.fetch.timeout_ms = 1_000;
    config.sandbox.construction_timeout_ms = 1_000;
    config.analysis.timeout_ms = 2_000;
    config.analysis.poll_interval_ms = 100;
    config
}

fn page() -> FetchBehavior {
    FetchBehavior::Respond(html_page("<main><h1>Hello</h1><img src=\"a.png\"></main>"))
}

#[tokio::test(start_paused = true)]
async fn test_successful_run_is_bounded_and_tears_down_once() {
    let factory = FakeSandboxFactory::new(200, EngineBehavior::ResolveAfter(3, engine_result(40)));
    let h = harness(config(), page(), factory, 100);

    let report = assert_ok!(h.pipeline.run("https://example.com").await);

    assert!(report.success);
    assert_eq!(report.violations.len(), 30);
    assert_eq!(report.totals.violations, 40);
    assert!(report.results_truncated);
    assert!(!report.complex_site);
    assert_eq!(report.element_count, 200);
    assert_eq!(report.pass_count, 1);
    assert_eq!(report.final_url, "https://example.com/");
    assert_eq!(report.engine.as_ref().map(|e| e.name.as_str()), Some("axe-core"));
    assert!(report.timings.analysis_ms >= 200);
    assert_eq!(report.elapsed_ms, report.timings.total_ms);

    assert_eq!(h.sandboxes.created(), 1);
    assert_eq!(h.sandboxes.launches(), 1);
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sandbox_gets_locked_down_capabilities() {
    let factory = FakeSandboxFactory::new(10, EngineBehavior::ResolveAfter(1, engine_result(0)));
    let h = harness(config(), page(), factory, 100);

    assert_ok!(h.pipeline.run("https://example.com").await);

    let caps = h.sandboxes.last_capabilities.lock().unwrap().clone().unwrap();
    assert_eq!(caps.network, Slot::Disabled);
    assert_eq!(caps.timers, Slot::Disabled);
    assert_eq!(caps.dialogs, Slot::Disabled);
}

#[tokio::test(start_paused = true)]
async fn test_too_many_elements_rejected_before_analysis() {
    let factory = FakeSandboxFactory::new(4_000, EngineBehavior::ResolveAfter(1, engine_result(1)));
    let h = harness(config(), page(), factory, 100);

    let err = assert_err!(h.pipeline.run("https://example.com").await);

    assert_eq!(err.kind, ErrorKind::TooComplex);
    assert_eq!(err.details.as_deref(), Some("4000"));
    assert_eq!(err.phase, Some(Phase::SandboxBuilding));
    assert_eq!(h.sandboxes.launches(), 0);
    assert_eq!(h.sandboxes.created(), 1);
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_complex_site_disables_expensive_rules() {
    let factory = FakeSandboxFactory::new(1_600, EngineBehavior::ResolveAfter(1, engine_result(2)));
    let h = harness(config(), page(), factory, 100);

    let report = assert_ok!(h.pipeline.run("https://example.com").await);
    assert!(report.complex_site);

    let options = h.sandboxes.last_options.lock().unwrap().clone().unwrap();
    let disabled = options.disabled_rules();
    assert!(disabled.contains(&"color-contrast"));
    assert!(disabled.contains(&"duplicate-id"));
}

#[tokio::test(start_paused = true)]
async fn test_elevated_memory_degrades_and_reclaims_after_teardown() {
    let factory = FakeSandboxFactory::new(100, EngineBehavior::ResolveAfter(1, engine_result(2)));
    let h = harness(config(), page(), factory, 350);
    let reclaims_before = h.reclaims.0.load(Ordering::SeqCst);

    let report = assert_ok!(h.pipeline.run("https://example.com").await);
    assert!(report.complex_site);
    assert_eq!(h.sandboxes.teardowns(), 1);
    assert!(h.reclaims.0.load(Ordering::SeqCst) > reclaims_before);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_timeout_creates_no_sandbox() {
    let factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    let h = harness(config(), FetchBehavior::Hang, factory, 100);

    let started = Instant::now();
    let err = assert_err!(h.pipeline.run("https://example.com").await);

    assert_eq!(err.kind, ErrorKind::NetworkError);
    assert_eq!(err.details.as_deref(), Some("TIMEOUT"));
    assert_eq!(err.phase, Some(Phase::Fetching));
    assert!(started.elapsed() >= Duration::from_millis(1_000));
    assert!(started.elapsed() < Duration::from_millis(1_500));
    assert_eq!(h.sandboxes.created(), 0);
    assert_eq!(h.sandboxes.teardowns(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_error_passes_through_with_kind() {
    let failure = PipelineError::new(ErrorKind::HttpError, "Server responded with HTTP 404")
        .with_details("404");
    let factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    let h = harness(config(), FetchBehavior::Fail(failure), factory, 100);

    let err = assert_err!(h.pipeline.run("https://example.com/missing").await);
    assert_eq!(err.kind, ErrorKind::HttpError);
    assert_eq!(err.details.as_deref(), Some("404"));
    assert_eq!(h.sandboxes.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_silent_engine_times_out_and_tears_down_once() {
    let factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    let h = harness(config(), page(), factory, 100);

    let started = Instant::now();
    let err = assert_err!(h.pipeline.run("https://example.com").await);

    assert_eq!(err.kind, ErrorKind::AnalysisTimeout);
    assert_eq!(err.phase, Some(Phase::Analyzing));
    assert!(started.elapsed() >= Duration::from_millis(2_000));
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_cap_reports_stalled_engine() {
    let mut config = config();
    config.analysis.max_poll_attempts = 4;
    let factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    let h = harness(config, page(), factory, 100);

    let err = assert_err!(h.pipeline.run("https://example.com").await);

    assert_eq!(err.kind, ErrorKind::PollExhausted);
    assert_eq!(h.sandboxes.probes.load(Ordering::SeqCst), 4);
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_engine_error_sentinel() {
    let factory = FakeSandboxFactory::new(
        10,
        EngineBehavior::FailAfter(2, "Cannot read properties of null".to_string()),
    );
    let h = harness(config(), page(), factory, 100);

    let err = assert_err!(h.pipeline.run("https://example.com").await);
    assert_eq!(err.kind, ErrorKind::EngineError);
    assert!(err.message.contains("Cannot read properties of null"));
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_result_fails_after_teardown() {
    let factory =
        FakeSandboxFactory::new(10, EngineBehavior::ResolveAfter(1, "{\"violations\": 7".into()));
    let h = harness(config(), page(), factory, 100);

    let err = assert_err!(h.pipeline.run("https://example.com").await);
    assert_eq!(err.kind, ErrorKind::ResultProcessingError);
    assert_eq!(err.phase, Some(Phase::Shaping));
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_construction_is_sandbox_timeout() {
    let mut factory =
        FakeSandboxFactory::new(10, EngineBehavior::ResolveAfter(1, engine_result(0)));
    factory.load_delay = Duration::from_secs(60);
    let h = harness(config(), page(), factory, 100);

    let err = assert_err!(h.pipeline.run("https://example.com").await);
    assert_eq!(err.kind, ErrorKind::SandboxTimeout);
    assert_eq!(h.sandboxes.launches(), 0);
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_creation_is_torn_down_when_it_lands() {
    let mut factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    factory.create_delay = Duration::from_secs(5);
    let h = harness(config(), page(), factory, 100);

    let err = assert_err!(h.pipeline.run("https://example.com").await);
    assert_eq!(err.kind, ErrorKind::SandboxTimeout);
    assert_eq!(err.phase, Some(Phase::SandboxBuilding));
    assert_eq!(h.sandboxes.created(), 0);

    // The factory finishes long after the request failed
    tokio::time::sleep(Duration::from_secs(10)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.sandboxes.created(), 1);
    assert_eq!(h.sandboxes.teardowns(), 1);
    assert_eq!(h.sandboxes.launches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_load_failure_is_torn_down() {
    let mut factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    factory.load_error = Some("renderer crashed".to_string());
    let h = harness(config(), page(), factory, 100);

    let err = assert_err!(h.pipeline.run("https://example.com").await);
    assert_eq!(err.kind, ErrorKind::ServerError);
    assert_eq!(err.details.as_deref(), Some("SANDBOX_LOAD"));
    assert_eq!(err.phase, Some(Phase::SandboxBuilding));
    assert!(err.message.contains("renderer crashed"));
    assert_eq!(h.sandboxes.created(), 1);
    assert_eq!(h.sandboxes.launches(), 0);
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_critical_memory_rejects_before_fetch() {
    let factory = FakeSandboxFactory::new(10, EngineBehavior::ResolveAfter(1, engine_result(0)));
    let h = harness(config(), page(), factory, 500);

    let err = assert_err!(h.pipeline.run("https://example.com").await);
    assert_eq!(err.kind, ErrorKind::MemoryExhausted);
    assert_eq!(err.phase, None);
    assert_eq!(h.fetch_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sandboxes.created(), 0);

    // Falling below the elevated threshold reopens admission
    h.probe.set_mb(100);
    h.governor.sample();
    assert_ok!(h.pipeline.run("https://example.com").await);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_url_rejected_without_fetching() {
    let factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    let h = harness(config(), page(), factory, 100);

    let err = assert_err!(h.pipeline.run("file:///etc/passwd").await);
    assert_eq!(err.kind, ErrorKind::InvalidProtocol);

    let err = assert_err!(h.pipeline.run("::not a url::").await);
    assert_eq!(err.kind, ErrorKind::InvalidUrl);

    assert_eq!(h.fetch_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_binary_response_is_invalid_content() {
    let mut doc = html_page("");
    doc.content_type = Some("image/png".to_string());
    let factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    let h = harness(config(), FetchBehavior::Respond(doc), factory, 100);

    let err = assert_err!(h.pipeline.run("https://example.com/logo.png").await);
    assert_eq!(err.kind, ErrorKind::InvalidContent);
    assert_eq!(err.phase, Some(Phase::Sanitizing));
    assert_eq!(h.sandboxes.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_total_budget_caps_analysis_wait() {
    let mut config = config();
    config.total_budget_ms = 1_500;
    config.analysis.timeout_ms = 30_000;
    let factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    let h = harness(config, page(), factory, 100);

    let started = Instant::now();
    let err = assert_err!(h.pipeline.run("https://example.com").await);
    assert_eq!(err.kind, ErrorKind::AnalysisTimeout);
    assert!(started.elapsed() <= Duration::from_millis(1_600));
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_request_still_tears_down() {
    let factory = FakeSandboxFactory::new(10, EngineBehavior::Silent);
    let h = harness(config(), page(), factory, 100);

    let pipeline = h.pipeline.clone();
    let task = tokio::spawn(async move { pipeline.run("https://example.com").await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.sandboxes.launches(), 1);
    task.abort();
    let _ = task.await;

    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.sandboxes.teardowns(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_each_get_one_sandbox() {
    let factory = FakeSandboxFactory::new(50, EngineBehavior::ResolveAfter(2, engine_result(3)));
    let h = harness(config(), page(), factory, 100);

    let runs = (0..5).map(|_| {
        let pipeline = h.pipeline.clone();
        tokio::spawn(async move { pipeline.run("https://example.com").await })
    });
    for run in futures::future::join_all(runs).await {
        let _ = run.unwrap();
    }

    assert_eq!(h.sandboxes.created(), 5);
    assert_eq!(h.sandboxes.teardowns(), 5);
}
