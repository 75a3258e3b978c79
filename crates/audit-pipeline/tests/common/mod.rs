//! Shared fakes for pipeline scenario tests

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use audit_pipeline::analysis::EngineOptions;
use audit_pipeline::config::{MemoryConfig, PipelineConfig};
use audit_pipeline::error::PipelineError;
use audit_pipeline::fetcher::{DocumentFetcher, FetchLimits, FetchedDocument};
use audit_pipeline::governor::{MemoryProbe, Reclaimer, ResourceGovernor};
use audit_pipeline::sandbox::{
    CapabilityTable, Sandbox, SandboxError, SandboxFactory, SentinelState,
};
use audit_pipeline::Pipeline;
use reqwest::Url;

pub const MIB: u64 = 1024 * 1024;

pub fn html_page(body: &str) -> FetchedDocument {
    FetchedDocument {
        body: format!(
            "<!DOCTYPE html><html><head><title>Test</title></head><body>{}</body></html>",
            body
        )
        .into_bytes(),
        content_type: Some("text/html; charset=utf-8".to_string()),
        declared_length: None,
        status: 200,
        final_url: "https://example.com/".to_string(),
    }
}

/// Engine payload with `violations` findings of one node each
pub fn engine_result(violations: usize) -> String {
    let findings: Vec<serde_json::Value> = (0..violations)
        .map(|i| {
            serde_json::json!({
                "id": format!("rule-{}", i),
                "impact": "serious",
                "description": "Ensures something",
                "help": "Something must hold",
                "helpUrl": "https://example.com/rules",
                "tags": ["wcag2a"],
                "nodes": [{
                    "html": "<img src=x.png>",
                    "target": ["img"],
                    "failureSummary": "Fix it"
                }]
            })
        })
        .collect();
    serde_json::json!({
        "violations": findings,
        "incomplete": [],
        "passes": [{"id": "document-title", "nodeCount": 1}],
        "engine": {"name": "axe-core", "version": "4.10.0"},
        "engineMs": 120
    })
    .to_string()
}

pub enum FetchBehavior {
    Respond(FetchedDocument),
    Fail(PipelineError),
    Hang,
}

/// Fetcher that plays back a fixed behavior and counts calls
pub struct ScriptedFetcher {
    behavior: FetchBehavior,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedFetcher {
    pub fn new(behavior: FetchBehavior) -> Self {
        Self {
            behavior,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl DocumentFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        _url: &Url,
        _limits: &FetchLimits,
    ) -> Result<FetchedDocument, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            FetchBehavior::Respond(doc) => Ok(doc.clone()),
            FetchBehavior::Fail(err) => Err(err.clone()),
            FetchBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Err(PipelineError::new(
                    audit_pipeline::ErrorKind::ServerError,
                    "hang ended",
                ))
            }
        }
    }
}

#[derive(Clone)]
pub enum EngineBehavior {
    /// Populate the result sentinel after this many probes
    ResolveAfter(u32, String),
    /// Populate the error sentinel after this many probes
    FailAfter(u32, String),
    /// Never populate either sentinel
    Silent,
}

/// Counters shared by a factory and every sandbox it creates
#[derive(Clone, Default)]
pub struct SandboxCounters {
    pub created: Arc<AtomicUsize>,
    pub teardowns: Arc<AtomicUsize>,
    pub launches: Arc<AtomicUsize>,
    pub probes: Arc<AtomicU32>,
    pub last_options: Arc<Mutex<Option<EngineOptions>>>,
    pub last_capabilities: Arc<Mutex<Option<CapabilityTable>>>,
}

impl SandboxCounters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

/// Sandbox factory with configurable document size and engine behavior
#[derive(Clone)]
pub struct FakeSandboxFactory {
    pub element_count: usize,
    pub engine: EngineBehavior,
    pub create_delay: Duration,
    pub load_delay: Duration,
    /// Fail `load` with this message
    pub load_error: Option<String>,
    pub counters: SandboxCounters,
}

impl FakeSandboxFactory {
    pub fn new(element_count: usize, engine: EngineBehavior) -> Self {
        Self {
            element_count,
            engine,
            create_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            load_error: None,
            counters: SandboxCounters::default(),
        }
    }
}

#[async_trait]
impl SandboxFactory for FakeSandboxFactory {
    async fn create(
        &self,
        capabilities: &CapabilityTable,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_capabilities.lock().unwrap() = Some(capabilities.clone());
        Ok(Box::new(FakeSandbox {
            factory: self.clone(),
            launched: AtomicU64::new(0),
        }))
    }
}

pub struct FakeSandbox {
    factory: FakeSandboxFactory,
    launched: AtomicU64,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn load(&self, _markup: &str, _origin: &str) -> Result<(), SandboxError> {
        if !self.factory.load_delay.is_zero() {
            tokio::time::sleep(self.factory.load_delay).await;
        }
        match &self.factory.load_error {
            Some(message) => Err(SandboxError::Load(message.clone())),
            None => Ok(()),
        }
    }

    async fn element_count(&self) -> Result<usize, SandboxError> {
        Ok(self.factory.element_count)
    }

    async fn launch_engine(&self, options: &EngineOptions) -> Result<(), SandboxError> {
        self.factory.counters.launches.fetch_add(1, Ordering::SeqCst);
        self.launched.store(1, Ordering::SeqCst);
        *self.factory.counters.last_options.lock().unwrap() = Some(options.clone());
        Ok(())
    }

    async fn poll_sentinels(&self) -> Result<SentinelState, SandboxError> {
        if self.launched.load(Ordering::SeqCst) == 0 {
            return Ok(SentinelState::Pending);
        }
        let n = self.factory.counters.probes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(match &self.factory.engine {
            EngineBehavior::ResolveAfter(after, json) if n >= *after => {
                SentinelState::Resolved(json.clone())
            }
            EngineBehavior::FailAfter(after, message) if n >= *after => {
                SentinelState::Failed(message.clone())
            }
            _ => SentinelState::Pending,
        })
    }

    async fn teardown(&mut self) {
        self.factory.counters.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct FakeProbe(pub Arc<AtomicU64>);

impl FakeProbe {
    pub fn set_mb(&self, mb: u64) {
        self.0.store(mb * MIB, Ordering::SeqCst);
    }
}

impl MemoryProbe for FakeProbe {
    fn usage_bytes(&self) -> io::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Clone, Default)]
pub struct CountingReclaimer(pub Arc<AtomicUsize>);

impl Reclaimer for CountingReclaimer {
    fn reclaim(&self) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst);
        true
    }
}

pub fn governor(
    config: &MemoryConfig,
    probe: &FakeProbe,
    reclaimer: &CountingReclaimer,
) -> Arc<ResourceGovernor> {
    let governor = Arc::new(ResourceGovernor::new(
        config.clone(),
        Box::new(probe.clone()),
        Box::new(reclaimer.clone()),
    ));
    governor.sample();
    governor
}

/// Everything a scenario needs to assert on
pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub fetch_calls: Arc<AtomicUsize>,
    pub sandboxes: SandboxCounters,
    pub probe: FakeProbe,
    pub reclaims: CountingReclaimer,
    pub governor: Arc<ResourceGovernor>,
}

pub fn harness(
    config: PipelineConfig,
    fetch: FetchBehavior,
    factory: FakeSandboxFactory,
    memory_mb: u64,
) -> Harness {
    let probe = FakeProbe::default();
    probe.set_mb(memory_mb);
    let reclaims = CountingReclaimer::default();
    let governor = governor(&config.memory, &probe, &reclaims);

    let fetcher = ScriptedFetcher::new(fetch);
    let fetch_calls = fetcher.calls.clone();
    let sandboxes = factory.counters.clone();

    let pipeline = Pipeline::new(
        Arc::new(config),
        Arc::new(fetcher),
        Arc::new(factory),
        governor.clone(),
    );

    Harness {
        pipeline: Arc::new(pipeline),
        fetch_calls,
        sandboxes,
        probe,
        reclaims,
        governor,
    }
}
