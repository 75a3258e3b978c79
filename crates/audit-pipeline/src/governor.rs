//! Process-wide memory governor
//!
//! A background task samples memory usage at a fixed interval and publishes
//! a pressure level that requests read at admission. Admission uses
//! hysteresis: it closes at the critical threshold and only reopens once
//! usage falls back below the elevated threshold.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use shared_types::ErrorKind;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::error::PipelineError;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    Normal,
    Elevated,
    Critical,
}

impl Pressure {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Pressure::Normal,
            1 => Pressure::Elevated,
            _ => Pressure::Critical,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Pressure::Normal => 0,
            Pressure::Elevated => 1,
            Pressure::Critical => 2,
        }
    }
}

/// Source of the memory figure the governor acts on
pub trait MemoryProbe: Send + Sync {
    /// Current usage in bytes
    fn usage_bytes(&self) -> io::Result<u64>;
}

/// Returns memory to the operating system when asked
pub trait Reclaimer: Send + Sync {
    /// Returns true if anything was released
    fn reclaim(&self) -> bool;
}

/// Resident set size from `/proc`, optionally including descendant processes
///
/// The browser runs as child processes, so counting only this process
/// misses most of the memory a request costs.
#[derive(Debug, Clone, Copy)]
pub struct ProcMemoryProbe {
    pub include_children: bool,
}

impl Default for ProcMemoryProbe {
    fn default() -> Self {
        Self {
            include_children: true,
        }
    }
}

impl ProcMemoryProbe {
    fn page_size() -> u64 {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            4096
        }
    }

    fn resident_pages(pid: &str) -> io::Result<u64> {
        let statm = fs::read_to_string(format!("/proc/{}/statm", pid))?;
        parse_statm_resident(&statm)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed statm"))
    }

    fn descendants(root: u32) -> Vec<u32> {
        let mut parents: HashMap<u32, Vec<u32>> = HashMap::new();
        let entries = match fs::read_dir("/proc") {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) {
                if let Some(ppid) = parse_stat_ppid(&stat) {
                    parents.entry(ppid).or_default().push(pid);
                }
            }
        }

        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(pid) = stack.pop() {
            if let Some(children) = parents.get(&pid) {
                for &child in children {
                    out.push(child);
                    stack.push(child);
                }
            }
        }
        out
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn usage_bytes(&self) -> io::Result<u64> {
        let page = Self::page_size();
        let mut pages = Self::resident_pages("self")?;
        if self.include_children {
            for pid in Self::descendants(std::process::id()) {
                // Children can exit between listing and reading
                if let Ok(child) = Self::resident_pages(&pid.to_string()) {
                    pages += child;
                }
            }
        }
        Ok(pages * page)
    }
}

/// Second field of `/proc/<pid>/statm`
fn parse_statm_resident(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

/// Fourth field of `/proc/<pid>/stat`, after the parenthesised command name
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

/// Asks the allocator to return free heap pages
#[derive(Debug, Clone, Copy, Default)]
pub struct MallocTrim;

impl Reclaimer for MallocTrim {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn reclaim(&self) -> bool {
        // SAFETY: malloc_trim only walks allocator state
        unsafe { libc::malloc_trim(0) == 1 }
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn reclaim(&self) -> bool {
        false
    }
}

/// Snapshot reported by the health endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStatus {
    pub current_bytes: u64,
    pub peak_bytes: u64,
    pub current_mb: u64,
    pub peak_mb: u64,
    pub pressure: Pressure,
    pub admitting: bool,
    pub admitted: u64,
    pub refused: u64,
    pub samples: u64,
}

pub struct ResourceGovernor {
    config: MemoryConfig,
    probe: Box<dyn MemoryProbe>,
    reclaimer: Box<dyn Reclaimer>,
    current: AtomicU64,
    peak: AtomicU64,
    pressure: AtomicU8,
    admitting: AtomicBool,
    admitted: AtomicU64,
    refused: AtomicU64,
    samples: AtomicU64,
}

impl ResourceGovernor {
    pub fn new(
        config: MemoryConfig,
        probe: Box<dyn MemoryProbe>,
        reclaimer: Box<dyn Reclaimer>,
    ) -> Self {
        Self {
            config,
            probe,
            reclaimer,
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            pressure: AtomicU8::new(Pressure::Normal.as_u8()),
            admitting: AtomicBool::new(true),
            admitted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Governor over this process and its children, trimming the heap under pressure
    pub fn for_process(config: MemoryConfig) -> Arc<Self> {
        let governor = Arc::new(Self::new(
            config,
            Box::new(ProcMemoryProbe::default()),
            Box::new(MallocTrim),
        ));
        governor.sample();
        governor
    }

    /// Take one sample and update the published state
    pub fn sample(&self) -> Pressure {
        let usage = match self.probe.usage_bytes() {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Memory probe failed, keeping last sample: {}", e);
                return self.pressure();
            }
        };
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.current.store(usage, Ordering::Relaxed);
        self.peak.fetch_max(usage, Ordering::Relaxed);

        let pressure = self.classify(usage);
        let previous = Pressure::from_u8(self.pressure.swap(pressure.as_u8(), Ordering::Relaxed));

        match pressure {
            Pressure::Critical => {
                if self.admitting.swap(false, Ordering::Relaxed) {
                    warn!(
                        "Memory at {} MB is critical, refusing new requests",
                        usage / MIB
                    );
                }
            }
            Pressure::Normal => {
                if !self.admitting.swap(true, Ordering::Relaxed) {
                    info!("Memory back to {} MB, admitting requests", usage / MIB);
                }
            }
            Pressure::Elevated => {}
        }

        if pressure != previous {
            info!("Memory pressure {:?} -> {:?} ({} MB)", previous, pressure, usage / MIB);
        }
        if pressure != Pressure::Normal {
            let released = self.reclaimer.reclaim();
            debug!("Reclamation under {:?} pressure released memory: {}", pressure, released);
        }
        pressure
    }

    fn classify(&self, usage: u64) -> Pressure {
        if usage >= self.config.critical_bytes {
            Pressure::Critical
        } else if usage >= self.config.elevated_bytes {
            Pressure::Elevated
        } else {
            Pressure::Normal
        }
    }

    /// Run [`ResourceGovernor::sample`] on the configured interval
    pub fn spawn_sampler(self: &Arc<Self>) -> SamplerHandle {
        let governor = Arc::clone(self);
        let period = self.config.sample_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                governor.sample();
            }
        });
        debug!("Memory sampler started ({:?} interval)", period);
        SamplerHandle { handle }
    }

    /// Admission check against the last sample
    pub fn admit(&self) -> Result<(), PipelineError> {
        if self.admitting.load(Ordering::Relaxed) {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.refused.fetch_add(1, Ordering::Relaxed);
        let current = self.current.load(Ordering::Relaxed);
        Err(PipelineError::new(
            ErrorKind::MemoryExhausted,
            format!(
                "Server is low on memory ({} MB in use), request refused",
                current / MIB
            ),
        )
        .with_details(format!("{}MB", current / MIB)))
    }

    pub fn pressure(&self) -> Pressure {
        Pressure::from_u8(self.pressure.load(Ordering::Relaxed))
    }

    /// Ask for memory back outside the sampling schedule
    pub fn reclaim_hint(&self) -> bool {
        let released = self.reclaimer.reclaim();
        debug!("Reclamation hint released memory: {}", released);
        released
    }

    pub fn status(&self) -> MemoryStatus {
        let current = self.current.load(Ordering::Relaxed);
        let peak = self.peak.load(Ordering::Relaxed);
        MemoryStatus {
            current_bytes: current,
            peak_bytes: peak,
            current_mb: current / MIB,
            peak_mb: peak / MIB,
            pressure: self.pressure(),
            admitting: self.admitting.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
        }
    }
}

/// Stops the sampler task when dropped
pub struct SamplerHandle {
    handle: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.handle.abort();
        debug!("Memory sampler stopped");
    }
}
