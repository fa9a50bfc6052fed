//! Advisory memory governor.
//!
//! The guard samples process and system memory and asks registered
//! [`Reclaim`] implementors to give memory back. It never blocks and never
//! fails; the orchestrator decides what to do with its readings.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use crate::models::MemoryConfig;

/// Something that can hand memory back between batches.
pub trait Reclaim: Send + Sync {
    fn name(&self) -> &str;

    /// Release what can be released. Returns an implementation-defined
    /// count of units reclaimed, used only for logging.
    fn reclaim(&self) -> usize;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub process_resident_bytes: u64,
    pub system_percent: f32,
    pub available_bytes: u64,
}

impl std::fmt::Display for MemoryUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "process {:.1} MiB, system {:.1}%, available {:.1} MiB",
            self.process_resident_bytes as f64 / MIB,
            self.system_percent,
            self.available_bytes as f64 / MIB
        )
    }
}

const MIB: f64 = 1024.0 * 1024.0;

/// Source of memory readings.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> MemoryUsage;
}

/// Probe backed by the operating system.
pub struct SystemProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemProbe {
    fn sample(&self) -> MemoryUsage {
        let mut system = self.system.lock();
        system.refresh_memory();

        let process_resident_bytes = match self.pid {
            Some(pid) if system.refresh_process(pid) => {
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            _ => 0,
        };

        let total = system.total_memory();
        let available = system.available_memory();
        let system_percent = if total == 0 {
            0.0
        } else {
            (total.saturating_sub(available) as f64 / total as f64 * 100.0) as f32
        };

        MemoryUsage {
            process_resident_bytes,
            system_percent,
            available_bytes: available,
        }
    }
}

pub struct MemoryGuard {
    probe: Arc<dyn MemoryProbe>,
    max_percent: f32,
    release_passes: u32,
    reclaimers: RwLock<Vec<Arc<dyn Reclaim>>>,
    releases: AtomicU64,
}

impl MemoryGuard {
    pub fn new(config: &MemoryConfig) -> Self {
        Self::with_probe(config, Arc::new(SystemProbe::new()))
    }

    pub fn with_probe(config: &MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            probe,
            max_percent: config.max_percent,
            release_passes: config.release_passes.max(1),
            reclaimers: RwLock::new(Vec::new()),
            releases: AtomicU64::new(0),
        }
    }

    pub fn register(&self, reclaimer: Arc<dyn Reclaim>) {
        self.reclaimers.write().push(reclaimer);
    }

    pub fn usage(&self) -> MemoryUsage {
        self.probe.sample()
    }

    /// Sample system memory against the threshold. When over it and
    /// `force_collect` is set, run one release pass and log the new reading.
    /// The returned value always reflects the first sample.
    pub fn within_limit(&self, force_collect: bool) -> bool {
        let usage = self.usage();
        if usage.system_percent < self.max_percent {
            return true;
        }

        warn!(
            "Memory usage {:.1}% exceeds {:.1}% threshold ({})",
            usage.system_percent, self.max_percent, usage
        );

        if force_collect {
            self.release(false);
            info!("Memory after release: {}", self.usage());
        }
        false
    }

    /// Ask every registered reclaimer to release memory, once or, when
    /// `aggressive`, for the configured number of passes.
    pub fn release(&self, aggressive: bool) -> usize {
        let passes = if aggressive { self.release_passes } else { 1 };
        let reclaimers = self.reclaimers.read();
        let mut total = 0;
        for pass in 0..passes {
            for reclaimer in reclaimers.iter() {
                let reclaimed = reclaimer.reclaim();
                if reclaimed > 0 {
                    debug!(
                        "Release pass {}: {} reclaimed {}",
                        pass + 1,
                        reclaimer.name(),
                        reclaimed
                    );
                }
                total += reclaimed;
            }
        }
        self.releases.fetch_add(1, Ordering::Relaxed);
        total
    }

    pub fn log_usage(&self, label: &str) -> MemoryUsage {
        let usage = self.usage();
        info!("Memory {}: {}", label, usage);
        usage
    }

    /// Number of release calls made so far.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}
