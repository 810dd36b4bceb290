//! Process memory pressure.
//!
//! Pressure is resident memory divided by a limit. The limit is the configured
//! one, else the container limit (cgroup v2 `memory.max`, then cgroup v1
//! `memory/memory.limit_in_bytes`), else total system memory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Where the memory limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitSource {
    Configured,
    CgroupV2,
    CgroupV1,
    System,
}

/// One memory sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub rss_bytes: u64,
    pub limit_bytes: u64,
    /// `rss_bytes / limit_bytes`, clamped to 0..=1
    pub ratio: f64,
    pub limit_source: LimitSource,
}

impl MemoryUsage {
    fn new(rss_bytes: u64, limit_bytes: u64, limit_source: LimitSource) -> Self {
        let ratio = if limit_bytes == 0 {
            0.0
        } else {
            (rss_bytes as f64 / limit_bytes as f64).clamp(0.0, 1.0)
        };
        Self {
            rss_bytes,
            limit_bytes,
            ratio,
            limit_source,
        }
    }
}

/// Samples the resident memory of this process.
pub struct MemoryMonitor {
    system: Mutex<System>,
    pid: Option<Pid>,
    limit_bytes: u64,
    limit_source: LimitSource,
}

impl MemoryMonitor {
    pub fn new(configured_limit: Option<u64>) -> Self {
        Self::with_cgroup_root(configured_limit, Path::new(CGROUP_ROOT))
    }

    /// Like [`Self::new`] but discovers container limits under `cgroup_root`.
    pub fn with_cgroup_root(configured_limit: Option<u64>, cgroup_root: &Path) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let total = system.total_memory();

        let (limit_bytes, limit_source) = match configured_limit {
            Some(limit) if limit > 0 => (limit, LimitSource::Configured),
            _ => discover_limit(cgroup_root, total),
        };
        debug!(
            "Memory limit {} bytes from {:?}",
            limit_bytes, limit_source
        );

        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot determine own pid, memory pressure reads as 0: {}", e);
                None
            }
        };

        Self {
            system: Mutex::new(system),
            pid,
            limit_bytes,
            limit_source,
        }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub fn limit_source(&self) -> LimitSource {
        self.limit_source
    }

    /// Current usage of this process.
    pub fn sample(&self) -> MemoryUsage {
        let rss = self.pid.map_or(0, |pid| {
            let mut system = match self.system.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            system.process(pid).map_or(0, |process| process.memory())
        });
        MemoryUsage::new(rss, self.limit_bytes, self.limit_source)
    }
}

/// Container limit from cgroup files, falling back to `total_memory`.
///
/// Values at or above the machine total mean "unlimited".
pub fn discover_limit(cgroup_root: &Path, total_memory: u64) -> (u64, LimitSource) {
    let candidates: [(PathBuf, LimitSource); 2] = [
        (cgroup_root.join("memory.max"), LimitSource::CgroupV2),
        (
            cgroup_root.join("memory").join("memory.limit_in_bytes"),
            LimitSource::CgroupV1,
        ),
    ];

    for (path, source) in candidates {
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let value = content.trim();
        if value == "max" {
            continue;
        }
        match value.parse::<u64>() {
            Ok(limit) if limit > 0 && (total_memory == 0 || limit < total_memory) => {
                return (limit, source);
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring unreadable memory limit in {}: {}", path.display(), e),
        }
    }
    (total_memory, LimitSource::System)
}
