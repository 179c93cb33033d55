//! Cgroup v2 (unified hierarchy) backend.

use super::{read_flat_keyed, read_u64, write_tolerant, CgroupController};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const BASE: &str = "/sys/fs/cgroup";
const CFS_PERIOD_US: u64 = 100_000;

pub struct CgroupV2 {
    path: PathBuf,
    memory_sampled: AtomicU64,
    procs_sampled: AtomicU64,
}

/// Delegate controllers to children of the prefix group. Failures are
/// tolerated: the affected limits simply do not apply on this host.
pub fn enable_subtree_controllers(prefix: &str) {
    let root = Path::new(BASE);
    let group = root.join(prefix);
    if let Err(e) = std::fs::create_dir_all(&group) {
        log::warn!("create cgroup group {}: {}", group.display(), e);
        return;
    }
    for dir in [root.to_path_buf(), group] {
        let control = dir.join("cgroup.subtree_control");
        if let Err(e) = std::fs::write(&control, "+cpu +cpuset +memory +pids") {
            log::warn!("enable controllers in {}: {}", control.display(), e);
        }
    }
}

impl CgroupV2 {
    pub fn create(prefix: &str, name: &str) -> Result<Self> {
        let path = Path::new(BASE).join(prefix).join(name);
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::Cgroup(format!("create {}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            memory_sampled: AtomicU64::new(0),
            procs_sampled: AtomicU64::new(0),
        })
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl CgroupController for CgroupV2 {
    fn set_cpuset(&self, cpuset: &str) -> Result<()> {
        write_tolerant(&self.file("cpuset.cpus"), cpuset)
    }

    fn set_cpu_rate(&self, percent: f64) -> Result<()> {
        let quota = (CFS_PERIOD_US as f64 * percent / 100.0) as u64;
        write_tolerant(&self.file("cpu.max"), &format!("{} {}", quota.max(1000), CFS_PERIOD_US))
    }

    fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        write_tolerant(&self.file("memory.max"), &bytes.to_string())?;
        // Swap would let the workload dodge the limit; zero it where present.
        write_tolerant(&self.file("memory.swap.max"), "0")
    }

    fn set_proc_limit(&self, n: u64) -> Result<()> {
        write_tolerant(&self.file("pids.max"), &n.to_string())
    }

    fn add_proc(&self, pid: i32) -> Result<()> {
        std::fs::write(self.file("cgroup.procs"), pid.to_string())
            .map_err(|e| Error::Cgroup(format!("attach pid {} to {}: {}", pid, self.path.display(), e)))
    }

    fn cpu_usage(&self) -> Result<Duration> {
        read_flat_keyed(&self.file("cpu.stat"), "usage_usec")
            .map(Duration::from_micros)
            .ok_or_else(|| Error::Cgroup("cpu.stat missing usage_usec".to_string()))
    }

    fn memory_max_usage(&self) -> Result<u64> {
        let peak = self.file("memory.peak");
        if peak.exists() {
            return read_u64(&peak);
        }
        Ok(self.memory_sampled.load(Ordering::Relaxed))
    }

    fn procs_peak(&self) -> Result<u64> {
        let peak = self.file("pids.peak");
        if peak.exists() {
            return read_u64(&peak);
        }
        Ok(self.procs_sampled.load(Ordering::Relaxed))
    }

    fn sample(&self) {
        if let Ok(current) = read_u64(&self.file("memory.current")) {
            self.memory_sampled.fetch_max(current, Ordering::Relaxed);
        }
        if let Ok(current) = read_u64(&self.file("pids.current")) {
            self.procs_sampled.fetch_max(current, Ordering::Relaxed);
        }
    }

    fn oom_killed(&self) -> bool {
        read_flat_keyed(&self.file("memory.events"), "oom_kill").unwrap_or(0) > 0
    }

    fn reset(&self) -> Result<()> {
        // Recreating the subtree clears peaks, events and stale limits in
        // one step.
        self.destroy()?;
        std::fs::create_dir_all(&self.path)
            .map_err(|e| Error::Cgroup(format!("recreate {}: {}", self.path.display(), e)))?;
        self.memory_sampled.store(0, Ordering::Relaxed);
        self.procs_sampled.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Cgroup(format!(
                "remove {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl Drop for CgroupV2 {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::warn!("cgroup cleanup failed: {}", e);
        }
    }
}
