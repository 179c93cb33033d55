//! Cgroup v1 (split hierarchies) backend.

use super::{read_u64, write_tolerant, CgroupController};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const BASE: &str = "/sys/fs/cgroup";
const CFS_PERIOD_US: u64 = 100_000;

const CONTROLLERS: &[&str] = &["cpuacct", "cpu", "cpuset", "memory", "pids"];

pub struct CgroupV1 {
    /// controller name -> subtree path, for controllers present on the host.
    paths: Vec<(&'static str, PathBuf)>,
    procs_sampled: AtomicU64,
}

impl CgroupV1 {
    pub fn create(prefix: &str, name: &str) -> Result<Self> {
        let mut paths = Vec::new();
        for controller in CONTROLLERS {
            let root = Path::new(BASE).join(controller);
            if !root.exists() {
                continue;
            }
            let path = root.join(prefix).join(name);
            match std::fs::create_dir_all(&path) {
                Ok(()) => {
                    if *controller == "cpuset" {
                        inherit_cpuset_defaults(&root, &path);
                    }
                    paths.push((*controller, path));
                }
                Err(e) => log::warn!("create {}: {}", path.display(), e),
            }
        }
        if paths.is_empty() {
            return Err(Error::Cgroup("no v1 controller could be created".to_string()));
        }
        Ok(Self {
            paths,
            procs_sampled: AtomicU64::new(0),
        })
    }

    fn controller(&self, name: &str) -> Option<&Path> {
        self.paths
            .iter()
            .find(|(c, _)| *c == name)
            .map(|(_, p)| p.as_path())
    }

    fn write(&self, controller: &str, file: &str, value: &str) -> Result<()> {
        match self.controller(controller) {
            Some(path) => write_tolerant(&path.join(file), value),
            None => {
                log::warn!("cgroup v1 controller {} not mounted, {} not applied", controller, file);
                Ok(())
            }
        }
    }
}

/// A fresh cpuset group starts empty; tasks cannot be attached until
/// `cpuset.cpus` and `cpuset.mems` hold values, so copy the root's.
fn inherit_cpuset_defaults(root: &Path, path: &Path) {
    for file in ["cpuset.cpus", "cpuset.mems"] {
        if let Ok(value) = std::fs::read_to_string(root.join(file)) {
            if let Err(e) = std::fs::write(path.join(file), value.trim()) {
                log::warn!("seed {} in {}: {}", file, path.display(), e);
            }
        }
    }
}

impl CgroupController for CgroupV1 {
    fn set_cpuset(&self, cpuset: &str) -> Result<()> {
        self.write("cpuset", "cpuset.cpus", cpuset)
    }

    fn set_cpu_rate(&self, percent: f64) -> Result<()> {
        let quota = ((CFS_PERIOD_US as f64 * percent / 100.0) as u64).max(1000);
        self.write("cpu", "cpu.cfs_period_us", &CFS_PERIOD_US.to_string())?;
        self.write("cpu", "cpu.cfs_quota_us", &quota.to_string())
    }

    fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        self.write("memory", "memory.limit_in_bytes", &bytes.to_string())?;
        self.write("memory", "memory.memsw.limit_in_bytes", &bytes.to_string())
    }

    fn set_proc_limit(&self, n: u64) -> Result<()> {
        self.write("pids", "pids.max", &n.to_string())
    }

    fn add_proc(&self, pid: i32) -> Result<()> {
        let text = pid.to_string();
        for (controller, path) in &self.paths {
            std::fs::write(path.join("tasks"), &text).map_err(|e| {
                Error::Cgroup(format!("attach pid {} to {} tasks: {}", pid, controller, e))
            })?;
        }
        Ok(())
    }

    fn cpu_usage(&self) -> Result<Duration> {
        let path = self
            .controller("cpuacct")
            .ok_or_else(|| Error::Cgroup("cpuacct controller not mounted".to_string()))?;
        read_u64(&path.join("cpuacct.usage")).map(Duration::from_nanos)
    }

    fn memory_max_usage(&self) -> Result<u64> {
        let path = self
            .controller("memory")
            .ok_or_else(|| Error::Cgroup("memory controller not mounted".to_string()))?;
        read_u64(&path.join("memory.max_usage_in_bytes"))
    }

    fn procs_peak(&self) -> Result<u64> {
        Ok(self.procs_sampled.load(Ordering::Relaxed))
    }

    fn sample(&self) {
        if let Some(path) = self.controller("pids") {
            if let Ok(current) = read_u64(&path.join("pids.current")) {
                self.procs_sampled.fetch_max(current, Ordering::Relaxed);
            }
        }
    }

    fn oom_killed(&self) -> bool {
        if let Some(path) = self.controller("memory") {
            if let Some(count) = super::read_flat_keyed(&path.join("memory.oom_control"), "oom_kill")
            {
                return count > 0;
            }
        }
        false
    }

    fn reset(&self) -> Result<()> {
        for (controller, path) in &self.paths {
            std::fs::remove_dir(path)
                .map_err(|e| Error::Cgroup(format!("remove {} subtree: {}", controller, e)))?;
            std::fs::create_dir_all(path)
                .map_err(|e| Error::Cgroup(format!("recreate {} subtree: {}", controller, e)))?;
            if *controller == "cpuset" {
                inherit_cpuset_defaults(&Path::new(BASE).join(controller), path);
            }
        }
        self.procs_sampled.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        for (controller, path) in &self.paths {
            match std::fs::remove_dir(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::Cgroup(format!("remove {} subtree: {}", controller, e)))
                }
            }
        }
        Ok(())
    }
}

impl Drop for CgroupV1 {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            log::warn!("cgroup cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_requires_v1_host() {
        if Path::new(BASE).join("memory").exists() && unsafe { libc::geteuid() } == 0 {
            let cg = CgroupV1::create("runbox-test", "v1-create").unwrap();
            assert!(!cg.paths.is_empty());
            cg.destroy().unwrap();
        } else {
            assert!(CgroupV1::create("runbox-test", "v1-create").is_err());
        }
    }
}
