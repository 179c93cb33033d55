//! Handle to one sandboxed child process.

use crate::cgroup::CgroupGuard;
use crate::envexec::Fd;
use crossbeam_channel::Receiver;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Read;
use std::time::{Duration, Instant};

/// Raw wait outcome reported by the waiter thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    Signalled(i32),
}

/// Resource readings taken after the child is reaped.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessStats {
    pub cpu_time: Duration,
    pub memory_peak: u64,
    pub procs_peak: u64,
    pub oom_killed: bool,
}

pub struct Process {
    pub(crate) pid: Pid,
    /// Fires exactly once with the wait outcome.
    pub done: Receiver<WaitOutcome>,
    pub(crate) cgroup: Option<CgroupGuard>,
    pub(crate) err_pipe: Option<Fd>,
    pub(crate) waiter: Option<std::thread::JoinHandle<()>>,
    pub(crate) start: Instant,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn wall_elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// SIGKILL the child's process group; falls back to the child alone
    /// when the group signal is refused.
    pub fn kill(&self) {
        let raw = self.pid.as_raw();
        if unsafe { libc::kill(-raw, libc::SIGKILL) } != 0 {
            let _ = kill(self.pid, Signal::SIGKILL);
        }
    }

    /// Live cgroup CPU reading for the time-limit ticker; `None` without a
    /// cgroup (the rlimit-cpu backstop still applies).
    pub fn cpu_usage(&self) -> Option<Duration> {
        self.cgroup
            .as_ref()
            .and_then(|cg| cg.controller().cpu_usage().ok())
    }

    /// Refresh sampled peaks; called once per ticker interval.
    pub fn sample(&self) {
        if let Some(cg) = &self.cgroup {
            cg.controller().sample();
        }
    }

    /// Final usage readings. Call after `done` has fired.
    pub fn stats(&self) -> ProcessStats {
        match &self.cgroup {
            Some(cg) => {
                let c = cg.controller();
                ProcessStats {
                    cpu_time: c.cpu_usage().unwrap_or_default(),
                    memory_peak: c.memory_max_usage().unwrap_or(0),
                    procs_peak: c.procs_peak().unwrap_or(0),
                    oom_killed: c.oom_killed(),
                }
            }
            None => ProcessStats::default(),
        }
    }

    /// Drain the exec-error pipe. A successful exec closed it empty; bytes
    /// mean the child never reached user code.
    pub fn exec_error(&mut self) -> Option<String> {
        let fd = self.err_pipe.take()?;
        let mut file = unsafe {
            <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(fd.into_raw())
        };
        let mut buf = String::new();
        match file.read_to_string(&mut buf) {
            Ok(0) => None,
            Ok(_) => Some(buf),
            Err(_) => None,
        }
    }

    /// Join the waiter thread and release the cgroup back to its pool.
    /// Must follow a receive on `done`.
    pub fn finish(mut self) -> ProcessStats {
        let stats = self.stats();
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.join();
        }
        stats
    }
}
