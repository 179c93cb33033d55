//! Core execution model: commands, limits, file slots and verdicts.
//!
//! These are the internal types the worker schedules and the engine runs;
//! the wire layer converts the external JSON form into them.

pub mod file;
pub mod run;

pub use file::Fd;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Terminal per-command verdict.
///
/// The engine produces the subset documented on each variant; the
/// judgement-side variants exist so external layers can reuse the enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Accepted,
    WrongAnswer,
    PartiallyCorrect,
    MemoryLimitExceeded,
    TimeLimitExceeded,
    OutputLimitExceeded,
    FileError,
    NonzeroExitStatus,
    Signalled,
    DangerousSyscall,
    JudgementFailed,
    InvalidRequest,
    InternalError,
    Cancelled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Accepted => "Accepted",
            Status::WrongAnswer => "WrongAnswer",
            Status::PartiallyCorrect => "PartiallyCorrect",
            Status::MemoryLimitExceeded => "MemoryLimitExceeded",
            Status::TimeLimitExceeded => "TimeLimitExceeded",
            Status::OutputLimitExceeded => "OutputLimitExceeded",
            Status::FileError => "FileError",
            Status::NonzeroExitStatus => "NonzeroExitStatus",
            Status::Signalled => "Signalled",
            Status::DangerousSyscall => "DangerousSyscall",
            Status::JudgementFailed => "JudgementFailed",
            Status::InvalidRequest => "InvalidRequest",
            Status::InternalError => "InternalError",
            Status::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-command resource limits.
#[derive(Clone, Debug)]
pub struct Limit {
    pub wall_time: Duration,
    pub cpu_time: Duration,
    /// Memory limit in bytes enforced by the cgroup (and rlimit-data when
    /// `strict_memory` is set or no cgroup is available).
    pub memory: u64,
    pub stack: u64,
    /// Largest file the command may produce (rlimit-fsize).
    pub output: u64,
    /// Largest file the engine will copy back out.
    pub copy_out: u64,
    pub open_file: u64,
    pub proc: u64,
    pub cpu_set: Option<String>,
    /// Percent of one CPU (100.0 = one full core).
    pub cpu_rate: Option<f64>,
    pub strict_memory: bool,
}

/// Source of one staged input file.
#[derive(Clone, Debug)]
pub enum FileSource {
    /// Inline bytes written into the work directory.
    Memory(Vec<u8>),
    /// File-store reference: either an existing store ID or the
    /// `copy_out_cached` name of an earlier command in the same request.
    Cached(String),
    /// Hard link (copy fallback) from a host path.
    Link(PathBuf),
    /// Symlink created in the work directory pointing at the given target.
    Symlink(PathBuf),
}

/// One child file descriptor slot; index in `Cmd::files` is the fd number.
#[derive(Debug)]
pub enum FileSlot {
    /// `/dev/null`. Also the wire placeholder a pipe mapping attaches to.
    Null,
    /// Literal content fed to the child through a memfd.
    Memory(Vec<u8>),
    /// Host file opened read-only for the child.
    Host(PathBuf),
    /// OS pipe drained by a byte-capped collector thread.
    Collector { name: String, max: u64 },
    /// Pre-opened endpoint of a pipe mapping, injected by the planner.
    Pipe(Fd),
}

/// One command of a request.
#[derive(Debug)]
pub struct Cmd {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub files: Vec<FileSlot>,
    pub copy_in: HashMap<String, FileSource>,
    /// Names to materialise into the response; a trailing `?` marks the
    /// entry optional.
    pub copy_out: Vec<String>,
    pub copy_out_cached: Vec<String>,
    pub copy_out_dir: Option<PathBuf>,
    pub limit: Limit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipeEndpoint {
    pub index: usize,
    pub fd: usize,
}

#[derive(Clone, Debug)]
pub struct PipeMapping {
    pub src: PipeEndpoint,
    pub dst: PipeEndpoint,
    /// Maximum relayed bytes; `None` streams without a proxy and zero
    /// relays nothing at all.
    pub max: Option<u64>,
}

#[derive(Debug)]
pub struct Request {
    pub request_id: String,
    pub cmds: Vec<Cmd>,
    pub pipe_mapping: Vec<PipeMapping>,
}

/// Result of one command.
#[derive(Clone, Debug, Default)]
pub struct CmdResult {
    pub status: Option<Status>,
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory: u64,
    pub procs: u64,
    pub files: HashMap<String, Vec<u8>>,
    pub file_ids: HashMap<String, String>,
    pub truncated: HashSet<String>,
    pub error: Option<String>,
}

impl CmdResult {
    pub fn status(&self) -> Status {
        self.status.unwrap_or(Status::InternalError)
    }

    pub fn from_status(status: Status, error: Option<String>) -> Self {
        CmdResult {
            status: Some(status),
            error,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct Response {
    pub request_id: String,
    pub results: Vec<CmdResult>,
    pub error: Option<String>,
}

/// Reject a copy-in name that could escape the work directory.
pub fn check_rel_path(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return false;
    }
    path.components()
        .all(|c| matches!(c, std::path::Component::Normal(_)))
}

impl Request {
    /// Check the model invariants before anything launches. A violation
    /// rejects the whole request.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (i, cmd) in self.cmds.iter().enumerate() {
            if cmd.args.is_empty() {
                return Err(format!("cmd {i}: empty argv"));
            }
            for name in cmd.copy_in.keys() {
                if !check_rel_path(name) {
                    return Err(format!("cmd {i}: copyIn path {name:?} is not a clean relative path"));
                }
            }
            let l = &cmd.limit;
            if l.memory == 0 || l.cpu_time.is_zero() || l.proc == 0 {
                return Err(format!("cmd {i}: memory, cpu and proc limits must be positive"));
            }
        }
        let mut seen_dst = HashSet::new();
        for (i, p) in self.pipe_mapping.iter().enumerate() {
            for (end, what) in [(&p.src, "in"), (&p.dst, "out")] {
                let cmd = self
                    .cmds
                    .get(end.index)
                    .ok_or_else(|| format!("pipe {i}: {what} index {} out of range", end.index))?;
                match cmd.files.get(end.fd) {
                    None | Some(FileSlot::Null) => {}
                    Some(_) => {
                        return Err(format!(
                            "pipe {i}: {what} endpoint ({}, {}) does not reference a pipe slot",
                            end.index, end.fd
                        ))
                    }
                }
            }
            if !seen_dst.insert(p.dst) {
                return Err(format!(
                    "pipe {i}: duplicate destination endpoint ({}, {})",
                    p.dst.index, p.dst.fd
                ));
            }
        }
        Ok(())
    }
}
