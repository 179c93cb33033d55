//! runbox: a sandboxed program-execution service core.
//!
//! Accepts batches of commands, stages their inputs into isolated
//! filesystems, runs each one inside Linux namespaces under cgroup, rlimit
//! and seccomp enforcement, and returns structured verdicts together with
//! collected streams and produced files.

pub mod cancel;
pub mod cgroup;
pub mod config;
pub mod env;
pub mod envexec;
pub mod error;
pub mod filestore;
pub mod mount;
pub mod seccomp;
pub mod service;
pub mod wire;
pub mod worker;

pub use config::Config;
pub use envexec::{Cmd, CmdResult, Limit, Request, Response, Status};
pub use error::{Error, Result};
pub use service::Service;
pub use worker::Worker;
