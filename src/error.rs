/// Crate-wide error types.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("File store error: {0}")]
    FileStore(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Worker is shut down")]
    WorkerStopped,
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Process(err.to_string())
    }
}

/// Result type alias for runbox operations.
pub type Result<T> = std::result::Result<T, Error>;
