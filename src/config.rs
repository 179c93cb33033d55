//! Server configuration loaded from `ES_*` environment variables.

use crate::error::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

const KB: u64 = 1 << 10;
const MB: u64 = 1 << 20;

/// Runtime configuration for the executor service.
///
/// `http_addr` and `auth_token` are pass-through values consumed by the
/// HTTP layer mounted on top of this crate; the core itself never reads them.
#[derive(Clone, Debug, Serialize)]
pub struct Config {
    /// Staging directory for the file store. `None` means create a fresh
    /// temporary directory and remove it on shutdown.
    pub dir: Option<PathBuf>,
    pub http_addr: String,
    pub auth_token: String,
    /// Number of worker loops and the environment pool bound.
    pub parallelism: usize,
    /// Mount table config file; falls back to the built-in table if missing.
    pub mount_conf: PathBuf,
    /// Seccomp allow-list file; `None` installs no filter.
    pub seccomp_conf: Option<PathBuf>,
    pub cgroup_prefix: String,
    /// Default cpuset applied when a command does not request one.
    pub cpuset: Option<String>,
    #[serde(with = "millis")]
    pub time_limit_checker_interval: Duration,
    /// TTL for file-store entries; `None` keeps entries until removed.
    #[serde(with = "opt_millis")]
    pub file_timeout: Option<Duration>,
    /// Environments to pre-create at startup.
    pub prefork: usize,
    /// Share the host network namespace with sandboxed programs.
    pub net_share: bool,
    /// Required prefix for `src` file literals; `None` rejects them all.
    pub src_prefix: Option<PathBuf>,
    /// Slack added to the cgroup memory limit on top of the user limit.
    pub extra_memory_limit: u64,
    pub output_limit: u64,
    pub copy_out_limit: u64,
    pub open_file_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: None,
            http_addr: ":5050".to_string(),
            auth_token: String::new(),
            parallelism: 4,
            mount_conf: PathBuf::from("mount.json"),
            seccomp_conf: None,
            cgroup_prefix: "runbox".to_string(),
            cpuset: None,
            time_limit_checker_interval: Duration::from_millis(100),
            file_timeout: None,
            prefork: 0,
            net_share: false,
            src_prefix: None,
            extra_memory_limit: 16 * KB,
            output_limit: 256 * MB,
            copy_out_limit: 64 * MB,
            open_file_limit: 256,
        }
    }
}

impl Config {
    /// Load configuration from the environment, starting from defaults.
    pub fn from_env() -> Result<Self> {
        let mut conf = Config::default();
        if let Some(dir) = var("ES_DIR") {
            conf.dir = Some(PathBuf::from(dir));
        }
        if let Some(addr) = var("ES_HTTP_ADDR") {
            conf.http_addr = addr;
        }
        if let Some(token) = var("ES_AUTH_TOKEN") {
            conf.auth_token = token;
        }
        if let Some(n) = parse("ES_PARALLELISM")? {
            if n == 0 {
                return Err(Error::Config("ES_PARALLELISM must be positive".into()));
            }
            conf.parallelism = n;
        }
        if let Some(path) = var("ES_MOUNT_CONF") {
            conf.mount_conf = PathBuf::from(path);
        }
        if let Some(path) = var("ES_SECCOMP_CONF") {
            conf.seccomp_conf = Some(PathBuf::from(path));
        }
        if let Some(prefix) = var("ES_CGROUP_PREFIX") {
            conf.cgroup_prefix = prefix;
        }
        if let Some(cpuset) = var("ES_CPUSET") {
            conf.cpuset = Some(cpuset);
        }
        if let Some(ms) = parse("ES_TIMELIMIT_CHECKER_INTERVAL")? {
            conf.time_limit_checker_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>("ES_FILE_TIMEOUT")? {
            if secs > 0 {
                conf.file_timeout = Some(Duration::from_secs(secs));
            }
        }
        if let Some(n) = parse("ES_PREFORK")? {
            conf.prefork = n;
        }
        if let Some(v) = var("ES_NET_SHARE") {
            conf.net_share = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(prefix) = var("ES_SRC_PREFIX") {
            conf.src_prefix = Some(PathBuf::from(prefix));
        }
        if let Some(b) = parse("ES_EXTRA_MEMORY_LIMIT")? {
            conf.extra_memory_limit = b;
        }
        if let Some(b) = parse("ES_OUTPUT_LIMIT")? {
            conf.output_limit = b;
        }
        if let Some(b) = parse("ES_COPY_OUT_LIMIT")? {
            conf.copy_out_limit = b;
        }
        if let Some(n) = parse("ES_OPEN_FILE_LIMIT")? {
            conf.open_file_limit = n;
        }
        Ok(conf)
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match var(name) {
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("cannot parse {name}={v}"))),
        None => Ok(None),
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

mod opt_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.map(|d| d.as_millis() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = Config::default();
        assert_eq!(conf.parallelism, 4);
        assert_eq!(conf.time_limit_checker_interval, Duration::from_millis(100));
        assert_eq!(conf.output_limit, 256 * MB);
        assert_eq!(conf.copy_out_limit, 64 * MB);
        assert_eq!(conf.open_file_limit, 256);
        assert!(conf.file_timeout.is_none());
    }

    #[test]
    fn test_parse_helpers() {
        std::env::set_var("ES_TEST_PARSE_OK", "42");
        assert_eq!(parse::<u64>("ES_TEST_PARSE_OK").unwrap(), Some(42));
        std::env::set_var("ES_TEST_PARSE_BAD", "not-a-number");
        assert!(parse::<u64>("ES_TEST_PARSE_BAD").is_err());
        assert_eq!(parse::<u64>("ES_TEST_PARSE_MISSING").unwrap(), None);
    }
}
