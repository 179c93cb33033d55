//! External JSON wire form and conversion to the internal model.
//!
//! The wire schema is looser than the internal one: file literals are
//! tagged by their key shape, numeric limits may be absent, and limits are
//! nanosecond/byte integers. Conversion validates everything and fills the
//! gaps from the server defaults before the worker ever sees a request.

use crate::config::Config;
use crate::envexec::{
    Cmd, CmdResult, FileSlot, FileSource, Limit, PipeEndpoint, PipeMapping, Request, Response,
    Status,
};
use crate::error::{Error, Result};
use crate::filestore::FileStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRequest {
    #[serde(default)]
    pub request_id: String,
    pub cmd: Vec<WireCmd>,
    #[serde(default)]
    pub pipe_mapping: Vec<WirePipeMapping>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCmd {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Child fd table; `null` entries are /dev/null or pipe attach points.
    #[serde(default)]
    pub files: Vec<Option<WireFile>>,
    /// Nanoseconds of CPU time.
    pub cpu_limit: u64,
    /// Nanoseconds of wall time; defaults to twice the CPU limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_cpu_limit: Option<u64>,
    pub memory_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_limit: Option<u64>,
    pub proc_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_set: Option<String>,
    #[serde(default)]
    pub strict_memory_limit: bool,
    #[serde(default)]
    pub copy_in: HashMap<String, WireFile>,
    #[serde(default)]
    pub copy_out: Vec<String>,
    #[serde(default)]
    pub copy_out_cached: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_out_dir: Option<String>,
}

/// Exactly one of the tagged literal shapes from the wire schema.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WireFile {
    Content {
        content: String,
    },
    Cached {
        #[serde(rename = "fileId")]
        file_id: String,
    },
    Collector {
        name: String,
        max: i64,
    },
    Src {
        src: String,
    },
    Symlink {
        symlink: String,
    },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WireEndpoint {
    pub index: usize,
    pub fd: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WirePipeMapping {
    #[serde(rename = "in")]
    pub input: WireEndpoint,
    pub out: WireEndpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResult {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub exit_status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// CPU time in nanoseconds.
    pub time: u64,
    /// Wall time in nanoseconds.
    pub run_time: u64,
    /// Peak memory in bytes.
    pub memory: u64,
    pub proc_peak: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub files: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub file_ids: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncated: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    pub request_id: String,
    pub results: Vec<WireResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn parse_request(body: &str) -> Result<WireRequest> {
    serde_json::from_str(body).map_err(|e| Error::InvalidRequest(e.to_string()))
}

/// Converts wire requests into internal ones and back, applying the server
/// defaults and dereferencing file-store IDs.
pub struct Converter {
    conf: Config,
    store: Arc<dyn FileStore>,
}

impl Converter {
    pub fn new(conf: Config, store: Arc<dyn FileStore>) -> Self {
        Self { conf, store }
    }

    pub fn request(&self, wire: WireRequest) -> Result<Request> {
        if wire.cmd.is_empty() {
            return Err(Error::InvalidRequest("request has no commands".to_string()));
        }
        let cmds = wire
            .cmd
            .into_iter()
            .enumerate()
            .map(|(i, cmd)| {
                self.cmd(cmd)
                    .map_err(|e| Error::InvalidRequest(format!("cmd {i}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let pipe_mapping = wire
            .pipe_mapping
            .into_iter()
            .map(|m| PipeMapping {
                src: PipeEndpoint {
                    index: m.input.index,
                    fd: m.input.fd,
                },
                dst: PipeEndpoint {
                    index: m.out.index,
                    fd: m.out.fd,
                },
                max: m.max,
            })
            .collect();
        let request = Request {
            request_id: wire.request_id,
            cmds,
            pipe_mapping,
        };
        request.validate().map_err(Error::InvalidRequest)?;
        Ok(request)
    }

    fn cmd(&self, wire: WireCmd) -> Result<Cmd> {
        let mut files = Vec::with_capacity(wire.files.len());
        for (fd, slot) in wire.files.into_iter().enumerate() {
            let slot = match slot {
                None => FileSlot::Null,
                Some(WireFile::Content { content }) => FileSlot::Memory(content.into_bytes()),
                Some(WireFile::Collector { name, max }) => {
                    if max < 0 {
                        return Err(Error::InvalidRequest(format!(
                            "files[{fd}]: negative collector max"
                        )));
                    }
                    FileSlot::Collector {
                        name,
                        max: max as u64,
                    }
                }
                Some(WireFile::Cached { file_id }) => {
                    let entry = self.store.get(&file_id).ok_or_else(|| {
                        Error::InvalidRequest(format!("files[{fd}]: file id {file_id} not found"))
                    })?;
                    FileSlot::Host(entry.path)
                }
                Some(WireFile::Src { src }) => FileSlot::Host(self.checked_src(&src)?),
                Some(WireFile::Symlink { .. }) => {
                    return Err(Error::InvalidRequest(format!(
                        "files[{fd}]: symlink is only valid in copyIn"
                    )))
                }
            };
            files.push(slot);
        }

        let mut copy_in = HashMap::with_capacity(wire.copy_in.len());
        for (name, literal) in wire.copy_in {
            let source = match literal {
                WireFile::Content { content } => FileSource::Memory(content.into_bytes()),
                WireFile::Cached { file_id } => FileSource::Cached(file_id),
                WireFile::Src { src } => FileSource::Link(self.checked_src(&src)?),
                WireFile::Symlink { symlink } => FileSource::Symlink(PathBuf::from(symlink)),
                WireFile::Collector { .. } => {
                    return Err(Error::InvalidRequest(format!(
                        "copyIn {name:?}: collectors are not an input kind"
                    )))
                }
            };
            copy_in.insert(name, source);
        }

        let cpu_time = Duration::from_nanos(wire.cpu_limit);
        let wall_time = wire
            .real_cpu_limit
            .map(Duration::from_nanos)
            .unwrap_or_else(|| cpu_time.saturating_mul(2));

        Ok(Cmd {
            args: wire.args,
            env: wire.env,
            files,
            copy_in,
            copy_out: wire.copy_out,
            copy_out_cached: wire.copy_out_cached,
            copy_out_dir: wire.copy_out_dir.map(PathBuf::from),
            limit: Limit {
                wall_time,
                cpu_time,
                memory: wire.memory_limit,
                stack: wire.stack_limit.unwrap_or(wire.memory_limit),
                output: self.conf.output_limit,
                copy_out: self.conf.copy_out_limit,
                open_file: self.conf.open_file_limit,
                proc: wire.proc_limit,
                cpu_set: wire.cpu_set,
                cpu_rate: wire.cpu_rate,
                strict_memory: wire.strict_memory_limit,
            },
        })
    }

    fn checked_src(&self, src: &str) -> Result<PathBuf> {
        let prefix = self
            .conf
            .src_prefix
            .as_deref()
            .ok_or_else(|| Error::InvalidRequest("src literals are disabled".to_string()))?;
        let path = Path::new(src);
        if !path.starts_with(prefix) {
            return Err(Error::InvalidRequest(format!(
                "src {src:?} escapes the allowed prefix"
            )));
        }
        Ok(path.to_path_buf())
    }

    pub fn response(&self, response: Response) -> WireResponse {
        WireResponse {
            request_id: response.request_id,
            results: response.results.into_iter().map(result_to_wire).collect(),
            error: response.error,
        }
    }
}

fn result_to_wire(result: CmdResult) -> WireResult {
    WireResult {
        status: result.status(),
        error: result.error.clone(),
        exit_status: result.exit_code,
        signal: result.signal,
        time: result.cpu_time.as_nanos() as u64,
        run_time: result.wall_time.as_nanos() as u64,
        memory: result.memory,
        proc_peak: result.procs,
        files: result
            .files
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect(),
        file_ids: result.file_ids,
        truncated: result.truncated.into_iter().collect(),
    }
}
