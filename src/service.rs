//! Wiring: staging directory, file store, environment pool and worker
//! assembled from one [`Config`].

use crate::config::Config;
use crate::env::{EnvPool, EnvironmentBuilder};
use crate::error::{Error, Result};
use crate::filestore::{FileStore, LocalStore, TimeoutStore};
use crate::wire::{parse_request, Converter, WireResponse};
use crate::worker::Worker;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Service {
    pub store: Arc<dyn FileStore>,
    pub worker: Worker,
    pub converter: Converter,
    dir: PathBuf,
    owns_dir: bool,
}

impl Service {
    pub fn boot(conf: Config) -> Result<Self> {
        let (dir, owns_dir) = match &conf.dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| Error::Config(format!("create {}: {}", dir.display(), e)))?;
                (dir.clone(), false)
            }
            None => {
                // Volatile staging area; prefer the shm tmpfs where present.
                let parent = if Path::new("/dev/shm").is_dir() {
                    Path::new("/dev/shm")
                } else {
                    Path::new("/tmp")
                };
                let dir = tempfile::Builder::new()
                    .prefix("runbox")
                    .tempdir_in(parent)
                    .map_err(|e| Error::Config(format!("create staging dir: {e}")))?
                    .into_path();
                (dir, true)
            }
        };
        log::info!(
            "booting: dir={}, parallelism={}, tick={:?}",
            dir.display(),
            conf.parallelism,
            conf.time_limit_checker_interval
        );

        let local: Arc<dyn FileStore> = Arc::new(LocalStore::new(&dir.join("files"))?);
        let store: Arc<dyn FileStore> = match conf.file_timeout {
            Some(ttl) => Arc::new(TimeoutStore::new(local, ttl)),
            None => local,
        };

        let builder = EnvironmentBuilder::from_config(&conf, &dir.join("envs"))?;
        let pool = EnvPool::new(builder, conf.parallelism);
        if conf.prefork > 0 {
            log::info!("prefork {} environments", conf.prefork);
            pool.prefork(conf.prefork)?;
        }

        let worker = Worker::new(&conf, pool, Arc::clone(&store));
        let converter = Converter::new(conf, Arc::clone(&store));
        Ok(Self {
            store,
            worker,
            converter,
            dir,
            owns_dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parse, convert, execute and re-encode one wire request. Top-level
    /// failures land in the response `error` field.
    pub fn execute_json(&self, body: &str) -> WireResponse {
        let outcome = parse_request(body)
            .and_then(|wire| self.converter.request(wire))
            .and_then(|request| self.worker.execute(request));
        match outcome {
            Ok(response) => self.converter.response(response),
            Err(e) => WireResponse {
                request_id: String::new(),
                results: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }

    pub fn shutdown(self) {
        self.worker.shutdown();
        drop(self.store);
        if self.owns_dir {
            if let Err(e) = std::fs::remove_dir_all(&self.dir) {
                log::warn!("remove staging dir {}: {}", self.dir.display(), e);
            }
        }
    }
}
