//! Process-local artifact storage addressed by opaque IDs.

pub mod timeout;

pub use timeout::TimeoutStore;

use crate::error::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

const RAND_ID_BYTES: usize = 5;
const ID_RETRIES: usize = 50;
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// A stored artifact: original logical name plus its staged path.
#[derive(Clone, Debug)]
pub struct StoreFile {
    pub name: String,
    pub path: PathBuf,
}

/// Capability interface over artifact storage. Wrappers compose by
/// delegation; see [`TimeoutStore`].
pub trait FileStore: Send + Sync {
    /// Move (or copy) the file at `path` into the store under a fresh ID.
    fn add(&self, name: &str, path: &Path) -> Result<String>;
    fn get(&self, id: &str) -> Option<StoreFile>;
    /// Returns whether an entry existed.
    fn remove(&self, id: &str) -> bool;
    /// Snapshot of id -> original name.
    fn list(&self) -> HashMap<String, String>;
    /// A scratch file inside the store directory, to be filled and then
    /// passed to `add`.
    fn new_file(&self) -> Result<NamedTempFile>;
}

/// Directory-backed store; the in-memory index is serialised by one mutex.
pub struct LocalStore {
    dir: PathBuf,
    index: Mutex<HashMap<String, String>>,
}

fn generate_id() -> String {
    let mut raw = [0u8; RAND_ID_BYTES];
    OsRng.fill_bytes(&mut raw);
    // 5 bytes -> 8 base32 characters, no padding.
    let mut id = String::with_capacity(8);
    let mut acc: u64 = 0;
    for b in raw {
        acc = acc << 8 | b as u64;
    }
    for shift in (0..8).rev() {
        let idx = (acc >> (shift * 5)) & 0x1f;
        id.push(BASE32_ALPHABET[idx as usize] as char);
    }
    id
}

impl LocalStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::FileStore(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            index: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

impl FileStore for LocalStore {
    fn add(&self, name: &str, path: &Path) -> Result<String> {
        let mut index = self.index.lock().unwrap();
        let mut id = None;
        for _ in 0..ID_RETRIES {
            let candidate = generate_id();
            if !index.contains_key(&candidate) {
                id = Some(candidate);
                break;
            }
        }
        let id = id.ok_or_else(|| {
            Error::FileStore(format!("no unique id after {ID_RETRIES} attempts"))
        })?;
        let target = self.entry_path(&id);
        if let Err(rename_err) = std::fs::rename(path, &target) {
            // Cross-device staging: copy, then drop the source.
            std::fs::copy(path, &target).map_err(|e| {
                Error::FileStore(format!(
                    "stage {} into store: rename: {rename_err}, copy: {e}",
                    path.display()
                ))
            })?;
            let _ = std::fs::remove_file(path);
        }
        index.insert(id.clone(), name.to_string());
        Ok(id)
    }

    fn get(&self, id: &str) -> Option<StoreFile> {
        let index = self.index.lock().unwrap();
        index.get(id).map(|name| StoreFile {
            name: name.clone(),
            path: self.entry_path(id),
        })
    }

    fn remove(&self, id: &str) -> bool {
        let mut index = self.index.lock().unwrap();
        match index.remove(id) {
            Some(_) => {
                if let Err(e) = std::fs::remove_file(self.entry_path(id)) {
                    log::warn!("remove store file {id}: {e}");
                }
                true
            }
            None => false,
        }
    }

    fn list(&self) -> HashMap<String, String> {
        self.index.lock().unwrap().clone()
    }

    fn new_file(&self) -> Result<NamedTempFile> {
        NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::FileStore(format!("temp file in {}: {}", self.dir.display(), e)))
    }
}
