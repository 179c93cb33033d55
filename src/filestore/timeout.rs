//! TTL eviction wrapper over any file store.

use super::{FileStore, StoreFile};
use crate::error::Result;
use crossbeam_channel::{bounded, Sender};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Wraps a store and deletes entries `ttl` after insertion. A sweeper
/// thread GCs expired IDs every 15 seconds until `shutdown`.
pub struct TimeoutStore {
    inner: Arc<dyn FileStore>,
    deadlines: Arc<Mutex<HashMap<String, Instant>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stop: Sender<()>,
    ttl: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn FileStore>, ttl: Duration) -> Self {
        let deadlines: Arc<Mutex<HashMap<String, Instant>>> = Arc::new(Mutex::new(HashMap::new()));
        let (stop, stop_rx) = bounded::<()>(1);
        let sweeper = {
            let inner = Arc::clone(&inner);
            let deadlines = Arc::clone(&deadlines);
            std::thread::spawn(move || loop {
                // A disconnect or an explicit send both end the sweeper.
                if stop_rx.recv_timeout(SWEEP_INTERVAL) != Err(crossbeam_channel::RecvTimeoutError::Timeout) {
                    break;
                }
                let now = Instant::now();
                let expired: Vec<String> = {
                    let map = deadlines.lock().unwrap();
                    map.iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(id, _)| id.clone())
                        .collect()
                };
                for id in expired {
                    deadlines.lock().unwrap().remove(&id);
                    if inner.remove(&id) {
                        log::debug!("file store GC expired id {id}");
                    }
                }
            })
        };
        Self {
            inner,
            deadlines,
            sweeper: Mutex::new(Some(sweeper)),
            stop,
            ttl,
        }
    }

    /// Stop the sweeper thread. Entries already stored stay until removed.
    pub fn shutdown(&self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl FileStore for TimeoutStore {
    fn add(&self, name: &str, path: &Path) -> Result<String> {
        let id = self.inner.add(name, path)?;
        self.deadlines
            .lock()
            .unwrap()
            .insert(id.clone(), Instant::now() + self.ttl);
        Ok(id)
    }

    fn get(&self, id: &str) -> Option<StoreFile> {
        self.inner.get(id)
    }

    fn remove(&self, id: &str) -> bool {
        self.deadlines.lock().unwrap().remove(id);
        self.inner.remove(id)
    }

    fn list(&self) -> HashMap<String, String> {
        self.inner.list()
    }

    fn new_file(&self) -> Result<NamedTempFile> {
        self.inner.new_file()
    }
}

impl Drop for TimeoutStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::LocalStore;

    #[test]
    fn test_wrapper_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let inner: Arc<dyn FileStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        let store = TimeoutStore::new(inner, Duration::from_secs(300));

        let scratch = store.new_file().unwrap();
        let (_f, path) = scratch.keep().unwrap();
        let id = store.add("data", &path).unwrap();
        assert!(store.get(&id).is_some());
        assert_eq!(store.list().len(), 1);
        assert!(store.remove(&id));
        assert!(store.deadlines.lock().unwrap().is_empty());
        store.shutdown();
    }

    #[test]
    fn test_deadline_recorded_per_add() {
        let dir = tempfile::tempdir().unwrap();
        let inner: Arc<dyn FileStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        let store = TimeoutStore::new(inner, Duration::from_millis(10));
        let scratch = store.new_file().unwrap();
        let (_f, path) = scratch.keep().unwrap();
        let id = store.add("data", &path).unwrap();
        assert!(store.deadlines.lock().unwrap().contains_key(&id));
        store.shutdown();
    }
}
