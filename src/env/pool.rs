//! Bounded free-list of environments.

use super::{Environment, EnvironmentBuilder};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct PoolState {
    free: Vec<Environment>,
    live: usize,
    shutdown: bool,
}

pub struct EnvPool {
    builder: EnvironmentBuilder,
    parallelism: usize,
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Exclusive checkout of one environment. Dropping the guard resets the
/// environment and returns it to the free list; a failed reset destroys it
/// and frees the slot, so the pool replaces it lazily on the next `get`.
pub struct EnvGuard {
    env: Option<Environment>,
    pool: Arc<EnvPool>,
}

impl EnvPool {
    pub fn new(builder: EnvironmentBuilder, parallelism: usize) -> Arc<Self> {
        Arc::new(Self {
            builder,
            parallelism,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                live: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Check out an environment, creating one lazily while the live count
    /// is below the bound. Blocks until one frees up, the token cancels, or
    /// the pool shuts down. Ordering among waiters is not FIFO.
    pub fn get(self: &Arc<Self>, cancel: &CancelToken) -> Result<EnvGuard> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return Err(Error::Environment("environment pool is shut down".to_string()));
            }
            if cancel.is_cancelled() {
                return Err(Error::Environment("checkout cancelled".to_string()));
            }
            if let Some(env) = state.free.pop() {
                return Ok(EnvGuard {
                    env: Some(env),
                    pool: Arc::clone(self),
                });
            }
            if state.live < self.parallelism {
                state.live += 1;
                drop(state);
                match self.builder.build() {
                    Ok(env) => {
                        return Ok(EnvGuard {
                            env: Some(env),
                            pool: Arc::clone(self),
                        })
                    }
                    Err(e) => {
                        let mut state = self.state.lock().unwrap();
                        state.live -= 1;
                        self.cond.notify_one();
                        return Err(e);
                    }
                }
            }
            let (next, _) = self
                .cond
                .wait_timeout(state, Duration::from_millis(100))
                .unwrap();
            state = next;
        }
    }

    fn put(&self, env: Environment) {
        let mut state = self.state.lock().unwrap();
        if state.shutdown {
            state.live -= 1;
            drop(state);
            let _ = env.destroy();
            return;
        }
        match env.reset() {
            Ok(()) => state.free.push(env),
            Err(e) => {
                log::warn!("environment {} reset failed, destroying: {}", env.id(), e);
                state.live -= 1;
                drop(state);
                let _ = env.destroy();
                self.cond.notify_one();
                return;
            }
        }
        self.cond.notify_one();
    }

    /// Pre-create up to `n` environments by repeated get/put.
    pub fn prefork(self: &Arc<Self>, n: usize) -> Result<()> {
        let cancel = CancelToken::never();
        let mut held = Vec::new();
        for _ in 0..n.min(self.parallelism) {
            held.push(self.get(&cancel)?);
        }
        drop(held);
        Ok(())
    }

    /// Stop handing out environments and destroy the free list. In-flight
    /// checkouts are destroyed as they come back.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        let free = std::mem::take(&mut state.free);
        state.live -= free.len();
        drop(state);
        for env in free {
            let _ = env.destroy();
        }
        self.cond.notify_all();
    }
}

impl EnvGuard {
    pub fn env(&self) -> &Environment {
        self.env.as_ref().unwrap()
    }
}

impl Deref for EnvGuard {
    type Target = Environment;

    fn deref(&self) -> &Environment {
        self.env.as_ref().unwrap()
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(env) = self.env.take() {
            self.pool.put(env);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::PathBuf;

    fn pool(base: &std::path::Path, parallelism: usize) -> Arc<EnvPool> {
        let conf = Config {
            mount_conf: PathBuf::from("/nonexistent/mount.json"),
            ..Config::default()
        };
        let builder = EnvironmentBuilder::from_config(&conf, base).unwrap();
        EnvPool::new(builder, parallelism)
    }

    #[test]
    fn test_get_put_reuses_environment() {
        let base = tempfile::tempdir().unwrap();
        let pool = pool(base.path(), 2);
        let cancel = CancelToken::never();
        let id = {
            let guard = pool.get(&cancel).unwrap();
            guard.id().to_string()
        };
        let guard = pool.get(&cancel).unwrap();
        assert_eq!(guard.id(), id);
    }

    #[test]
    fn test_live_bounded_by_parallelism() {
        let base = tempfile::tempdir().unwrap();
        let pool = pool(base.path(), 1);
        let cancel = CancelToken::never();
        let guard = pool.get(&cancel).unwrap();
        {
            let state = pool.state.lock().unwrap();
            assert_eq!(state.live, 1);
        }
        // A second checkout must block until the first returns.
        let pool2 = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || {
            let cancel = CancelToken::never();
            pool2.get(&cancel).map(|g| g.id().to_string())
        });
        std::thread::sleep(Duration::from_millis(150));
        assert!(!waiter.is_finished());
        drop(guard);
        let id = waiter.join().unwrap().unwrap();
        assert!(!id.is_empty());
    }

    #[test]
    fn test_get_unblocks_on_cancel() {
        let base = tempfile::tempdir().unwrap();
        let pool = pool(base.path(), 1);
        let never = CancelToken::never();
        let _guard = pool.get(&never).unwrap();
        let source = crate::cancel::CancelSource::new();
        let token = source.token();
        let pool2 = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || pool2.get(&token).is_err());
        std::thread::sleep(Duration::from_millis(50));
        source.cancel();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_prefork_and_shutdown() {
        let base = tempfile::tempdir().unwrap();
        let pool = pool(base.path(), 2);
        pool.prefork(2).unwrap();
        {
            let state = pool.state.lock().unwrap();
            assert_eq!(state.free.len(), 2);
            assert_eq!(state.live, 2);
        }
        pool.shutdown();
        let cancel = CancelToken::never();
        assert!(pool.get(&cancel).is_err());
    }
}
