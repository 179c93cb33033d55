//! Free-list reuse of cgroup controllers across executions.

use super::{CgroupBuilder, CgroupController};
use crate::error::Result;
use std::sync::{Arc, Mutex};

pub struct CgroupPool {
    builder: CgroupBuilder,
    free: Mutex<Vec<Box<dyn CgroupController>>>,
}

/// Checkout handle. Dropping the guard resets the controller and returns it
/// to the free list; a failed reset destroys it instead.
pub struct CgroupGuard {
    controller: Option<Box<dyn CgroupController>>,
    pool: Arc<CgroupPool>,
}

impl CgroupPool {
    /// Probe the host by building one controller up front; a host where the
    /// hierarchy exists but is not writable (unprivileged runs) yields
    /// `None` and execution proceeds without cgroup accounting.
    pub fn new(builder: CgroupBuilder) -> Option<Arc<Self>> {
        if !builder.available() {
            return None;
        }
        let probe = match builder.build() {
            Ok(cg) => cg,
            Err(e) => {
                log::warn!("cgroup hierarchy not usable, accounting disabled: {}", e);
                return None;
            }
        };
        Some(Arc::new(Self {
            builder,
            free: Mutex::new(vec![probe]),
        }))
    }

    pub fn get(self: &Arc<Self>) -> Result<CgroupGuard> {
        let recycled = self.free.lock().unwrap().pop();
        let controller = match recycled {
            Some(cg) => cg,
            None => self.builder.build()?,
        };
        Ok(CgroupGuard {
            controller: Some(controller),
            pool: Arc::clone(self),
        })
    }
}

impl CgroupGuard {
    pub fn controller(&self) -> &dyn CgroupController {
        self.controller.as_deref().unwrap()
    }
}

impl Drop for CgroupGuard {
    fn drop(&mut self) {
        if let Some(cg) = self.controller.take() {
            match cg.reset() {
                Ok(()) => self.pool.free.lock().unwrap().push(cg),
                Err(e) => {
                    log::warn!("cgroup reset failed, discarding: {}", e);
                    if let Err(e) = cg.destroy() {
                        log::warn!("cgroup destroy failed: {}", e);
                    }
                }
            }
        }
    }
}
