//! Cancellation plumbing shared by the worker and the execution engine.
//!
//! A [`CancelSource`] is held by whoever may abort the work; [`CancelToken`]s
//! are cloned into every blocking loop. Cancellation closes the underlying
//! channel, so a `select!` on [`CancelToken::channel`] fires immediately for
//! all holders, and it is monotone: once cancelled, always cancelled.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct CancelSource {
    tx: Mutex<Option<Sender<()>>>,
    flag: Arc<AtomicBool>,
    rx: Receiver<()>,
}

#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    rx: Receiver<()>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            tx: Mutex::new(Some(tx)),
            flag: Arc::new(AtomicBool::new(false)),
            rx,
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects the channel and wakes every
        // receiver blocked in select.
        self.tx.lock().unwrap().take();
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            flag: Arc::clone(&self.flag),
            rx: self.rx.clone(),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that can never be cancelled.
    pub fn never() -> Self {
        let source = CancelSource::new();
        // Leak the sender so the channel stays open forever.
        let tx = source.tx.lock().unwrap().take();
        std::mem::forget(tx);
        CancelToken {
            flag: Arc::clone(&source.flag),
            rx: source.rx.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Channel to multiplex in `select!`; it becomes ready (disconnected)
    /// exactly when the source is cancelled.
    pub fn channel(&self) -> &Receiver<()> {
        &self.rx
    }
}
