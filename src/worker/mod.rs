//! Bounded worker scheduler: turns requests into per-command executions
//! against the environment pool.

pub mod pipes;

use crate::cancel::{CancelSource, CancelToken};
use crate::config::Config;
use crate::envexec::run::{run_cmd, RunContext};
use crate::envexec::{Cmd, CmdResult, FileSlot, FileSource, Request, Response, Status};
use crate::env::EnvPool;
use crate::error::{Error, Result};
use crate::filestore::FileStore;
use crossbeam_channel::{bounded, Receiver, Sender};
use pipes::PlannedPipes;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

struct Job {
    request: Request,
    cancel: Arc<CancelSource>,
    resp_tx: Sender<Response>,
}

/// Handle returned by [`Worker::submit`].
pub struct Submission {
    resp_rx: Receiver<Response>,
    cancel: Arc<CancelSource>,
}

impl Submission {
    /// Cancel the request; running commands are killed, pending ones are
    /// short-circuited.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block until the response arrives.
    pub fn wait(self) -> Result<Response> {
        self.resp_rx.recv().map_err(|_| Error::WorkerStopped)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Response> {
        self.resp_rx.recv_timeout(timeout).ok()
    }
}

struct Shared {
    pool: Arc<EnvPool>,
    store: Arc<dyn FileStore>,
    tick_interval: Duration,
    extra_memory: u64,
}

pub struct Worker {
    tx: Option<Sender<Job>>,
    loops: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    inflight: Arc<Mutex<Vec<Weak<CancelSource>>>>,
}

impl Worker {
    pub fn new(conf: &Config, pool: Arc<EnvPool>, store: Arc<dyn FileStore>) -> Self {
        let shared = Arc::new(Shared {
            pool,
            store,
            tick_interval: conf.time_limit_checker_interval,
            extra_memory: conf.extra_memory_limit,
        });
        let (tx, rx) = bounded::<Job>(conf.parallelism * 2);
        let inflight: Arc<Mutex<Vec<Weak<CancelSource>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut loops = Vec::with_capacity(conf.parallelism);
        for i in 0..conf.parallelism {
            let rx = rx.clone();
            let shared = Arc::clone(&shared);
            loops.push(
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            run_request(&shared, job);
                        }
                    })
                    .expect("spawn worker loop"),
            );
        }
        Self {
            tx: Some(tx),
            loops,
            shared,
            inflight,
        }
    }

    /// Queue a request. Blocks while the bounded inbound queue is full;
    /// callers that want a timeout wrap this in their own.
    pub fn submit(&self, request: Request) -> Result<Submission> {
        request.validate().map_err(Error::InvalidRequest)?;
        let cancel = Arc::new(CancelSource::new());
        let (resp_tx, resp_rx) = bounded(1);
        {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.retain(|weak| weak.strong_count() > 0);
            inflight.push(Arc::downgrade(&cancel));
        }
        let job = Job {
            request,
            cancel: Arc::clone(&cancel),
            resp_tx,
        };
        self.tx
            .as_ref()
            .ok_or(Error::WorkerStopped)?
            .send(job)
            .map_err(|_| Error::WorkerStopped)?;
        Ok(Submission { resp_rx, cancel })
    }

    /// Convenience wrapper: submit and block for the response.
    pub fn execute(&self, request: Request) -> Result<Response> {
        self.submit(request)?.wait()
    }

    /// Stop accepting requests, cancel in-flight ones, drain the loops and
    /// destroy the environment pool.
    pub fn shutdown(mut self) {
        self.tx.take();
        for weak in self.inflight.lock().unwrap().drain(..) {
            if let Some(source) = weak.upgrade() {
                source.cancel();
            }
        }
        for handle in self.loops.drain(..) {
            let _ = handle.join();
        }
        self.shared.pool.shutdown();
    }
}

fn run_request(shared: &Shared, job: Job) {
    let cancel = job.cancel.token();
    let request_id = job.request.request_id.clone();
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        execute_request(shared, job.request, &cancel)
    }));
    let response = match outcome {
        Ok(response) => response,
        Err(panic) => {
            let msg = panic_message(&panic);
            log::error!("request {request_id} crashed in the engine: {msg}");
            Response {
                request_id,
                results: Vec::new(),
                error: Some(format!("internal error: {msg}")),
            }
        }
    };
    let _ = job.resp_tx.send(response);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn execute_request(shared: &Shared, request: Request, cancel: &CancelToken) -> Response {
    let request_id = request.request_id.clone();
    let n = request.cmds.len();

    // All pipes exist before anything runs so concurrent commands can
    // stream to each other.
    let mut pipes = match PlannedPipes::plan(&request.pipe_mapping) {
        Ok(pipes) => pipes,
        Err(e) => {
            return Response {
                request_id,
                results: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    };

    let mut cmds: Vec<Option<Cmd>> = request.cmds.into_iter().map(Some).collect();
    for (index, fd) in pipes.endpoint_keys() {
        if let Some(cmd) = cmds.get_mut(index).and_then(Option::as_mut) {
            while cmd.files.len() <= fd {
                cmd.files.push(FileSlot::Null);
            }
            if let Some(end) = pipes.take(index, fd) {
                cmd.files[fd] = FileSlot::Pipe(end);
            }
        }
    }

    // Cached-artifact dependencies: command j waits for the nearest earlier
    // command whose copyOutCached declares the referenced name. Pipe edges
    // deliberately do not order commands.
    let produced_names: Vec<HashSet<String>> = cmds
        .iter()
        .map(|cmd| {
            cmd.as_ref()
                .map(|c| {
                    c.copy_out_cached
                        .iter()
                        .map(|n| n.trim_end_matches('?').to_string())
                        .collect()
                })
                .unwrap_or_default()
        })
        .collect();
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
    for j in 0..n {
        let cmd = cmds[j].as_ref().unwrap();
        for source in cmd.copy_in.values() {
            if let FileSource::Cached(reference) = source {
                if let Some(i) = (0..j).rev().find(|i| produced_names[*i].contains(reference)) {
                    if !deps[j].contains(&i) {
                        deps[j].push(i);
                    }
                }
            }
        }
    }

    let ctx = RunContext {
        store: Arc::clone(&shared.store),
        tick_interval: shared.tick_interval,
        extra_memory: shared.extra_memory,
    };

    let mut results: Vec<Option<CmdResult>> = (0..n).map(|_| None).collect();
    let mut done = vec![false; n];
    let mut produced_ids: HashMap<String, String> = HashMap::new();

    while done.iter().any(|d| !d) {
        if cancel.is_cancelled() {
            break;
        }
        let ready: Vec<usize> = (0..n)
            .filter(|&j| !done[j] && deps[j].iter().all(|&i| done[i]))
            .collect();
        if ready.is_empty() {
            // Dependencies point strictly backwards, so an empty ready set
            // with work remaining cannot happen; bail out rather than spin.
            let remaining: Vec<usize> = (0..n).filter(|&j| !done[j]).collect();
            for j in remaining {
                results[j] = Some(CmdResult::from_status(
                    Status::InternalError,
                    Some("scheduler made no progress".to_string()),
                ));
                done[j] = true;
            }
            break;
        }

        // Resolve symbolic cached references against IDs produced so far.
        for &j in &ready {
            let cmd = cmds[j].as_mut().unwrap();
            for source in cmd.copy_in.values_mut() {
                if let FileSource::Cached(reference) = source {
                    if let Some(id) = produced_ids.get(reference) {
                        *source = FileSource::Cached(id.clone());
                    }
                }
            }
        }

        let wave: Vec<(usize, Cmd)> = ready
            .iter()
            .map(|&j| (j, cmds[j].take().unwrap()))
            .collect();
        let wave_results: Vec<(usize, CmdResult)> = std::thread::scope(|scope| {
            let handles: Vec<_> = wave
                .into_iter()
                .map(|(j, cmd)| {
                    let ctx = &ctx;
                    let pool = &shared.pool;
                    (
                        j,
                        scope.spawn(move || run_one(pool, ctx, cancel, cmd)),
                    )
                })
                .collect();
            handles
                .into_iter()
                .map(|(j, handle)| {
                    let result = handle.join().unwrap_or_else(|panic| {
                        CmdResult::from_status(
                            Status::InternalError,
                            Some(format!("engine crashed: {}", panic_message(&panic))),
                        )
                    });
                    (j, result)
                })
                .collect()
        });

        for (j, result) in wave_results {
            for (name, id) in &result.file_ids {
                produced_ids.insert(name.clone(), id.clone());
            }
            results[j] = Some(result);
            done[j] = true;
        }
    }

    // Cancellation: pending commands short-circuit, and cached artifacts
    // already produced by this request are rolled back.
    if cancel.is_cancelled() {
        for slot in results.iter_mut() {
            let rolled_back = match slot {
                Some(result) => {
                    for id in result.file_ids.values() {
                        shared.store.remove(id);
                    }
                    result.file_ids.clear();
                    true
                }
                None => false,
            };
            if !rolled_back {
                *slot = Some(CmdResult::from_status(Status::Cancelled, None));
            }
        }
    }

    pipes.finish();

    Response {
        request_id,
        results: results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    CmdResult::from_status(
                        Status::InternalError,
                        Some("command never scheduled".to_string()),
                    )
                })
            })
            .collect(),
        error: None,
    }
}

fn run_one(pool: &Arc<EnvPool>, ctx: &RunContext, cancel: &CancelToken, cmd: Cmd) -> CmdResult {
    let guard = match pool.get(cancel) {
        Ok(guard) => guard,
        Err(_) if cancel.is_cancelled() => {
            return CmdResult::from_status(Status::Cancelled, None)
        }
        Err(e) => return CmdResult::from_status(Status::InternalError, Some(e.to_string())),
    };
    run_cmd(guard.env(), ctx, cancel, cmd)
}
