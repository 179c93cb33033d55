//! The execution engine: stage inputs, launch, supervise, collect, classify.

use super::file::{self, Collector, Fd};
use super::{check_rel_path, Cmd, CmdResult, FileSlot, FileSource, Limit, Status};
use crate::cancel::CancelToken;
use crate::env::{Environment, ExecveParam, WaitOutcome};
use crate::error::{Error, Result};
use crate::filestore::FileStore;
use crossbeam_channel::{after, never, select, tick};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Engine-level settings shared by every command of a request.
pub struct RunContext {
    pub store: Arc<dyn FileStore>,
    pub tick_interval: Duration,
    pub extra_memory: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KillReason {
    Cpu,
    Wall,
    Cancel,
}

/// Run one command to completion inside `env`. Never panics outward: any
/// internal failure is folded into an `InternalError` result so sibling
/// commands of the request keep running.
pub fn run_cmd(env: &Environment, ctx: &RunContext, cancel: &CancelToken, cmd: Cmd) -> CmdResult {
    if cancel.is_cancelled() {
        return CmdResult::from_status(Status::Cancelled, None);
    }
    match run_inner(env, ctx, cancel, cmd) {
        Ok(result) => result,
        Err(Error::InvalidRequest(msg)) => CmdResult::from_status(Status::InvalidRequest, Some(msg)),
        Err(e) => CmdResult::from_status(Status::InternalError, Some(e.to_string())),
    }
}

fn run_inner(
    env: &Environment,
    ctx: &RunContext,
    cancel: &CancelToken,
    cmd: Cmd,
) -> Result<CmdResult> {
    let Cmd {
        args,
        env: environ,
        files,
        copy_in,
        copy_out,
        copy_out_cached,
        copy_out_dir,
        limit,
    } = cmd;

    // Stage inputs through the work-directory fd.
    if let Err(msg) = stage_copy_in(env, &ctx.store, &copy_in) {
        return Ok(CmdResult::from_status(Status::FileError, Some(msg)));
    }

    // Prepare the child's fd table. `owned` holds the parent copies closed
    // right after the spawn; collector read ends live in drain threads.
    let mut child_fds: Vec<RawFd> = Vec::with_capacity(files.len().max(3));
    let mut owned: Vec<Fd> = Vec::new();
    let mut collectors: Vec<Collector> = Vec::new();
    let mut slots = files;
    while slots.len() < 3 {
        slots.push(FileSlot::Null);
    }
    for slot in slots {
        match slot {
            FileSlot::Null => {
                let fd = file::open_null()?;
                child_fds.push(fd.raw());
                owned.push(fd);
            }
            FileSlot::Memory(content) => {
                let fd = file::memfd_with("input", &content)?;
                child_fds.push(fd.raw());
                owned.push(fd);
            }
            FileSlot::Host(path) => {
                let fd = file::open_host(&path)?;
                child_fds.push(fd.raw());
                owned.push(fd);
            }
            FileSlot::Collector { name, max } => {
                let (r, w) = file::pipe_pair()?;
                collectors.push(Collector::spawn(name, max, r));
                child_fds.push(w.raw());
                owned.push(w);
            }
            FileSlot::Pipe(fd) => {
                child_fds.push(fd.raw());
                owned.push(fd);
            }
        }
    }

    let spawned = env.execve(ExecveParam {
        args,
        env: environ,
        fds: child_fds,
        limit: limit.clone(),
        extra_memory: ctx.extra_memory,
    });
    // The child holds its copies now (or the launch failed); either way the
    // parent copies must go so collector pipes can reach EOF.
    drop(owned);
    let mut process = match spawned {
        Ok(p) => p,
        Err(e) => {
            for c in collectors {
                let _ = c.finish();
            }
            return Err(e);
        }
    };

    // Supervision: blocking wait in the waiter thread, CPU poll each tick,
    // one-shot wall timer, and the cancellation channel.
    let ticker = tick(ctx.tick_interval);
    let wall = after(limit.wall_time);
    let mut cancel_rx = cancel.channel().clone();
    let mut kill_reason: Option<KillReason> = None;
    let kill = |p: &crate::env::Process, reason: KillReason, slot: &mut Option<KillReason>| {
        if slot.is_none() {
            *slot = Some(reason);
        }
        p.kill();
    };
    let outcome = loop {
        select! {
            recv(process.done) -> msg => {
                break msg.map_err(|_| Error::Process("waiter vanished".to_string()))?;
            }
            recv(cancel_rx) -> _ => {
                kill(&process, KillReason::Cancel, &mut kill_reason);
                cancel_rx = never();
            }
            recv(wall) -> _ => {
                kill(&process, KillReason::Wall, &mut kill_reason);
            }
            recv(ticker) -> _ => {
                process.sample();
                if let Some(cpu) = process.cpu_usage() {
                    if cpu >= limit.cpu_time {
                        kill(&process, KillReason::Cpu, &mut kill_reason);
                    }
                }
            }
        }
    };

    let wall_time = process.wall_elapsed();
    let exec_error = process.exec_error();
    let stats = process.finish();

    let mut result = CmdResult {
        status: None,
        exit_code: match outcome {
            WaitOutcome::Exited(code) => code,
            WaitOutcome::Signalled(_) => 0,
        },
        signal: match outcome {
            WaitOutcome::Signalled(sig) => Some(sig),
            WaitOutcome::Exited(_) => None,
        },
        cpu_time: stats.cpu_time,
        wall_time,
        memory: stats.memory_peak,
        procs: stats.procs_peak,
        files: HashMap::new(),
        file_ids: HashMap::new(),
        truncated: Default::default(),
        error: exec_error.clone(),
    };

    for collector in collectors {
        let (name, data, truncated) = collector.finish();
        if truncated {
            result.truncated.insert(name.clone());
        }
        result.files.insert(name, data);
    }

    // Materialise outputs. Failures here turn an otherwise clean run into
    // FileError; they never abort the request.
    let mut file_errors: Vec<String> = Vec::new();
    collect_copy_out(env, &copy_out, limit.copy_out, &mut result, &mut file_errors);
    collect_copy_out_cached(
        env,
        &ctx.store,
        &copy_out_cached,
        &mut result,
        &mut file_errors,
    );
    if let Some(dir) = &copy_out_dir {
        dump_work_dir(env, dir);
    }

    result.status = Some(classify(
        cancel,
        kill_reason,
        &outcome,
        &stats,
        &limit,
        exec_error.is_some(),
        &file_errors,
    ));
    if result.error.is_none() && !file_errors.is_empty() {
        result.error = Some(file_errors.join("; "));
    }
    Ok(result)
}

fn classify(
    cancel: &CancelToken,
    kill_reason: Option<KillReason>,
    outcome: &WaitOutcome,
    stats: &crate::env::ProcessStats,
    limit: &Limit,
    exec_failed: bool,
    file_errors: &[String],
) -> Status {
    if cancel.is_cancelled() || kill_reason == Some(KillReason::Cancel) {
        return Status::Cancelled;
    }
    if exec_failed {
        return Status::InternalError;
    }
    if let WaitOutcome::Signalled(sig) = outcome {
        if *sig == libc::SIGSYS {
            return Status::DangerousSyscall;
        }
        // Memory wins over time when the kernel killed for OOM.
        if *sig == libc::SIGKILL && (stats.oom_killed || stats.memory_peak >= limit.memory) {
            return Status::MemoryLimitExceeded;
        }
        if *sig == libc::SIGXCPU {
            return Status::TimeLimitExceeded;
        }
    }
    if matches!(kill_reason, Some(KillReason::Cpu | KillReason::Wall))
        || stats.cpu_time >= limit.cpu_time
    {
        return Status::TimeLimitExceeded;
    }
    match outcome {
        WaitOutcome::Signalled(sig) if *sig == libc::SIGXFSZ => Status::OutputLimitExceeded,
        WaitOutcome::Signalled(_) => Status::Signalled,
        WaitOutcome::Exited(0) => {
            if file_errors.is_empty() {
                Status::Accepted
            } else {
                Status::FileError
            }
        }
        WaitOutcome::Exited(_) => Status::NonzeroExitStatus,
    }
}

/// Create every copy-in entry relative to the work directory.
fn stage_copy_in(
    env: &Environment,
    store: &Arc<dyn FileStore>,
    copy_in: &HashMap<String, FileSource>,
) -> std::result::Result<(), String> {
    for (name, source) in copy_in {
        if !check_rel_path(name) {
            return Err(format!("copyIn path {name:?} is not a clean relative path"));
        }
        mkdir_parents(env, name)?;
        match source {
            FileSource::Memory(content) => {
                let fd = env
                    .open_at_work_dir(
                        name,
                        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                        Mode::from_bits_truncate(0o755),
                    )
                    .map_err(|e| format!("create {name}: {e}"))?;
                let mut f = unsafe { std::fs::File::from_raw_fd(fd.into_raw()) };
                f.write_all(content)
                    .map_err(|e| format!("write {name}: {e}"))?;
            }
            FileSource::Cached(id) => {
                let entry = store
                    .get(id)
                    .ok_or_else(|| format!("copy-in source {id} not in store"))?;
                link_into(env, &entry.path, name)?;
            }
            FileSource::Link(path) => link_into(env, path, name)?,
            FileSource::Symlink(target) => {
                nix::unistd::symlinkat(target.as_path(), Some(env.work_dir()), name.as_str())
                    .map_err(|e| format!("symlink {name}: {e}"))?;
            }
        }
    }
    Ok(())
}

fn mkdir_parents(env: &Environment, name: &str) -> std::result::Result<(), String> {
    let mut prefix = String::new();
    let mut components: Vec<&str> = name.split('/').collect();
    components.pop();
    for part in components {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(part);
        match nix::sys::stat::mkdirat(env.work_dir(), prefix.as_str(), Mode::from_bits_truncate(0o755)) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(format!("mkdir {prefix}: {e}")),
        }
    }
    Ok(())
}

/// Hard-link `src` to `name` under the work dir, copying when the store
/// lives on another filesystem.
fn link_into(env: &Environment, src: &Path, name: &str) -> std::result::Result<(), String> {
    let linked = nix::unistd::linkat(
        None,
        src,
        Some(env.work_dir()),
        Path::new(name),
        nix::unistd::LinkatFlags::NoSymlinkFollow,
    );
    match linked {
        Ok(()) => Ok(()),
        Err(_) => {
            let mut from =
                std::fs::File::open(src).map_err(|e| format!("open {}: {}", src.display(), e))?;
            let mode = from
                .metadata()
                .map(|m| std::os::unix::fs::PermissionsExt::mode(&m.permissions()))
                .unwrap_or(0o755);
            let fd = env
                .open_at_work_dir(
                    name,
                    OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
                    Mode::from_bits_truncate(mode),
                )
                .map_err(|e| format!("create {name}: {e}"))?;
            let mut to = unsafe { std::fs::File::from_raw_fd(fd.into_raw()) };
            std::io::copy(&mut from, &mut to).map_err(|e| format!("copy into {name}: {e}"))?;
            Ok(())
        }
    }
}

fn collect_copy_out(
    env: &Environment,
    names: &[String],
    max: u64,
    result: &mut CmdResult,
    errors: &mut Vec<String>,
) {
    for raw_name in names {
        let (name, optional) = match raw_name.strip_suffix('?') {
            Some(base) => (base, true),
            None => (raw_name.as_str(), false),
        };
        // A collector of the same name already produced this entry.
        if result.files.contains_key(name) {
            continue;
        }
        match read_work_dir_file(env, name, max) {
            Ok(Some(data)) => {
                result.files.insert(name.to_string(), data);
            }
            Ok(None) if optional => {}
            Ok(None) => errors.push(format!("copy-out file {name} missing")),
            Err(msg) => errors.push(msg),
        }
    }
}

/// Read one work-dir file, bounded by `max`. `Ok(None)` when absent.
fn read_work_dir_file(
    env: &Environment,
    name: &str,
    max: u64,
) -> std::result::Result<Option<Vec<u8>>, String> {
    let fd = match nix::fcntl::openat(
        env.work_dir(),
        name,
        OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    ) {
        Ok(fd) => Fd::from_raw(fd),
        Err(nix::errno::Errno::ENOENT) => return Ok(None),
        Err(e) => return Err(format!("open copy-out {name}: {e}")),
    };
    let mut file = unsafe { std::fs::File::from_raw_fd(fd.into_raw()) };
    let mut data = Vec::new();
    Read::by_ref(&mut file)
        .take(max + 1)
        .read_to_end(&mut data)
        .map_err(|e| format!("read copy-out {name}: {e}"))?;
    if data.len() as u64 > max {
        return Err(format!("copy-out file {name} exceeds limit {max}"));
    }
    Ok(Some(data))
}

fn collect_copy_out_cached(
    env: &Environment,
    store: &Arc<dyn FileStore>,
    names: &[String],
    result: &mut CmdResult,
    errors: &mut Vec<String>,
) {
    for raw_name in names {
        let (name, optional) = match raw_name.strip_suffix('?') {
            Some(base) => (base, true),
            None => (raw_name.as_str(), false),
        };
        let fd = match env.open_at_work_dir(name, OFlag::O_RDONLY | OFlag::O_NOFOLLOW, Mode::empty())
        {
            Ok(fd) => fd,
            Err(_) if optional => continue,
            Err(e) => {
                errors.push(format!("cache file {name}: {e}"));
                continue;
            }
        };
        let mut from = unsafe { std::fs::File::from_raw_fd(fd.into_raw()) };
        let staged = (|| -> Result<String> {
            let mut scratch = store.new_file()?;
            std::io::copy(&mut from, scratch.as_file_mut())
                .map_err(|e| Error::FileStore(format!("stage {name}: {e}")))?;
            let mode = from
                .metadata()
                .map(|m| std::os::unix::fs::PermissionsExt::mode(&m.permissions()))
                .unwrap_or(0o644);
            let (_file, path) = scratch
                .keep()
                .map_err(|e| Error::FileStore(format!("keep {name}: {e}")))?;
            let _ = std::fs::set_permissions(
                &path,
                std::os::unix::fs::PermissionsExt::from_mode(mode),
            );
            store.add(name, &path)
        })();
        match staged {
            Ok(id) => {
                result.file_ids.insert(name.to_string(), id);
            }
            Err(e) => errors.push(format!("cache file {name}: {e}")),
        }
    }
}

/// Copy every regular work-dir file into `dir` for post-mortem inspection.
/// Best effort by design: failures are logged, never reported.
fn dump_work_dir(env: &Environment, dir: &Path) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        log::warn!("copyOutDir {}: {}", dir.display(), e);
        return;
    }
    let entries = match std::fs::read_dir(env.workdir_path()) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("copyOutDir read workdir: {e}");
            return;
        }
    };
    for entry in entries.flatten() {
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let target = dir.join(entry.file_name());
        if let Err(e) = std::fs::copy(entry.path(), &target) {
            log::warn!("copyOutDir copy {}: {}", target.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::env::EnvironmentBuilder;
    use crate::filestore::LocalStore;
    use std::path::PathBuf;

    fn setup() -> (tempfile::TempDir, Environment, RunContext) {
        let base = tempfile::tempdir().unwrap();
        let conf = Config {
            mount_conf: PathBuf::from("/nonexistent/mount.json"),
            ..Config::default()
        };
        let env = EnvironmentBuilder::from_config(&conf, base.path())
            .unwrap()
            .build()
            .unwrap();
        let store: Arc<dyn FileStore> =
            Arc::new(LocalStore::new(&base.path().join("store")).unwrap());
        let ctx = RunContext {
            store,
            tick_interval: Duration::from_millis(100),
            extra_memory: 16 << 10,
        };
        (base, env, ctx)
    }

    fn limit() -> Limit {
        Limit {
            wall_time: Duration::from_secs(5),
            cpu_time: Duration::from_secs(2),
            memory: 256 << 20,
            stack: 8 << 20,
            output: 4 << 20,
            copy_out: 1 << 20,
            open_file: 64,
            proc: 16,
            cpu_set: None,
            cpu_rate: None,
            strict_memory: false,
        }
    }

    fn cmd(args: &[&str]) -> Cmd {
        Cmd {
            args: args.iter().map(|s| s.to_string()).collect(),
            env: vec!["PATH=/usr/bin:/bin".into()],
            files: vec![
                FileSlot::Memory(Vec::new()),
                FileSlot::Collector {
                    name: "stdout".into(),
                    max: 10240,
                },
                FileSlot::Collector {
                    name: "stderr".into(),
                    max: 10240,
                },
            ],
            copy_in: HashMap::new(),
            copy_out: vec![],
            copy_out_cached: vec![],
            copy_out_dir: None,
            limit: limit(),
        }
    }

    #[test]
    fn test_echo_accepted() {
        let (_base, env, ctx) = setup();
        let result = run_cmd(&env, &ctx, &CancelToken::never(), cmd(&["/bin/echo", "hi"]));
        assert_eq!(result.status(), Status::Accepted, "error: {:?}", result.error);
        assert_eq!(result.files.get("stdout").unwrap(), b"hi\n");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn test_stdin_content_reaches_child() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/cat"]);
        c.files[0] = FileSlot::Memory(b"ping".to_vec());
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::Accepted, "error: {:?}", result.error);
        assert_eq!(result.files.get("stdout").unwrap(), b"ping");
    }

    #[test]
    fn test_nonzero_exit() {
        let (_base, env, ctx) = setup();
        let result = run_cmd(&env, &ctx, &CancelToken::never(), cmd(&["/bin/false"]));
        assert_eq!(result.status(), Status::NonzeroExitStatus);
        assert_ne!(result.exit_code, 0);
    }

    #[test]
    fn test_copy_in_and_copy_out() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/cat", "input.txt"]);
        c.copy_in.insert(
            "input.txt".into(),
            FileSource::Memory(b"staged bytes".to_vec()),
        );
        c.copy_out = vec!["input.txt".into()];
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::Accepted, "error: {:?}", result.error);
        assert_eq!(result.files.get("stdout").unwrap(), b"staged bytes");
        assert_eq!(result.files.get("input.txt").unwrap(), b"staged bytes");
    }

    #[test]
    fn test_copy_out_missing_is_file_error() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/true"]);
        c.copy_out = vec!["no-such-file".into()];
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::FileError);
        assert!(result.error.as_deref().unwrap().contains("no-such-file"));
    }

    #[test]
    fn test_copy_out_optional_missing_ok() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/true"]);
        c.copy_out = vec!["no-such-file?".into()];
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::Accepted, "error: {:?}", result.error);
    }

    #[test]
    fn test_copy_out_cached_round_trip() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/sh", "-c", "printf 42 > answer"]);
        c.copy_out_cached = vec!["answer".into()];
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::Accepted, "error: {:?}", result.error);
        let id = result.file_ids.get("answer").unwrap();
        let entry = ctx.store.get(id).unwrap();
        assert_eq!(entry.name, "answer");
        assert_eq!(std::fs::read(&entry.path).unwrap(), b"42");
    }

    #[test]
    fn test_missing_cached_source_is_file_error() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/true"]);
        c.copy_in
            .insert("bin".into(), FileSource::Cached("ZZZZZZZZ".into()));
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::FileError);
        assert!(result.error.as_deref().unwrap().contains("not in store"));
    }

    #[test]
    fn test_collector_truncation_is_not_an_error() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/sh", "-c", "printf '%01000d' 7"]);
        c.files[1] = FileSlot::Collector {
            name: "stdout".into(),
            max: 16,
        };
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::Accepted, "error: {:?}", result.error);
        assert_eq!(result.files.get("stdout").unwrap().len(), 16);
        assert!(result.truncated.contains("stdout"));
    }

    #[test]
    fn test_wall_time_kill() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/sleep", "10"]);
        c.limit.wall_time = Duration::from_millis(300);
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::TimeLimitExceeded);
        assert!(result.wall_time < Duration::from_secs(5));
    }

    #[test]
    fn test_cancellation_kills_child() {
        let (_base, env, ctx) = setup();
        let source = crate::cancel::CancelSource::new();
        let token = source.token();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            source.cancel();
        });
        let result = run_cmd(&env, &ctx, &token, cmd(&["/bin/sleep", "10"]));
        handle.join().unwrap();
        assert_eq!(result.status(), Status::Cancelled);
        assert!(result.wall_time < Duration::from_secs(2));
    }

    #[test]
    fn test_symlink_copy_in() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/true"]);
        c.copy_in.insert(
            "link".into(),
            FileSource::Symlink(PathBuf::from("/etc/hostname")),
        );
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::Accepted, "error: {:?}", result.error);
        let link = std::fs::read_link(env.workdir_path().join("link")).unwrap();
        assert_eq!(link, PathBuf::from("/etc/hostname"));
    }

    #[test]
    fn test_nested_copy_in_path() {
        let (_base, env, ctx) = setup();
        let mut c = cmd(&["/bin/cat", "sub/dir/data"]);
        c.copy_in.insert(
            "sub/dir/data".into(),
            FileSource::Memory(b"nested".to_vec()),
        );
        let result = run_cmd(&env, &ctx, &CancelToken::never(), c);
        assert_eq!(result.status(), Status::Accepted, "error: {:?}", result.error);
        assert_eq!(result.files.get("stdout").unwrap(), b"nested");
    }
}
