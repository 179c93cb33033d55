//! Reusable sandbox environments.
//!
//! An [`Environment`] is one prepared rootfs with an open work-directory fd,
//! a compiled seccomp program and a handle on the cgroup pool. Namespaces
//! are entered fresh on every [`Environment::execve`] via `clone(2)`; the
//! environment itself survives executions and is wiped by
//! [`Environment::reset`] between checkouts.

pub mod pool;
pub mod process;

pub use pool::{EnvGuard, EnvPool};
pub use process::{Process, ProcessStats, WaitOutcome};

use crate::cgroup::{CgroupBuilder, CgroupPool};
use crate::config::Config;
use crate::envexec::{file, Fd, Limit};
use crate::error::{Error, Result};
use crate::mount::MountTable;
use crate::seccomp;
use crossbeam_channel::bounded;
use nix::fcntl::{FcntlArg, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, Gid, Uid, Whence};
use seccompiler::BpfProgram;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

const CHILD_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Parameters for one execution inside an environment.
pub struct ExecveParam {
    pub args: Vec<String>,
    pub env: Vec<String>,
    /// Child descriptors; index is the target fd number. Borrowed: the
    /// caller still owns and closes them.
    pub fds: Vec<RawFd>,
    pub limit: Limit,
    /// Slack added on top of `limit.memory` for the cgroup only.
    pub extra_memory: u64,
}

/// Rlimit set computed from a [`Limit`], applied in the child.
#[derive(Clone, Copy, Debug)]
struct RLimits {
    cpu_soft: u64,
    cpu_hard: u64,
    fsize: u64,
    stack: u64,
    nofile: u64,
    data: Option<u64>,
}

impl RLimits {
    fn new(limit: &Limit, strict_data: bool) -> Self {
        let mut cpu = limit.cpu_time.as_secs();
        if limit.cpu_time.subsec_nanos() > 0 {
            cpu += 1;
        }
        let cpu_soft = cpu + 1;
        Self {
            cpu_soft,
            cpu_hard: cpu_soft + 1,
            fsize: limit.output,
            stack: limit.stack,
            nofile: limit.open_file,
            data: strict_data.then_some(limit.memory),
        }
    }

    fn apply(&self) -> Result<()> {
        set_rlimit(libc::RLIMIT_CPU, self.cpu_soft, self.cpu_hard)?;
        set_rlimit(libc::RLIMIT_FSIZE, self.fsize, self.fsize)?;
        set_rlimit(libc::RLIMIT_STACK, self.stack, self.stack)?;
        set_rlimit(libc::RLIMIT_NOFILE, self.nofile, self.nofile)?;
        set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
        if let Some(data) = self.data {
            set_rlimit(libc::RLIMIT_DATA, data, data)?;
        }
        Ok(())
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> Result<()> {
    let lim = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &lim) } != 0 {
        return Err(Error::Process(format!(
            "setrlimit({resource}): {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Builds environments from the loaded configuration. The mount table and
/// seccomp program are prepared once here and shared by every environment.
pub struct EnvironmentBuilder {
    base: PathBuf,
    mounts: Arc<MountTable>,
    seccomp: Option<Arc<BpfProgram>>,
    net_share: bool,
    cpuset: Option<String>,
    cgroup_pool: Option<Arc<CgroupPool>>,
    cred_start: Option<u32>,
    cred_next: AtomicU32,
}

impl EnvironmentBuilder {
    pub fn from_config(conf: &Config, base: &Path) -> Result<Self> {
        let mounts = Arc::new(MountTable::load(&conf.mount_conf)?);
        let seccomp = match &conf.seccomp_conf {
            Some(path) => Some(seccomp::compile(path)?),
            None => None,
        };
        let cgroup_pool = CgroupPool::new(CgroupBuilder::new(&conf.cgroup_prefix));
        if !unistd::geteuid().is_root() {
            log::warn!("not running as root: namespace isolation disabled");
        }
        Ok(Self {
            base: base.to_path_buf(),
            mounts,
            seccomp,
            net_share: conf.net_share,
            cpuset: conf.cpuset.clone(),
            cgroup_pool,
            cred_start: None,
            cred_next: AtomicU32::new(0),
        })
    }

    /// Start of the UID/GID range handed out to environments, one
    /// credential per environment.
    pub fn cred_start(mut self, start: Option<u32>) -> Self {
        self.cred_start = start;
        self
    }

    pub fn build(&self) -> Result<Environment> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let root = self.base.join(&id);
        let workdir = root.join("w");
        std::fs::create_dir_all(&workdir)
            .map_err(|e| Error::Environment(format!("create {}: {}", workdir.display(), e)))?;
        self.mounts.prepare_targets(&root)?;

        let privileged = unistd::geteuid().is_root();
        let workdir_tmpfs = privileged
            && mount(
                Some("tmpfs"),
                &workdir,
                Some("tmpfs"),
                MsFlags::MS_NOSUID,
                Some("size=256m"),
            )
            .map_err(|e| log::warn!("workdir tmpfs for {}: {}", workdir.display(), e))
            .is_ok();

        let wd = nix::fcntl::open(
            &workdir,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            nix::sys::stat::Mode::empty(),
        )
        .map_err(|e| Error::Environment(format!("open workdir {}: {}", workdir.display(), e)))?;

        let cred = match (self.cred_start, privileged) {
            (Some(start), true) => {
                let id = start + self.cred_next.fetch_add(1, Ordering::Relaxed);
                Some((id, id))
            }
            _ => None,
        };

        log::debug!("built environment {} at {}", id, root.display());
        Ok(Environment {
            id,
            root,
            workdir,
            wd,
            mounts: Arc::clone(&self.mounts),
            seccomp: self.seccomp.clone(),
            net_share: self.net_share,
            cpuset: self.cpuset.clone(),
            cgroup_pool: self.cgroup_pool.clone(),
            cred,
            namespaces: privileged,
            workdir_tmpfs,
            destroyed: AtomicBool::new(false),
        })
    }
}

pub struct Environment {
    id: String,
    root: PathBuf,
    workdir: PathBuf,
    wd: RawFd,
    mounts: Arc<MountTable>,
    seccomp: Option<Arc<BpfProgram>>,
    net_share: bool,
    cpuset: Option<String>,
    cgroup_pool: Option<Arc<CgroupPool>>,
    cred: Option<(u32, u32)>,
    /// Whether `execve` enters fresh namespaces (requires root).
    namespaces: bool,
    workdir_tmpfs: bool,
    destroyed: AtomicBool,
}

impl Environment {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host path of the work directory.
    pub fn workdir_path(&self) -> &Path {
        &self.workdir
    }

    /// Work-directory fd, rewound on every call.
    pub fn work_dir(&self) -> RawFd {
        let _ = unistd::lseek(self.wd, 0, Whence::SeekSet);
        self.wd
    }

    /// `openat` relative to the work directory with `O_CLOEXEC` forced.
    pub fn open_at_work_dir(
        &self,
        path: &str,
        flags: OFlag,
        mode: nix::sys::stat::Mode,
    ) -> Result<Fd> {
        let fd = nix::fcntl::openat(self.wd, path, flags | OFlag::O_CLOEXEC, mode)
            .map_err(|e| Error::Environment(format!("openat {path}: {e}")))?;
        Ok(Fd::from_raw(fd))
    }

    /// Run one program. Does not return before the child has been placed
    /// into its cgroup (or the launch was aborted and the child killed), so
    /// the caller may close its copies of the child fds immediately after.
    pub fn execve(&self, param: ExecveParam) -> Result<Process> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Environment("environment already destroyed".to_string()));
        }

        let cgroup = match &self.cgroup_pool {
            Some(pool) => {
                let guard = pool.get()?;
                let cg = guard.controller();
                if let Some(cpuset) = param.limit.cpu_set.as_deref().or(self.cpuset.as_deref()) {
                    cg.set_cpuset(cpuset)?;
                }
                if let Some(rate) = param.limit.cpu_rate {
                    cg.set_cpu_rate(rate)?;
                }
                cg.set_memory_limit(param.limit.memory + param.extra_memory)?;
                cg.set_proc_limit(param.limit.proc)?;
                Some(guard)
            }
            None => None,
        };

        let rlimits = RLimits::new(&param.limit, param.limit.strict_memory || cgroup.is_none());

        let argv = to_cstrings(&param.args)?;
        let envp = to_cstrings(&param.env)?;

        let (sync_r, sync_w) = file::pipe_pair()?;
        let (err_r, err_w) = file::pipe_pair()?;

        let ctx = ChildContext {
            root: self.root.clone(),
            workdir: self.workdir.clone(),
            namespaces: self.namespaces,
            mounts: Arc::clone(&self.mounts),
            seccomp: self.seccomp.clone(),
            cred: self.cred,
            fds: param.fds.clone(),
            rlimits,
            argv,
            envp,
            sync_r: sync_r.raw(),
            err_w: err_w.raw(),
        };

        let mut flags = CloneFlags::empty();
        if self.namespaces {
            flags |= CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
            if !self.net_share {
                flags |= CloneFlags::CLONE_NEWNET;
            }
        }

        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let cb: Box<dyn FnMut() -> isize> = Box::new(move || ctx.run());
        let pid = unsafe { nix::sched::clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }
            .map_err(|e| Error::Process(format!("clone: {e}")))?;

        // Child-side pipe ends are no longer needed in the parent.
        drop(sync_r);
        drop(err_w);

        // Sync hook: the child must sit in its cgroup before it can exec,
        // so later limit reads are attributed correctly.
        if let Some(guard) = &cgroup {
            if let Err(e) = guard.controller().add_proc(pid.as_raw()) {
                let _ = kill(pid, Signal::SIGKILL);
                drop(sync_w);
                let _ = waitpid(pid, None);
                return Err(e);
            }
        }
        if unistd::write(sync_w.raw(), b"x").is_err() {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            return Err(Error::Process("child vanished before sync".to_string()));
        }
        drop(sync_w);

        let (done_tx, done_rx) = bounded(1);
        let waiter = std::thread::spawn(move || {
            let outcome = loop {
                match waitpid(pid, None) {
                    Ok(WaitStatus::Exited(_, code)) => break WaitOutcome::Exited(code),
                    Ok(WaitStatus::Signaled(_, sig, _)) => break WaitOutcome::Signalled(sig as i32),
                    Ok(_) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        log::warn!("waitpid({pid}): {e}");
                        break WaitOutcome::Exited(-1);
                    }
                }
            };
            let _ = done_tx.send(outcome);
        });

        Ok(Process {
            pid,
            done: done_rx,
            cgroup,
            err_pipe: Some(err_r),
            waiter: Some(waiter),
            start: Instant::now(),
        })
    }

    /// Wipe the work directory for the next checkout.
    pub fn reset(&self) -> Result<()> {
        if self.workdir_tmpfs {
            umount2(&self.workdir, MntFlags::MNT_DETACH)
                .map_err(|e| Error::Environment(format!("unmount workdir tmpfs: {e}")))?;
            mount(
                Some("tmpfs"),
                &self.workdir,
                Some("tmpfs"),
                MsFlags::MS_NOSUID,
                Some("size=256m"),
            )
            .map_err(|e| Error::Environment(format!("remount workdir tmpfs: {e}")))?;
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.workdir)
            .map_err(|e| Error::Environment(format!("read workdir: {e}")))?
        {
            let entry = entry.map_err(|e| Error::Environment(format!("read workdir: {e}")))?;
            let path = entry.path();
            let removed = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.map_err(|e| Error::Environment(format!("wipe {}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    /// Release everything. Idempotent.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = unistd::close(self.wd);
        if self.workdir_tmpfs {
            if let Err(e) = umount2(&self.workdir, MntFlags::MNT_DETACH) {
                log::warn!("unmount workdir tmpfs {}: {}", self.workdir.display(), e);
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            log::warn!("remove env root {}: {}", self.root.display(), e);
        }
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

fn to_cstrings(items: &[String]) -> Result<Vec<CString>> {
    items
        .iter()
        .map(|s| {
            CString::new(s.as_str())
                .map_err(|_| Error::InvalidRequest(format!("NUL byte in {s:?}")))
        })
        .collect()
}

/// Everything the child needs, captured before `clone`.
struct ChildContext {
    root: PathBuf,
    workdir: PathBuf,
    namespaces: bool,
    mounts: Arc<MountTable>,
    seccomp: Option<Arc<BpfProgram>>,
    cred: Option<(u32, u32)>,
    fds: Vec<RawFd>,
    rlimits: RLimits,
    argv: Vec<CString>,
    envp: Vec<CString>,
    sync_r: RawFd,
    err_w: RawFd,
}

impl ChildContext {
    fn run(&self) -> isize {
        // Block until the parent has finished cgroup placement; EOF means
        // the launch was aborted.
        let mut byte = [0u8; 1];
        match unistd::read(self.sync_r, &mut byte) {
            Ok(1) => {}
            _ => unsafe { libc::_exit(126) },
        }
        if let Err(e) = self.setup_and_exec() {
            self.report(&e);
        }
        unsafe { libc::_exit(127) }
    }

    /// The ordered pre-exec sequence. Ends in `execve`; returning at all
    /// means failure.
    fn setup_and_exec(&self) -> Result<()> {
        unistd::setsid().map_err(|e| Error::Process(format!("setsid: {e}")))?;
        unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) };

        if self.namespaces {
            self.mounts.apply_and_pivot(&self.root)?;
            unistd::chdir("/w").map_err(|e| Error::Process(format!("chdir /w: {e}")))?;
        } else {
            unistd::chdir(&self.workdir)
                .map_err(|e| Error::Process(format!("chdir workdir: {e}")))?;
        }

        // Lift the slot fds above the target range first so dup2 cannot
        // clobber a source that is also a target.
        let floor = self.fds.len() as RawFd;
        let mut high = Vec::with_capacity(self.fds.len());
        for fd in &self.fds {
            let dup = nix::fcntl::fcntl(*fd, FcntlArg::F_DUPFD_CLOEXEC(floor))
                .map_err(|e| Error::Process(format!("dup fd {fd}: {e}")))?;
            high.push(dup);
        }
        for (i, fd) in high.iter().enumerate() {
            unistd::dup2(*fd, i as RawFd)
                .map_err(|e| Error::Process(format!("dup2 -> {i}: {e}")))?;
        }

        if let Some((uid, gid)) = self.cred {
            let gid = Gid::from_raw(gid);
            let uid = Uid::from_raw(uid);
            unistd::setgroups(&[gid]).map_err(|e| Error::Process(format!("setgroups: {e}")))?;
            unistd::setresgid(gid, gid, gid)
                .map_err(|e| Error::Process(format!("setresgid: {e}")))?;
            unistd::setresuid(uid, uid, uid)
                .map_err(|e| Error::Process(format!("setresuid: {e}")))?;
        }

        self.rlimits.apply()?;

        unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if let Some(program) = &self.seccomp {
            seccomp::install(program)?;
        }

        let path = self.resolve_exec()?;
        unistd::execve(&path, &self.argv, &self.envp)
            .map_err(|e| Error::Process(format!("execve: {e}")))?;
        Ok(())
    }

    fn resolve_exec(&self) -> Result<CString> {
        let arg0 = self.argv[0]
            .to_str()
            .map_err(|_| Error::Process("argv[0] is not UTF-8".to_string()))?;
        if arg0.contains('/') {
            return Ok(self.argv[0].clone());
        }
        let path_list = self
            .envp
            .iter()
            .filter_map(|e| e.to_str().ok())
            .find_map(|e| e.strip_prefix("PATH="))
            .unwrap_or("/usr/bin:/bin");
        for dir in path_list.split(':').filter(|d| !d.is_empty()) {
            let candidate = format!("{dir}/{arg0}");
            if unistd::access(candidate.as_str(), nix::unistd::AccessFlags::X_OK).is_ok() {
                return CString::new(candidate)
                    .map_err(|_| Error::Process("resolved path contains NUL".to_string()));
            }
        }
        Err(Error::Process(format!("{arg0}: executable file not found")))
    }

    fn report(&self, err: &Error) {
        let msg = err.to_string();
        let _ = unistd::write(self.err_w, msg.as_bytes());
    }
}
