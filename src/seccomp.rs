//! Seccomp allow-list filters.
//!
//! The filter is compiled once from a config file (one syscall name per
//! line, `#` comments) when the environment builder is constructed, and the
//! resulting BPF program is installed in every child immediately before
//! exec. Anything outside the list traps with SIGSYS, which the engine
//! reports as a dangerous-syscall verdict.

use crate::error::{Error, Result};
use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, TargetArch};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Compile the allow-list at `path` into a reusable BPF program.
pub fn compile(path: &Path) -> Result<Arc<BpfProgram>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Seccomp(format!("read {}: {}", path.display(), e)))?;
    let mut names = Vec::new();
    for line in content.lines() {
        let name = line.split('#').next().unwrap_or("").trim();
        if !name.is_empty() {
            names.push(name);
        }
    }
    if names.is_empty() {
        return Err(Error::Seccomp(format!(
            "{} allows no syscalls; refusing to build an unrunnable filter",
            path.display()
        )));
    }
    compile_names(&names)
}

pub fn compile_names(names: &[&str]) -> Result<Arc<BpfProgram>> {
    let mut rules: BTreeMap<i64, Vec<seccompiler::SeccompRule>> = BTreeMap::new();
    for name in names {
        let nr = lookup(name).ok_or_else(|| Error::Seccomp(format!("unknown syscall: {name}")))?;
        rules.entry(nr).or_default();
    }
    let arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|_| Error::Seccomp(format!("unsupported arch {}", std::env::consts::ARCH)))?;
    let filter = SeccompFilter::new(rules, SeccompAction::Trap, SeccompAction::Allow, arch)
        .map_err(|e| Error::Seccomp(format!("build filter: {e}")))?;
    let program: BpfProgram = filter
        .try_into()
        .map_err(|e| Error::Seccomp(format!("compile filter: {e}")))?;
    Ok(Arc::new(program))
}

/// Install a compiled program in the current process.
pub fn install(program: &BpfProgram) -> Result<()> {
    seccompiler::apply_filter(program).map_err(|e| Error::Seccomp(format!("apply filter: {e}")))
}

fn lookup(name: &str) -> Option<i64> {
    let table: &[(&str, libc::c_long)] = &[
        ("read", libc::SYS_read),
        ("write", libc::SYS_write),
        ("readv", libc::SYS_readv),
        ("writev", libc::SYS_writev),
        ("close", libc::SYS_close),
        ("fstat", libc::SYS_fstat),
        ("lseek", libc::SYS_lseek),
        ("mmap", libc::SYS_mmap),
        ("mremap", libc::SYS_mremap),
        ("mprotect", libc::SYS_mprotect),
        ("munmap", libc::SYS_munmap),
        ("brk", libc::SYS_brk),
        ("madvise", libc::SYS_madvise),
        ("rt_sigaction", libc::SYS_rt_sigaction),
        ("rt_sigprocmask", libc::SYS_rt_sigprocmask),
        ("rt_sigreturn", libc::SYS_rt_sigreturn),
        ("ioctl", libc::SYS_ioctl),
        ("pread64", libc::SYS_pread64),
        ("pwrite64", libc::SYS_pwrite64),
        ("dup", libc::SYS_dup),
        ("dup3", libc::SYS_dup3),
        ("fcntl", libc::SYS_fcntl),
        ("flock", libc::SYS_flock),
        ("openat", libc::SYS_openat),
        ("newfstatat", libc::SYS_newfstatat),
        ("readlinkat", libc::SYS_readlinkat),
        ("faccessat", libc::SYS_faccessat),
        ("getcwd", libc::SYS_getcwd),
        ("chdir", libc::SYS_chdir),
        ("fchdir", libc::SYS_fchdir),
        ("getdents64", libc::SYS_getdents64),
        ("getpid", libc::SYS_getpid),
        ("getppid", libc::SYS_getppid),
        ("gettid", libc::SYS_gettid),
        ("getuid", libc::SYS_getuid),
        ("getgid", libc::SYS_getgid),
        ("geteuid", libc::SYS_geteuid),
        ("getegid", libc::SYS_getegid),
        ("getgroups", libc::SYS_getgroups),
        ("getrlimit", libc::SYS_getrlimit),
        ("getrusage", libc::SYS_getrusage),
        ("sysinfo", libc::SYS_sysinfo),
        ("uname", libc::SYS_uname),
        ("umask", libc::SYS_umask),
        ("exit", libc::SYS_exit),
        ("exit_group", libc::SYS_exit_group),
        ("futex", libc::SYS_futex),
        ("getrandom", libc::SYS_getrandom),
        ("clock_gettime", libc::SYS_clock_gettime),
        ("clock_getres", libc::SYS_clock_getres),
        ("clock_nanosleep", libc::SYS_clock_nanosleep),
        ("nanosleep", libc::SYS_nanosleep),
        ("gettimeofday", libc::SYS_gettimeofday),
        ("times", libc::SYS_times),
        ("sched_yield", libc::SYS_sched_yield),
        ("sched_getaffinity", libc::SYS_sched_getaffinity),
        ("set_tid_address", libc::SYS_set_tid_address),
        ("set_robust_list", libc::SYS_set_robust_list),
        ("rseq", libc::SYS_rseq),
        ("prlimit64", libc::SYS_prlimit64),
        ("execve", libc::SYS_execve),
        ("execveat", libc::SYS_execveat),
        ("wait4", libc::SYS_wait4),
        ("clone", libc::SYS_clone),
        ("clone3", libc::SYS_clone3),
        ("kill", libc::SYS_kill),
        ("tgkill", libc::SYS_tgkill),
        ("sigaltstack", libc::SYS_sigaltstack),
        ("statfs", libc::SYS_statfs),
        ("fstatfs", libc::SYS_fstatfs),
        ("ftruncate", libc::SYS_ftruncate),
        ("fallocate", libc::SYS_fallocate),
        ("fsync", libc::SYS_fsync),
        ("fdatasync", libc::SYS_fdatasync),
        ("pipe2", libc::SYS_pipe2),
        ("epoll_create1", libc::SYS_epoll_create1),
        ("epoll_ctl", libc::SYS_epoll_ctl),
        ("epoll_pwait", libc::SYS_epoll_pwait),
        ("ppoll", libc::SYS_ppoll),
        ("pselect6", libc::SYS_pselect6),
        ("mkdirat", libc::SYS_mkdirat),
        ("unlinkat", libc::SYS_unlinkat),
        ("renameat", libc::SYS_renameat),
        ("linkat", libc::SYS_linkat),
        ("symlinkat", libc::SYS_symlinkat),
        ("fchmod", libc::SYS_fchmod),
        ("fchmodat", libc::SYS_fchmodat),
        ("fchownat", libc::SYS_fchownat),
        ("utimensat", libc::SYS_utimensat),
        ("statx", libc::SYS_statx),
        ("faccessat2", libc::SYS_faccessat2),
        ("close_range", libc::SYS_close_range),
        #[cfg(target_arch = "x86_64")]
        ("open", libc::SYS_open),
        #[cfg(target_arch = "x86_64")]
        ("stat", libc::SYS_stat),
        #[cfg(target_arch = "x86_64")]
        ("lstat", libc::SYS_lstat),
        #[cfg(target_arch = "x86_64")]
        ("access", libc::SYS_access),
        #[cfg(target_arch = "x86_64")]
        ("readlink", libc::SYS_readlink),
        #[cfg(target_arch = "x86_64")]
        ("unlink", libc::SYS_unlink),
        #[cfg(target_arch = "x86_64")]
        ("mkdir", libc::SYS_mkdir),
        #[cfg(target_arch = "x86_64")]
        ("rename", libc::SYS_rename),
        #[cfg(target_arch = "x86_64")]
        ("dup2", libc::SYS_dup2),
        #[cfg(target_arch = "x86_64")]
        ("pipe", libc::SYS_pipe),
        #[cfg(target_arch = "x86_64")]
        ("fork", libc::SYS_fork),
        #[cfg(target_arch = "x86_64")]
        ("vfork", libc::SYS_vfork),
        #[cfg(target_arch = "x86_64")]
        ("poll", libc::SYS_poll),
        #[cfg(target_arch = "x86_64")]
        ("select", libc::SYS_select),
        #[cfg(target_arch = "x86_64")]
        ("arch_prctl", libc::SYS_arch_prctl),
        #[cfg(target_arch = "x86_64")]
        ("time", libc::SYS_time),
    ];
    table
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, nr)| *nr as i64)
}
