//! End-to-end scenarios through the full conversion -> worker -> engine
//! path. Cases that need root (cgroups, namespaces, pid limits) detect the
//! privilege at runtime and skip themselves on unprivileged hosts.

use runbox::wire::WireResponse;
use runbox::{Config, Service, Status};
use std::path::PathBuf;
use std::time::Duration;

fn boot(parallelism: usize) -> (tempfile::TempDir, Service) {
    let dir = tempfile::tempdir().unwrap();
    let conf = Config {
        dir: Some(dir.path().to_path_buf()),
        parallelism,
        mount_conf: PathBuf::from("/nonexistent/mount.json"),
        ..Config::default()
    };
    let service = Service::boot(conf).unwrap();
    (dir, service)
}

fn cgroups_enforced() -> bool {
    (unsafe { libc::geteuid() } == 0) && runbox::cgroup::detect().is_some()
}

fn run(service: &Service, body: &str) -> WireResponse {
    let response = service.execute_json(body);
    assert!(
        response.error.is_none(),
        "request failed: {:?}",
        response.error
    );
    response
}

#[test]
fn hello_world() {
    let (_dir, service) = boot(2);
    let response = run(
        &service,
        r#"{
            "cmd": [{
                "args": ["/bin/echo", "hi"],
                "env": ["PATH=/usr/bin:/bin"],
                "files": [{"content": ""}, {"name": "stdout", "max": 100}, {"name": "stderr", "max": 100}],
                "cpuLimit": 1000000000,
                "memoryLimit": 268435456,
                "procLimit": 16
            }]
        }"#,
    );
    assert_eq!(response.results.len(), 1);
    let result = &response.results[0];
    assert_eq!(result.status, Status::Accepted, "error: {:?}", result.error);
    assert_eq!(result.files.get("stdout").unwrap(), "hi\n");
    service.shutdown();
}

#[test]
fn results_keep_input_order() {
    let (_dir, service) = boot(4);
    let response = run(
        &service,
        r#"{
            "cmd": [
                {"args": ["/bin/echo", "one"], "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 100}, null],
                 "cpuLimit": 1000000000, "memoryLimit": 268435456, "procLimit": 16},
                {"args": ["/bin/echo", "two"], "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 100}, null],
                 "cpuLimit": 1000000000, "memoryLimit": 268435456, "procLimit": 16},
                {"args": ["/bin/echo", "three"], "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 100}, null],
                 "cpuLimit": 1000000000, "memoryLimit": 268435456, "procLimit": 16}
            ]
        }"#,
    );
    let out: Vec<&str> = response
        .results
        .iter()
        .map(|r| r.files.get("stdout").unwrap().as_str())
        .collect();
    assert_eq!(out, vec!["one\n", "two\n", "three\n"]);
    service.shutdown();
}

#[test]
fn cached_artifact_pipeline() {
    let (_dir, service) = boot(2);
    let response = run(
        &service,
        r#"{
            "cmd": [
                {"args": ["/bin/sh", "-c", "printf '#!/bin/sh\necho 42\n' > prog && chmod +x prog"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 1024}, {"name": "stderr", "max": 1024}],
                 "cpuLimit": 2000000000, "memoryLimit": 268435456, "procLimit": 16,
                 "copyOutCached": ["prog"]},
                {"args": ["./prog"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 1024}, {"name": "stderr", "max": 1024}],
                 "cpuLimit": 2000000000, "memoryLimit": 268435456, "procLimit": 16,
                 "copyIn": {"prog": {"fileId": "prog"}}}
            ]
        }"#,
    );
    let compile = &response.results[0];
    assert_eq!(compile.status, Status::Accepted, "error: {:?}", compile.error);
    assert!(compile.file_ids.contains_key("prog"));
    let run_result = &response.results[1];
    assert_eq!(
        run_result.status,
        Status::Accepted,
        "error: {:?} stderr: {:?}",
        run_result.error,
        run_result.files.get("stderr")
    );
    assert_eq!(run_result.files.get("stdout").unwrap(), "42\n");
    service.shutdown();
}

#[test]
fn compile_and_run_cpp() {
    if !std::path::Path::new("/usr/bin/g++").exists() {
        return;
    }
    let (_dir, service) = boot(2);
    let response = run(
        &service,
        r##"{
            "cmd": [
                {"args": ["/usr/bin/g++", "a.cc", "-o", "a"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 10240}, {"name": "stderr", "max": 10240}],
                 "cpuLimit": 10000000000, "memoryLimit": 1073741824, "procLimit": 64,
                 "copyIn": {"a.cc": {"content": "#include <cstdio>\nint main(){printf(\"42\");}\n"}},
                 "copyOutCached": ["a"]},
                {"args": ["./a"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 1024}, {"name": "stderr", "max": 1024}],
                 "cpuLimit": 2000000000, "memoryLimit": 268435456, "procLimit": 16,
                 "copyIn": {"a": {"fileId": "a"}}}
            ]
        }"##,
    );
    let compile = &response.results[0];
    assert_eq!(
        compile.status,
        Status::Accepted,
        "compile stderr: {:?}",
        compile.files.get("stderr")
    );
    let run_result = &response.results[1];
    assert_eq!(run_result.status, Status::Accepted, "error: {:?}", run_result.error);
    assert_eq!(run_result.files.get("stdout").unwrap(), "42");
    service.shutdown();
}

#[test]
fn busy_loop_hits_time_limit() {
    let (_dir, service) = boot(2);
    let response = run(
        &service,
        r#"{
            "cmd": [{
                "args": ["/bin/sh", "-c", "while :; do :; done"],
                "env": ["PATH=/usr/bin:/bin"],
                "files": [null, null, null],
                "cpuLimit": 500000000,
                "memoryLimit": 268435456,
                "procLimit": 16
            }]
        }"#,
    );
    let result = &response.results[0];
    assert_eq!(result.status, Status::TimeLimitExceeded);
    if cgroups_enforced() {
        // Ticker-driven kill: within limit + tick + scheduling slack.
        assert!(Duration::from_nanos(result.run_time) < Duration::from_millis(1600));
    } else {
        // Fallback is the rlimit-cpu backstop at ceil(limit)+1 seconds.
        assert!(Duration::from_nanos(result.run_time) < Duration::from_secs(5));
    }
    service.shutdown();
}

#[test]
fn strict_memory_limit() {
    let (_dir, service) = boot(2);
    // Allocates well past the limit; under a cgroup this is an OOM kill,
    // under plain rlimit-data the allocation fails and dd exits nonzero.
    let response = run(
        &service,
        r#"{
            "cmd": [{
                "args": ["dd", "if=/dev/zero", "of=/dev/null", "bs=512M", "count=1"],
                "env": ["PATH=/usr/bin:/bin"],
                "files": [null, null, {"name": "stderr", "max": 10240}],
                "cpuLimit": 5000000000,
                "memoryLimit": 67108864,
                "procLimit": 16,
                "strictMemoryLimit": true
            }]
        }"#,
    );
    let result = &response.results[0];
    if cgroups_enforced() {
        assert_eq!(result.status, Status::MemoryLimitExceeded);
        assert_eq!(result.signal, Some(libc::SIGKILL));
    } else {
        assert_ne!(result.status, Status::Accepted);
    }
    service.shutdown();
}

#[test]
fn pipe_between_commands() {
    let (_dir, service) = boot(2);
    let response = run(
        &service,
        r#"{
            "cmd": [
                {"args": ["/bin/echo", "ping"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, null, null],
                 "cpuLimit": 1000000000, "memoryLimit": 268435456, "procLimit": 16},
                {"args": ["tr", "a-z", "A-Z"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 1024}, null],
                 "cpuLimit": 1000000000, "memoryLimit": 268435456, "procLimit": 16}
            ],
            "pipeMapping": [{"in": {"index": 0, "fd": 1}, "out": {"index": 1, "fd": 0}}]
        }"#,
    );
    assert_eq!(response.results[0].status, Status::Accepted);
    let reader = &response.results[1];
    assert_eq!(reader.status, Status::Accepted, "error: {:?}", reader.error);
    assert_eq!(reader.files.get("stdout").unwrap(), "PING\n");
    service.shutdown();
}

#[test]
fn pipe_mapping_zero_max_delivers_nothing() {
    let (_dir, service) = boot(2);
    let response = run(
        &service,
        r#"{
            "cmd": [
                {"args": ["/bin/echo", "dropped"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, null, null],
                 "cpuLimit": 1000000000, "memoryLimit": 268435456, "procLimit": 16},
                {"args": ["/bin/cat"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 1024}, null],
                 "cpuLimit": 1000000000, "memoryLimit": 268435456, "procLimit": 16}
            ],
            "pipeMapping": [{"in": {"index": 0, "fd": 1}, "out": {"index": 1, "fd": 0}, "max": 0}]
        }"#,
    );
    let reader = &response.results[1];
    assert_eq!(reader.status, Status::Accepted, "error: {:?}", reader.error);
    assert_eq!(reader.files.get("stdout").unwrap(), "");
    service.shutdown();
}

#[test]
fn cancellation_stops_sleeping_command() {
    let (_dir, service) = boot(2);
    let body = r#"{
        "cmd": [{
            "args": ["/bin/sleep", "3600"],
            "env": ["PATH=/usr/bin:/bin"],
            "files": [null, null, null],
            "cpuLimit": 10000000000,
            "realCpuLimit": 3600000000000,
            "memoryLimit": 268435456,
            "procLimit": 16
        }]
    }"#;
    let wire = runbox::wire::parse_request(body).unwrap();
    let request = service.converter.request(wire).unwrap();
    let submission = service.worker.submit(request).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    submission.cancel();
    let response = submission.wait().unwrap();
    let result = &response.results[0];
    assert_eq!(result.status(), Status::Cancelled);
    assert!(result.wall_time < Duration::from_secs(2));
    service.shutdown();
}

#[test]
fn empty_argv_is_invalid_request() {
    let (_dir, service) = boot(2);
    let response = service.execute_json(
        r#"{
            "cmd": [{
                "args": [],
                "files": [null, null, null],
                "cpuLimit": 1000000000,
                "memoryLimit": 268435456,
                "procLimit": 16
            }]
        }"#,
    );
    let error = response.error.expect("request must be rejected");
    assert!(error.contains("Invalid request"), "got: {error}");
    assert!(response.results.is_empty());
    service.shutdown();
}

#[test]
fn proc_limit_blocks_fork() {
    if !cgroups_enforced() {
        return;
    }
    let (_dir, service) = boot(2);
    let response = run(
        &service,
        r#"{
            "cmd": [{
                "args": ["/bin/sh", "-c", "/bin/sh -c 'echo forked'"],
                "env": ["PATH=/usr/bin:/bin"],
                "files": [null, {"name": "stdout", "max": 1024}, {"name": "stderr", "max": 1024}],
                "cpuLimit": 2000000000,
                "memoryLimit": 268435456,
                "procLimit": 1
            }]
        }"#,
    );
    let result = &response.results[0];
    assert!(
        matches!(result.status, Status::NonzeroExitStatus | Status::Signalled),
        "got: {:?}",
        result.status
    );
    service.shutdown();
}

#[test]
fn collector_truncation_sets_flag_not_error() {
    let (_dir, service) = boot(2);
    let response = run(
        &service,
        r#"{
            "cmd": [{
                "args": ["/bin/sh", "-c", "printf '%0100d' 7"],
                "env": ["PATH=/usr/bin:/bin"],
                "files": [null, {"name": "stdout", "max": 10}, null],
                "cpuLimit": 1000000000,
                "memoryLimit": 268435456,
                "procLimit": 16
            }]
        }"#,
    );
    let result = &response.results[0];
    assert_eq!(result.status, Status::Accepted, "error: {:?}", result.error);
    assert_eq!(result.files.get("stdout").unwrap().len(), 10);
    assert_eq!(result.truncated, vec!["stdout".to_string()]);
    service.shutdown();
}

#[test]
fn banned_syscall_is_dangerous() {
    let dir = tempfile::tempdir().unwrap();
    // Everything a loader plausibly needs, except any way to write.
    let mut allowlist = String::from(
        "read\nreadv\nclose\nfstat\nlseek\nmmap\nmremap\nmprotect\nmunmap\nbrk\nmadvise\n\
rt_sigaction\nrt_sigprocmask\nrt_sigreturn\nioctl\npread64\ndup\ndup3\nfcntl\n\
openat\nnewfstatat\nstatx\nreadlinkat\nfaccessat\nfaccessat2\ngetcwd\ngetdents64\n\
getpid\ngetppid\ngettid\ngetuid\ngetgid\ngeteuid\ngetegid\ngetrlimit\ngetrusage\n\
uname\numask\nexit\nexit_group\nfutex\ngetrandom\nclock_gettime\nclock_nanosleep\n\
nanosleep\nsched_getaffinity\nset_tid_address\nset_robust_list\nrseq\nprlimit64\n\
execve\nsigaltstack\nclose_range\n",
    );
    if cfg!(target_arch = "x86_64") {
        allowlist.push_str("stat\nlstat\naccess\nreadlink\npoll\narch_prctl\nopen\n");
    }
    let conf_path = dir.path().join("seccomp.conf");
    std::fs::write(&conf_path, allowlist).unwrap();
    let conf = Config {
        dir: Some(dir.path().join("work")),
        parallelism: 1,
        mount_conf: PathBuf::from("/nonexistent/mount.json"),
        seccomp_conf: Some(conf_path),
        ..Config::default()
    };
    let service = Service::boot(conf).unwrap();
    let response = run(
        &service,
        r#"{
            "cmd": [{
                "args": ["/bin/echo", "hi"],
                "env": ["PATH=/usr/bin:/bin"],
                "files": [null, null, null],
                "cpuLimit": 1000000000,
                "memoryLimit": 268435456,
                "procLimit": 16
            }]
        }"#,
    );
    let result = &response.results[0];
    assert_eq!(result.status, Status::DangerousSyscall, "got: {:?}", result);
    assert_eq!(result.signal, Some(libc::SIGSYS));
    service.shutdown();
}

#[test]
fn cached_content_is_byte_identical_across_commands() {
    let (_dir, service) = boot(2);
    let response = run(
        &service,
        r#"{
            "cmd": [
                {"args": ["/bin/sh", "-c", "printf 'payload-bytes' > blob"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, null, null],
                 "cpuLimit": 2000000000, "memoryLimit": 268435456, "procLimit": 16,
                 "copyOutCached": ["blob"]},
                {"args": ["/bin/cat", "blob"],
                 "env": ["PATH=/usr/bin:/bin"],
                 "files": [null, {"name": "stdout", "max": 1024}, null],
                 "cpuLimit": 2000000000, "memoryLimit": 268435456, "procLimit": 16,
                 "copyIn": {"blob": {"fileId": "blob"}}}
            ]
        }"#,
    );
    assert_eq!(
        response.results[1].files.get("stdout").unwrap(),
        "payload-bytes"
    );
    service.shutdown();
}
