//! Owned file descriptors, memfd staging and capped collector drains.

use crate::error::{Error, Result};
use nix::fcntl::OFlag;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::thread::JoinHandle;

/// RAII wrapper over a raw fd; closed on drop on every exit path.
#[derive(Debug)]
pub struct Fd(RawFd);

impl Fd {
    pub fn from_raw(fd: RawFd) -> Self {
        Fd(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Release ownership without closing.
    pub fn into_raw(self) -> RawFd {
        let fd = self.0;
        std::mem::forget(self);
        fd
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = unistd::close(self.0);
    }
}

/// Close-on-exec pipe pair `(read, write)`.
pub fn pipe_pair() -> Result<(Fd, Fd)> {
    let (r, w) = unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| Error::Process(format!("pipe2: {e}")))?;
    Ok((Fd(r), Fd(w)))
}

/// Stage literal content into a memfd, rewound to the start so the child
/// reads it as a regular input stream.
pub fn memfd_with(name: &str, content: &[u8]) -> Result<Fd> {
    let cname = CString::new(name).map_err(|_| Error::Process("memfd name".to_string()))?;
    let fd = memfd_create(&cname, MemFdCreateFlag::MFD_CLOEXEC)
        .map_err(|e| Error::Process(format!("memfd_create: {e}")))?;
    let mut file = unsafe { File::from_raw_fd(fd) };
    file.write_all(content)
        .map_err(|e| Error::Process(format!("memfd write: {e}")))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| Error::Process(format!("memfd rewind: {e}")))?;
    Ok(Fd(file.into_raw_fd()))
}

pub fn open_null() -> Result<Fd> {
    let fd = nix::fcntl::open(
        "/dev/null",
        OFlag::O_RDWR | OFlag::O_CLOEXEC,
        nix::sys::stat::Mode::empty(),
    )
    .map_err(|e| Error::Process(format!("open /dev/null: {e}")))?;
    Ok(Fd(fd))
}

pub fn open_host(path: &std::path::Path) -> Result<Fd> {
    let fd = nix::fcntl::open(
        path,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        nix::sys::stat::Mode::empty(),
    )
    .map_err(|e| Error::Process(format!("open {}: {}", path.display(), e)))?;
    Ok(Fd(fd))
}

/// A collector drain: reads at most `max` bytes off a pipe, then keeps
/// consuming (and discarding) so the writer never blocks on a full pipe.
pub struct Collector {
    pub name: String,
    handle: JoinHandle<(Vec<u8>, bool)>,
}

impl Collector {
    pub fn spawn(name: String, max: u64, read_end: Fd) -> Self {
        let handle = std::thread::spawn(move || drain(read_end, max));
        Collector { name, handle }
    }

    /// Join the drain thread; returns the collected bytes and whether the
    /// stream was truncated at the cap.
    pub fn finish(self) -> (String, Vec<u8>, bool) {
        let (data, truncated) = self.handle.join().unwrap_or_else(|_| (Vec::new(), false));
        (self.name, data, truncated)
    }
}

fn drain(read_end: Fd, max: u64) -> (Vec<u8>, bool) {
    let mut file = unsafe { File::from_raw_fd(read_end.into_raw()) };
    let mut data = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if truncated {
                    continue;
                }
                let room = (max as usize).saturating_sub(data.len());
                if n > room {
                    data.extend_from_slice(&chunk[..room]);
                    truncated = true;
                } else {
                    data.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    (data, truncated)
}
