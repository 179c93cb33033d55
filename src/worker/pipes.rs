//! Pipe-mapping planning: all pipes are opened before any command starts
//! so both endpoints can be handed to their respective executions.

use crate::envexec::file::{pipe_pair, Fd};
use crate::envexec::PipeMapping;
use crate::error::Result;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use std::thread::JoinHandle;

pub struct PlannedPipes {
    endpoints: HashMap<(usize, usize), Fd>,
    relays: Vec<JoinHandle<()>>,
}

impl PlannedPipes {
    pub fn plan(mappings: &[PipeMapping]) -> Result<Self> {
        let mut endpoints = HashMap::new();
        let mut relays = Vec::new();
        for m in mappings {
            match m.max {
                None => {
                    let (r, w) = pipe_pair()?;
                    endpoints.insert((m.src.index, m.src.fd), w);
                    endpoints.insert((m.dst.index, m.dst.fd), r);
                }
                Some(max) => {
                    // A capped mapping interposes a relay: src -> relay -> dst.
                    let (src_r, src_w) = pipe_pair()?;
                    let (dst_r, dst_w) = pipe_pair()?;
                    relays.push(std::thread::spawn(move || relay(src_r, dst_w, max)));
                    endpoints.insert((m.src.index, m.src.fd), src_w);
                    endpoints.insert((m.dst.index, m.dst.fd), dst_r);
                }
            }
        }
        Ok(Self { endpoints, relays })
    }

    /// Remove the prepared endpoint for a command fd slot, if any.
    pub fn take(&mut self, index: usize, fd: usize) -> Option<Fd> {
        self.endpoints.remove(&(index, fd))
    }

    pub fn endpoint_keys(&self) -> Vec<(usize, usize)> {
        self.endpoints.keys().copied().collect()
    }

    /// Drop unclaimed endpoints (EOF for the peer) and join the relays.
    pub fn finish(mut self) {
        self.endpoints.clear();
        for relay in self.relays.drain(..) {
            let _ = relay.join();
        }
    }
}

/// Copy at most `max` bytes, close the downstream end, then keep draining
/// the upstream so its writer never blocks. `max == 0` relays nothing: the
/// reader sees immediate EOF.
fn relay(src_r: Fd, dst_w: Fd, max: u64) {
    let mut from = unsafe { File::from_raw_fd(src_r.into_raw()) };
    let mut to = Some(unsafe { File::from_raw_fd(dst_w.into_raw()) });
    let mut remaining = max;
    if remaining == 0 {
        to = None;
    }
    let mut chunk = [0u8; 8192];
    loop {
        match from.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let allowed = (remaining as usize).min(n);
                if allowed > 0 {
                    if let Some(w) = to.as_mut() {
                        if w.write_all(&chunk[..allowed]).is_err() {
                            to = None;
                        }
                    }
                    remaining -= allowed as u64;
                }
                if remaining == 0 {
                    to = None;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envexec::PipeEndpoint;

    fn mapping(max: Option<u64>) -> PipeMapping {
        PipeMapping {
            src: PipeEndpoint { index: 0, fd: 1 },
            dst: PipeEndpoint { index: 1, fd: 0 },
            max,
        }
    }

    #[test]
    fn test_plain_mapping_streams() {
        let mut pipes = PlannedPipes::plan(&[mapping(None)]).unwrap();
        let w = pipes.take(0, 1).unwrap();
        let r = pipes.take(1, 0).unwrap();
        let mut wf = unsafe { File::from_raw_fd(w.into_raw()) };
        wf.write_all(b"ping").unwrap();
        drop(wf);
        let mut rf = unsafe { File::from_raw_fd(r.into_raw()) };
        let mut buf = Vec::new();
        rf.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");
        pipes.finish();
    }

    #[test]
    fn test_capped_mapping_cuts_at_max() {
        let mut pipes = PlannedPipes::plan(&[mapping(Some(4))]).unwrap();
        let w = pipes.take(0, 1).unwrap();
        let r = pipes.take(1, 0).unwrap();
        let mut wf = unsafe { File::from_raw_fd(w.into_raw()) };
        wf.write_all(b"pingpong").unwrap();
        drop(wf);
        let mut rf = unsafe { File::from_raw_fd(r.into_raw()) };
        let mut buf = Vec::new();
        rf.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");
        pipes.finish();
    }

    #[test]
    fn test_zero_max_relays_nothing() {
        let mut pipes = PlannedPipes::plan(&[mapping(Some(0))]).unwrap();
        let w = pipes.take(0, 1).unwrap();
        let r = pipes.take(1, 0).unwrap();
        let mut wf = unsafe { File::from_raw_fd(w.into_raw()) };
        wf.write_all(b"dropped").unwrap();
        drop(wf);
        let mut rf = unsafe { File::from_raw_fd(r.into_raw()) };
        let mut buf = Vec::new();
        rf.read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
        pipes.finish();
    }

    #[test]
    fn test_unclaimed_endpoints_closed_on_finish() {
        let mut pipes = PlannedPipes::plan(&[mapping(None)]).unwrap();
        let r = pipes.take(1, 0).unwrap();
        pipes.finish();
        let mut rf = unsafe { File::from_raw_fd(r.into_raw()) };
        let mut buf = Vec::new();
        assert_eq!(rf.read_to_end(&mut buf).unwrap(), 0);
    }
}
