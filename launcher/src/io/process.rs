//! Side-channel pumps and supervised waiting on a running child.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::cancel::CancelToken;

/// How long to wait for a child and how to stop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Kill the child once this much time has passed. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Granularity for timeout and cancellation checks.
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            kill_grace: Duration::from_millis(2_000),
            poll_interval: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Wait for `child`, terminating it on timeout or cancellation.
#[instrument(skip_all, fields(pid = child.id()))]
pub fn wait_supervised(
    child: &mut Child,
    policy: &WaitPolicy,
    cancel: &CancelToken,
) -> io::Result<WaitOutcome> {
    let started = Instant::now();
    loop {
        if cancel.is_cancelled() {
            warn!("launch cancelled, terminating child");
            let status = terminate(child, policy.kill_grace)?;
            return Ok(WaitOutcome {
                status,
                timed_out: false,
                cancelled: true,
            });
        }

        let step = match policy.timeout {
            Some(timeout) => {
                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    warn!(
                        timeout_millis = timeout.as_millis() as u64,
                        "child timed out, terminating"
                    );
                    let status = terminate(child, policy.kill_grace)?;
                    return Ok(WaitOutcome {
                        status,
                        timed_out: true,
                        cancelled: false,
                    });
                }
                policy.poll_interval.min(timeout - elapsed)
            }
            None => policy.poll_interval,
        };

        if let Some(status) = child.wait_timeout(step)? {
            debug!(exit_code = ?status.code(), "child exited");
            return Ok(WaitOutcome {
                status,
                timed_out: false,
                cancelled: false,
            });
        }
    }
}

/// Ask the child's process group to stop with SIGTERM, then SIGKILL it after
/// `grace`.
///
/// Signalling the group also reaches whatever the child started, so nothing
/// it spawned keeps a side channel open past the stop.
pub fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    let pid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    signal_group(pid, libc::SIGTERM)?;
    if let Some(status) = child.wait_timeout(grace)? {
        return Ok(status);
    }
    warn!(
        grace_millis = grace.as_millis() as u64,
        "child ignored SIGTERM, killing"
    );
    signal_group(pid, libc::SIGKILL)?;
    child.wait()
}

/// Send `signal` to the process group led by the unreaped child `pid`, or to
/// the child alone when it does not lead a group.
fn signal_group(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory preconditions; `pid` is unreaped, so neither
    // the pid nor a group with that id can belong to anyone else.
    if unsafe { libc::kill(-pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        return Err(err);
    }
    // SAFETY: as above.
    if unsafe { libc::kill(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Ok(()),
        _ => Err(err),
    }
}

/// How a pump thread notices it should give up on its pipe.
#[derive(Debug, Clone)]
pub struct PumpControl {
    /// Set once the wrapper stops waiting for the pipe to close.
    pub stop: CancelToken,
    /// How long to block on the pipe between checks of `stop`.
    pub poll_interval: Duration,
}

/// Write `value` into the wrapper end of an input pipe, then close it.
///
/// A child that exits without reading everything is not an error, and the
/// rest of `value` is dropped once `control.stop` is set.
pub fn spawn_feeder(
    fd: u32,
    end: OwnedFd,
    value: String,
    control: PumpControl,
) -> thread::JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        set_nonblocking(&end)?;
        let mut file = File::from(end);
        let mut pending = value.as_bytes();
        while !pending.is_empty() {
            match file.write(pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => pending = &pending[n..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if control.stop.is_cancelled() {
                        warn!(fd, unwritten = pending.len(), "side channel input abandoned");
                        return Ok(());
                    }
                    wait_ready(&file, libc::POLLOUT, control.poll_interval)?;
                }
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(fd, "child closed side channel before reading all input");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    })
}

/// Collect everything written to the wrapper end of an output pipe.
///
/// Returns the kept bytes and the number of bytes discarded beyond `limit`.
/// Reading ends at end-of-file, or once `control.stop` is set and the pipe
/// has nothing more to give.
pub fn spawn_collector(
    fd: u32,
    end: OwnedFd,
    limit: usize,
    control: PumpControl,
) -> thread::JoinHandle<io::Result<(Vec<u8>, usize)>> {
    thread::spawn(move || {
        set_nonblocking(&end)?;
        let mut file = File::from(end);
        let mut out = LimitedBuffer::new(limit);
        let mut chunk = [0u8; 8192];
        loop {
            match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.push(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if control.stop.is_cancelled() {
                        warn!(fd, "side channel still held open, capture cut short");
                        break;
                    }
                    wait_ready(&file, libc::POLLIN, control.poll_interval)?;
                }
                Err(err) => return Err(err),
            }
        }
        if out.truncated > 0 {
            warn!(fd, truncated = out.truncated, "side channel output truncated");
        }
        Ok((out.kept, out.truncated))
    })
}

/// Join a pump thread, mapping a panic to an error.
pub fn join_pump<T>(handle: thread::JoinHandle<io::Result<T>>) -> io::Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(io::Error::other("side channel thread panicked")),
    }
}

/// Bytes kept up to a limit, plus a count of what was dropped past it.
#[derive(Debug)]
struct LimitedBuffer {
    kept: Vec<u8>,
    truncated: usize,
    limit: usize,
}

impl LimitedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            kept: Vec::new(),
            truncated: 0,
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let keep = chunk.len().min(self.limit.saturating_sub(self.kept.len()));
        self.kept.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is an open descriptor owned by `fd` for the whole call.
    // Only the wrapper's own open file description is changed.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 || libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Block until `fd` is ready for `events` or `interval` passes.
fn wait_ready(fd: &impl AsRawFd, events: libc::c_short, interval: Duration) -> io::Result<()> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events,
        revents: 0,
    };
    let timeout = libc::c_int::try_from(interval.as_millis())
        .unwrap_or(libc::c_int::MAX)
        .max(1);
    // SAFETY: `pollfd` is a single valid entry for the duration of the call.
    if unsafe { libc::poll(&mut pollfd, 1, timeout) } < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(())
}
