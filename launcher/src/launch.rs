//! One launch end to end: resolve, spawn, pump side channels, wait, release.

use std::collections::BTreeMap;
use std::io;
use std::process::{Child, ExitStatus};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::core::manifest::LaunchManifest;
use crate::error::{BindingError, LaunchError, WrapperError};
use crate::exit_codes;
use crate::io::cancel::CancelToken;
use crate::io::config::LauncherConfig;
use crate::io::process::{
    PumpControl, WaitPolicy, join_pump, spawn_collector, spawn_feeder, terminate, wait_supervised,
};
use crate::io::resolver::resolve;
use crate::io::spawner::spawn;
use crate::io::supervisor::{LifecycleSupervisor, ResourceRole};
use crate::io::table::{ChannelTable, SidePump};

/// Per-launch knobs. Built from [`LauncherConfig`] by the CLI.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub timeout: Option<Duration>,
    pub kill_grace: Duration,
    pub poll_interval: Duration,
    pub side_channel_limit_bytes: usize,
    pub cancel: CancelToken,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self::from_config(&LauncherConfig::default())
    }
}

impl LaunchOptions {
    pub fn from_config(cfg: &LauncherConfig) -> Self {
        Self {
            timeout: cfg.timeout(),
            kill_grace: cfg.kill_grace(),
            poll_interval: cfg.poll_interval(),
            side_channel_limit_bytes: cfg.side_channel_limit_bytes,
            cancel: CancelToken::new(),
        }
    }

    fn policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: self.timeout,
            kill_grace: self.kill_grace,
            poll_interval: self.poll_interval,
        }
    }
}

/// Output captured from a side-channel pipe the child wrote to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    /// Bytes discarded beyond the configured limit.
    pub truncated: usize,
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub pid: u32,
    pub status: ExitStatus,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Captured side channels keyed by child descriptor.
    pub captured: BTreeMap<u32, Captured>,
}

impl LaunchOutcome {
    /// Exit code the wrapper should surface for this child.
    pub fn exit_code(&self) -> i32 {
        exit_codes::from_status(&self.status)
    }

    pub fn captured(&self, fd: u32) -> Option<&[u8]> {
        self.captured.get(&fd).map(|c| c.bytes.as_slice())
    }
}

#[derive(Debug)]
enum Pump {
    Feed {
        fd: u32,
        handle: JoinHandle<io::Result<()>>,
    },
    Capture {
        fd: u32,
        handle: JoinHandle<io::Result<(Vec<u8>, usize)>>,
    },
}

impl Pump {
    fn is_finished(&self) -> bool {
        match self {
            Self::Feed { handle, .. } => handle.is_finished(),
            Self::Capture { handle, .. } => handle.is_finished(),
        }
    }
}

/// A started child and everything the wrapper still owns for it.
///
/// Returned without blocking. [`LaunchHandle::wait`] consumes the handle, so
/// the exit status is produced exactly once. Dropping an unwaited handle
/// terminates the child and releases its resources.
#[derive(Debug)]
pub struct LaunchHandle {
    pid: u32,
    child: Option<Child>,
    supervisor: LifecycleSupervisor,
    pumps: Vec<Pump>,
    /// Tells pumps to give up on pipes still held open after the drain window.
    pump_stop: CancelToken,
    policy: WaitPolicy,
    cancel: CancelToken,
}

impl LaunchHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Request termination. Takes effect inside [`LaunchHandle::wait`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this launch from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether the child has exited, without blocking or consuming the status.
    pub fn is_finished(&mut self) -> Result<bool, LaunchError> {
        match self.child.as_mut() {
            Some(child) => child
                .try_wait()
                .map(|status| status.is_some())
                .map_err(|source| LaunchError::Wait { source }),
            None => Ok(true),
        }
    }

    /// Block until the child exits, then release every resource.
    #[instrument(skip_all, fields(pid = self.pid))]
    pub fn wait(mut self) -> Result<LaunchOutcome, WrapperError> {
        let mut child = self.child.take().ok_or_else(|| LaunchError::Wait {
            source: io::Error::other("child already reaped"),
        })?;

        let waited = wait_supervised(&mut child, &self.policy, &self.cancel);
        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(source) => {
                if let Err(err) = terminate(&mut child, self.policy.kill_grace) {
                    warn!(err = %err, "failed to stop child after wait error");
                }
                self.pump_stop.cancel();
                self.supervisor.teardown();
                return Err(LaunchError::Wait { source }.into());
            }
        };

        let captured = self.drain_pumps();
        let report = self.supervisor.teardown();
        debug!(released = report.released(), "launch resources released");
        info!(
            exit_code = exit_codes::from_status(&outcome.status),
            timed_out = outcome.timed_out,
            cancelled = outcome.cancelled,
            "child finished"
        );

        Ok(LaunchOutcome {
            pid: self.pid,
            status: outcome.status,
            timed_out: outcome.timed_out,
            cancelled: outcome.cancelled,
            captured: captured?,
        })
    }

    /// Give the pumps up to the kill grace to see end-of-file, then stop them.
    ///
    /// Anything the child left running may still hold a side channel open;
    /// the wait must not depend on it.
    fn drain_pumps(&mut self) -> Result<BTreeMap<u32, Captured>, LaunchError> {
        let deadline = Instant::now() + self.policy.kill_grace;
        while Instant::now() < deadline && self.pumps.iter().any(|p| !p.is_finished()) {
            thread::sleep(self.policy.poll_interval);
        }
        if self.pumps.iter().any(|p| !p.is_finished()) {
            warn!(
                grace_millis = self.policy.kill_grace.as_millis() as u64,
                "side channels still open after child exit, stopping pumps"
            );
        }
        self.pump_stop.cancel();
        join_pumps(std::mem::take(&mut self.pumps))
    }
}

impl Drop for LaunchHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!(pid = self.pid, "launch handle dropped before wait, terminating child");
            if let Err(err) = terminate(&mut child, self.policy.kill_grace) {
                warn!(err = %err, "failed to terminate child");
            }
        }
        self.pump_stop.cancel();
    }
}

fn join_pumps(pumps: Vec<Pump>) -> Result<BTreeMap<u32, Captured>, LaunchError> {
    let mut captured = BTreeMap::new();
    let mut first_error = None;
    for pump in pumps {
        let (fd, result) = match pump {
            Pump::Feed { fd, handle } => (fd, join_pump(handle).map(|()| None)),
            Pump::Capture { fd, handle } => (
                fd,
                join_pump(handle).map(|(bytes, truncated)| Some(Captured { bytes, truncated })),
            ),
        };
        match result {
            Ok(Some(output)) => {
                captured.insert(fd, output);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(fd, err = %err, "side channel failed");
                first_error.get_or_insert(LaunchError::SideChannel {
                    fd,
                    message: err.to_string(),
                });
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(captured),
    }
}

/// Launch the child and block until it exits.
pub fn launch(
    manifest: &LaunchManifest,
    options: &LaunchOptions,
) -> Result<LaunchOutcome, WrapperError> {
    launch_detached(manifest, options)?.wait()
}

/// Resolve every binding and start the child without waiting for it.
///
/// If resolution or spawning fails, every resource already acquired has been
/// released by the time the error is returned.
#[instrument(skip_all, fields(program = %manifest.program().display()))]
pub fn launch_detached(
    manifest: &LaunchManifest,
    options: &LaunchOptions,
) -> Result<LaunchHandle, WrapperError> {
    let mut supervisor = LifecycleSupervisor::new();
    let table = resolve(manifest, &mut supervisor, &options.cancel)?;

    if options.cancel.is_cancelled() {
        supervisor.teardown();
        return Err(BindingError::Cancelled {
            index: manifest.bindings().len(),
        }
        .into());
    }

    let child = spawn_resolved(manifest, &table, &mut supervisor)?;
    let mut handle = LaunchHandle {
        pid: child.id(),
        child: Some(child),
        supervisor,
        pumps: Vec::with_capacity(table.pumps().len()),
        pump_stop: CancelToken::new(),
        policy: options.policy(),
        cancel: options.cancel.clone(),
    };
    let control = PumpControl {
        stop: handle.pump_stop.clone(),
        poll_interval: options.poll_interval,
    };

    for pump in table.pumps() {
        let fd = pump.fd();
        let end = handle
            .supervisor
            .transfer(pump.resource())
            .ok_or_else(|| LaunchError::SideChannel {
                fd,
                message: "wrapper end of pipe is not live".to_string(),
            })?;
        let started = match pump {
            SidePump::Feed { value, .. } => Pump::Feed {
                fd,
                handle: spawn_feeder(fd, end, value.clone(), control.clone()),
            },
            SidePump::Capture { .. } => Pump::Capture {
                fd,
                handle: spawn_collector(
                    fd,
                    end,
                    options.side_channel_limit_bytes,
                    control.clone(),
                ),
            },
        };
        handle.pumps.push(started);
    }

    debug!(pid = handle.pid, pumps = handle.pumps.len(), "child started");
    Ok(handle)
}

/// Spawn the child from a resolved table.
///
/// On success the wrapper's copies of the child ends are released. On failure
/// every resolved resource is released and the spawn error is returned as is.
fn spawn_resolved(
    manifest: &LaunchManifest,
    table: &ChannelTable,
    supervisor: &mut LifecycleSupervisor,
) -> Result<Child, LaunchError> {
    match spawn(manifest, table) {
        Ok(child) => {
            supervisor.release_role(ResourceRole::ChildEnd);
            Ok(child)
        }
        Err(err) => {
            let report = supervisor.teardown();
            warn!(
                code = err.code(),
                released = report.released(),
                "spawn failed, released resolved bindings"
            );
            Err(err)
        }
    }
}
