//! Lifecycle supervisor: owns every resource resolved for one launch.
//!
//! Acquisition and release are paired on every exit path. Resources are
//! released by an explicit [`LifecycleSupervisor::teardown`] or, failing that,
//! when the supervisor is dropped (including during unwinding).

use std::os::fd::{AsRawFd, OwnedFd};

use tracing::{debug, warn};

use crate::core::manifest::ChannelId;
use crate::error::TeardownError;

/// Handle to one tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(usize);

/// What a tracked resource is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRole {
    /// Descriptor to be attached in the child's descriptor table.
    ChildEnd,
    /// The wrapper's end of a side-channel pipe.
    WrapperEnd,
    /// Resolved parameter string (environment variable or argument).
    Parameter,
}

#[derive(Debug)]
enum Handle {
    Descriptor(OwnedFd),
    Value(String),
}

#[derive(Debug)]
enum State {
    Live(Handle),
    /// Ownership moved out (to a side-channel pump); the new owner closes it.
    Transferred,
    Released,
}

/// Ownership record pairing a binding with its live handle or value.
#[derive(Debug)]
struct ResolvedResource {
    binding_index: usize,
    channel: ChannelId,
    role: ResourceRole,
    state: State,
}

impl ResolvedResource {
    fn is_live(&self) -> bool {
        matches!(self.state, State::Live(_))
    }
}

/// Counts from one teardown pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub descriptors_closed: usize,
    pub values_discarded: usize,
}

impl TeardownReport {
    pub fn released(&self) -> usize {
        self.descriptors_closed + self.values_discarded
    }
}

#[derive(Debug, Default)]
pub struct LifecycleSupervisor {
    resources: Vec<ResolvedResource>,
}

impl LifecycleSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_descriptor(
        &mut self,
        binding_index: usize,
        channel: ChannelId,
        role: ResourceRole,
        fd: OwnedFd,
    ) -> ResourceId {
        debug!(binding_index, %channel, ?role, raw = fd.as_raw_fd(), "tracking descriptor");
        self.push(binding_index, channel, role, Handle::Descriptor(fd))
    }

    pub fn track_value(
        &mut self,
        binding_index: usize,
        channel: ChannelId,
        value: String,
    ) -> ResourceId {
        debug!(binding_index, %channel, "tracking parameter");
        self.push(
            binding_index,
            channel,
            ResourceRole::Parameter,
            Handle::Value(value),
        )
    }

    fn push(
        &mut self,
        binding_index: usize,
        channel: ChannelId,
        role: ResourceRole,
        handle: Handle,
    ) -> ResourceId {
        self.resources.push(ResolvedResource {
            binding_index,
            channel,
            role,
            state: State::Live(handle),
        });
        ResourceId(self.resources.len() - 1)
    }

    /// Move a live descriptor out of the supervisor. The caller owns the close.
    pub fn transfer(&mut self, id: ResourceId) -> Option<OwnedFd> {
        let resource = self.resources.get_mut(id.0)?;
        if !matches!(resource.state, State::Live(Handle::Descriptor(_))) {
            return None;
        }
        match std::mem::replace(&mut resource.state, State::Transferred) {
            State::Live(Handle::Descriptor(fd)) => Some(fd),
            _ => None,
        }
    }

    /// Release one resource.
    ///
    /// Fails with [`TeardownError::ResourceAlreadyReleased`] if the resource was
    /// already released or transferred; nothing is closed twice.
    pub fn release(&mut self, id: ResourceId) -> Result<(), TeardownError> {
        let Some(resource) = self.resources.get_mut(id.0) else {
            return Err(TeardownError::UnknownResource { resource: id.0 });
        };
        match release_one(resource) {
            Some(_) => Ok(()),
            None => Err(TeardownError::ResourceAlreadyReleased {
                resource: id.0,
                channel: resource.channel.clone(),
            }),
        }
    }

    /// Release every live resource with `role`.
    pub fn release_role(&mut self, role: ResourceRole) -> TeardownReport {
        let mut report = TeardownReport::default();
        for resource in self.resources.iter_mut().filter(|r| r.role == role) {
            tally(&mut report, release_one(resource));
        }
        report
    }

    /// Release every live resource. Calling it again has no further effect.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for resource in &mut self.resources {
            tally(&mut report, release_one(resource));
        }
        if report.released() > 0 {
            debug!(
                descriptors_closed = report.descriptors_closed,
                values_discarded = report.values_discarded,
                "teardown released resources"
            );
        }
        report
    }

    /// Number of resources still owned and open.
    pub fn live_count(&self) -> usize {
        self.resources.iter().filter(|r| r.is_live()).count()
    }

    /// Number of descriptors still owned and open.
    pub fn open_descriptors(&self) -> usize {
        self.resources
            .iter()
            .filter(|r| matches!(r.state, State::Live(Handle::Descriptor(_))))
            .count()
    }
}

impl Drop for LifecycleSupervisor {
    fn drop(&mut self) {
        let report = self.teardown();
        if report.released() > 0 {
            warn!(
                released = report.released(),
                "supervisor dropped with live resources"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Released {
    Descriptor,
    Value,
}

fn release_one(resource: &mut ResolvedResource) -> Option<Released> {
    if !resource.is_live() {
        return None;
    }
    debug!(
        binding_index = resource.binding_index,
        channel = %resource.channel,
        role = ?resource.role,
        "releasing"
    );
    match std::mem::replace(&mut resource.state, State::Released) {
        State::Live(Handle::Descriptor(fd)) => {
            drop(fd);
            Some(Released::Descriptor)
        }
        State::Live(Handle::Value(value)) => {
            drop(value);
            Some(Released::Value)
        }
        State::Transferred | State::Released => None,
    }
}

fn tally(report: &mut TeardownReport, released: Option<Released>) {
    match released {
        Some(Released::Descriptor) => report.descriptors_closed += 1,
        Some(Released::Value) => report.values_discarded += 1,
        None => {}
    }
}
