//! Channel table: the fully resolved view of one launch.
//!
//! Built only by the resolver and published once every binding has a live
//! resource. It never holds a pending binding and is not mutated afterwards.

use std::collections::BTreeMap;
use std::os::fd::RawFd;

use crate::core::argv::merge_args;
use crate::core::manifest::{ChannelId, Direction};
use crate::io::supervisor::ResourceId;

/// A descriptor the child receives at number `fd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub fd: u32,
    /// The wrapper-side descriptor that will be duplicated onto `fd`.
    pub raw: RawFd,
    pub direction: Direction,
    pub resource: ResourceId,
    pub binding_index: usize,
}

/// A resolved parameter binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterEntry {
    pub channel: ChannelId,
    pub value: String,
    pub resource: ResourceId,
}

/// Work the wrapper does on its own end of a side-channel pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidePump {
    /// Write `value` into the pipe, then close it.
    Feed {
        fd: u32,
        resource: ResourceId,
        value: String,
    },
    /// Read everything the child writes until it closes its end.
    Capture { fd: u32, resource: ResourceId },
}

impl SidePump {
    pub fn fd(&self) -> u32 {
        match self {
            Self::Feed { fd, .. } | Self::Capture { fd, .. } => *fd,
        }
    }

    pub fn resource(&self) -> ResourceId {
        match self {
            Self::Feed { resource, .. } | Self::Capture { resource, .. } => *resource,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelTable {
    descriptors: BTreeMap<u32, DescriptorEntry>,
    parameters: Vec<ParameterEntry>,
    pumps: Vec<SidePump>,
}

impl ChannelTable {
    pub fn builder() -> ChannelTableBuilder {
        ChannelTableBuilder::default()
    }

    /// Bound descriptors in ascending descriptor order.
    pub fn descriptors(&self) -> impl Iterator<Item = &DescriptorEntry> {
        self.descriptors.values()
    }

    /// Parameter bindings in manifest order.
    pub fn parameters(&self) -> &[ParameterEntry] {
        &self.parameters
    }

    /// Environment entries in manifest order.
    pub fn env(&self) -> impl Iterator<Item = (&str, &str)> {
        self.parameters.iter().filter_map(|p| match &p.channel {
            ChannelId::Env(name) => Some((name.as_str(), p.value.as_str())),
            _ => None,
        })
    }

    /// Final argument vector: bound positional values, then `static_args`.
    pub fn argv(&self, static_args: &[String]) -> Vec<String> {
        let positional = self.parameters.iter().filter_map(|p| match p.channel {
            ChannelId::Arg(position) => Some((position, p.value.as_str())),
            _ => None,
        });
        merge_args(static_args, positional)
    }

    pub fn pumps(&self) -> &[SidePump] {
        &self.pumps
    }
}

/// Accumulates resolved entries; only [`ChannelTableBuilder::publish`] yields a table.
#[derive(Debug, Default)]
pub struct ChannelTableBuilder {
    table: ChannelTable,
}

impl ChannelTableBuilder {
    pub fn descriptor(&mut self, entry: DescriptorEntry) -> &mut Self {
        self.table.descriptors.insert(entry.fd, entry);
        self
    }

    pub fn parameter(&mut self, entry: ParameterEntry) -> &mut Self {
        self.table.parameters.push(entry);
        self
    }

    pub fn pump(&mut self, pump: SidePump) -> &mut Self {
        self.table.pumps.push(pump);
        self
    }

    pub fn publish(self) -> ChannelTable {
        self.table
    }
}
