//! Binding resolver: turns manifest bindings into live resources.
//!
//! Resolution runs in manifest order on the calling thread and is
//! all-or-nothing. If any binding fails, everything already acquired for the
//! manifest is released before the error is returned.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use tracing::{debug, instrument, warn};

use crate::core::manifest::{BindingPlan, ChannelId, Direction, LaunchManifest};
use crate::error::BindingError;
use crate::io::cancel::CancelToken;
use crate::io::pipe::{duplicate_stream, pipe};
use crate::io::supervisor::{LifecycleSupervisor, ResourceRole};
use crate::io::table::{
    ChannelTable, ChannelTableBuilder, DescriptorEntry, ParameterEntry, SidePump,
};

/// Resolve every binding in `manifest`, tracking each resource in `supervisor`.
///
/// On failure the supervisor has been torn down and holds no live resource.
#[instrument(skip_all, fields(bindings = manifest.bindings().len()))]
pub fn resolve(
    manifest: &LaunchManifest,
    supervisor: &mut LifecycleSupervisor,
    cancel: &CancelToken,
) -> Result<ChannelTable, BindingError> {
    let mut builder = ChannelTable::builder();

    for (index, (binding, plan)) in manifest
        .bindings()
        .iter()
        .zip(manifest.plans())
        .enumerate()
    {
        let step = if cancel.is_cancelled() {
            Err(BindingError::Cancelled { index })
        } else {
            resolve_one(index, &binding.channel, plan, supervisor, &mut builder)
        };

        if let Err(err) = step {
            let report = supervisor.teardown();
            warn!(
                index,
                channel = %binding.channel,
                code = err.code(),
                released = report.released(),
                "binding failed, rolled back earlier bindings"
            );
            return Err(err);
        }
    }

    let table = builder.publish();
    debug!(
        descriptors = table.descriptors().count(),
        parameters = table.parameters().len(),
        pumps = table.pumps().len(),
        "channel table published"
    );
    Ok(table)
}

fn resolve_one(
    index: usize,
    channel: &ChannelId,
    plan: &BindingPlan,
    supervisor: &mut LifecycleSupervisor,
    builder: &mut ChannelTableBuilder,
) -> Result<(), BindingError> {
    match plan {
        BindingPlan::File {
            fd,
            path,
            direction,
            append,
        } => {
            let file = open_path(path, *direction, *append).map_err(|source| {
                BindingError::PathUnavailable {
                    index,
                    channel: channel.clone(),
                    path: path.clone(),
                    source,
                }
            })?;
            attach(index, channel, *fd, *direction, OwnedFd::from(file), supervisor, builder);
        }
        BindingPlan::Inherit { fd, stream } => {
            let owned =
                duplicate_stream(*stream).map_err(|source| BindingError::StreamUnavailable {
                    index,
                    channel: channel.clone(),
                    stream: *stream,
                    source,
                })?;
            attach(index, channel, *fd, stream.direction(), owned, supervisor, builder);
        }
        BindingPlan::Pipe {
            fd,
            direction,
            feed,
        } => {
            let pipe = pipe().map_err(|source| BindingError::PipeCreationFailed {
                index,
                channel: channel.clone(),
                source,
            })?;
            let (child_end, wrapper_end) = match direction {
                Direction::Read => (pipe.reader, pipe.writer),
                Direction::Write => (pipe.writer, pipe.reader),
            };
            attach(index, channel, *fd, *direction, child_end, supervisor, builder);
            let resource = supervisor.track_descriptor(
                index,
                channel.clone(),
                ResourceRole::WrapperEnd,
                wrapper_end,
            );
            let pump = match direction {
                Direction::Read => SidePump::Feed {
                    fd: *fd,
                    resource,
                    value: feed.clone().unwrap_or_default(),
                },
                Direction::Write => SidePump::Capture { fd: *fd, resource },
            };
            builder.pump(pump);
        }
        BindingPlan::Env { value, .. } | BindingPlan::Arg { value, .. } => {
            let resource = supervisor.track_value(index, channel.clone(), value.clone());
            builder.parameter(ParameterEntry {
                channel: channel.clone(),
                value: value.clone(),
                resource,
            });
        }
    }
    Ok(())
}

fn attach(
    index: usize,
    channel: &ChannelId,
    fd: u32,
    direction: Direction,
    owned: OwnedFd,
    supervisor: &mut LifecycleSupervisor,
    builder: &mut ChannelTableBuilder,
) {
    let raw = owned.as_raw_fd();
    let resource =
        supervisor.track_descriptor(index, channel.clone(), ResourceRole::ChildEnd, owned);
    builder.descriptor(DescriptorEntry {
        fd,
        raw,
        direction,
        resource,
        binding_index: index,
    });
}

fn open_path(path: &Path, direction: Direction, append: bool) -> std::io::Result<File> {
    match direction {
        Direction::Read => File::open(path),
        Direction::Write => {
            let mut options = OpenOptions::new();
            options.create(true);
            if append {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            options.open(path)
        }
    }
}
