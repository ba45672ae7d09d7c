//! Launch error taxonomy.
//!
//! Each error carries a stable machine-readable code:
//!
//! | Error | Code |
//! |-------|------|
//! | [`ManifestError::Invalid`] | `MANIFEST_INVALID` |
//! | [`BindingError::PathUnavailable`] | `BINDING_PATH_UNAVAILABLE` |
//! | [`BindingError::StreamUnavailable`] | `BINDING_STREAM_UNAVAILABLE` |
//! | [`BindingError::PipeCreationFailed`] | `BINDING_PIPE_CREATION_FAILED` |
//! | [`BindingError::Cancelled`] | `BINDING_CANCELLED` |
//! | [`LaunchError::ExecutableNotFound`] | `LAUNCH_EXECUTABLE_NOT_FOUND` |
//! | [`LaunchError::ExecPermissionDenied`] | `LAUNCH_EXEC_PERMISSION_DENIED` |
//! | [`LaunchError::WorkingDirUnavailable`] | `LAUNCH_WORKING_DIR_UNAVAILABLE` |
//! | [`LaunchError::Spawn`] | `LAUNCH_SPAWN_FAILED` |
//! | [`LaunchError::Wait`] | `LAUNCH_WAIT_FAILED` |
//! | [`LaunchError::SideChannel`] | `LAUNCH_SIDE_CHANNEL_FAILED` |
//! | [`TeardownError::ResourceAlreadyReleased`] | `TEARDOWN_ALREADY_RELEASED` |
//! | [`TeardownError::UnknownResource`] | `TEARDOWN_UNKNOWN_RESOURCE` |
//!
//! Resolution and launch errors abort the launch and propagate unchanged. None
//! of them is retried: a child that already consumed piped input cannot be
//! restarted safely.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::manifest::{ChannelId, StdStream};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest:\n- {}", .violations.join("\n- "))]
    Invalid { violations: Vec<String> },
}

impl ManifestError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid { .. } => "MANIFEST_INVALID",
        }
    }
}

/// A binding could not be turned into a live resource.
///
/// `index` is the position of the failing binding in the manifest.
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("bindings[{index}] ({channel}): cannot open {}: {source}", .path.display())]
    PathUnavailable {
        index: usize,
        channel: ChannelId,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bindings[{index}] ({channel}): cannot duplicate wrapper {stream}: {source}")]
    StreamUnavailable {
        index: usize,
        channel: ChannelId,
        stream: StdStream,
        #[source]
        source: io::Error,
    },

    #[error("bindings[{index}] ({channel}): cannot create pipe: {source}")]
    PipeCreationFailed {
        index: usize,
        channel: ChannelId,
        #[source]
        source: io::Error,
    },

    #[error("resolution cancelled before bindings[{index}]")]
    Cancelled { index: usize },
}

impl BindingError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PathUnavailable { .. } => "BINDING_PATH_UNAVAILABLE",
            Self::StreamUnavailable { .. } => "BINDING_STREAM_UNAVAILABLE",
            Self::PipeCreationFailed { .. } => "BINDING_PIPE_CREATION_FAILED",
            Self::Cancelled { .. } => "BINDING_CANCELLED",
        }
    }

    /// Manifest index of the binding that failed (or was not reached).
    pub fn index(&self) -> usize {
        match self {
            Self::PathUnavailable { index, .. }
            | Self::StreamUnavailable { index, .. }
            | Self::PipeCreationFailed { index, .. }
            | Self::Cancelled { index } => *index,
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("executable not found: {}: {source}", .program.display())]
    ExecutableNotFound {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("permission denied executing {}: {source}", .program.display())]
    ExecPermissionDenied {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("working directory {} is not a directory", .dir.display())]
    WorkingDirUnavailable { dir: PathBuf },

    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for child: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },

    #[error("side channel fd {fd} failed: {message}")]
    SideChannel { fd: u32, message: String },
}

impl LaunchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExecutableNotFound { .. } => "LAUNCH_EXECUTABLE_NOT_FOUND",
            Self::ExecPermissionDenied { .. } => "LAUNCH_EXEC_PERMISSION_DENIED",
            Self::WorkingDirUnavailable { .. } => "LAUNCH_WORKING_DIR_UNAVAILABLE",
            Self::Spawn { .. } => "LAUNCH_SPAWN_FAILED",
            Self::Wait { .. } => "LAUNCH_WAIT_FAILED",
            Self::SideChannel { .. } => "LAUNCH_SIDE_CHANNEL_FAILED",
        }
    }
}

/// Releasing a resource that was already released or handed off.
///
/// Teardown is idempotent, so this only surfaces from explicit per-resource
/// release calls. It is logged, never allowed to mask a primary error.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("resource #{resource} ({channel}) already released")]
    ResourceAlreadyReleased { resource: usize, channel: ChannelId },

    #[error("resource #{resource} is not tracked by this supervisor")]
    UnknownResource { resource: usize },
}

impl TeardownError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ResourceAlreadyReleased { .. } => "TEARDOWN_ALREADY_RELEASED",
            Self::UnknownResource { .. } => "TEARDOWN_UNKNOWN_RESOURCE",
        }
    }
}

/// Any failure inside the wrapper, as opposed to a failure of the child.
#[derive(Debug, Error)]
pub enum WrapperError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl WrapperError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Manifest(err) => err.code(),
            Self::Binding(err) => err.code(),
            Self::Launch(err) => err.code(),
        }
    }
}
