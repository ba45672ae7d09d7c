//! Test-only helpers: scratch directories, fixture child programs, launch retries.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use crate::core::manifest::{ChannelBinding, Direction, LaunchManifest, ManifestSpec};
use crate::error::{LaunchError, WrapperError};
use crate::launch::{LaunchOptions, LaunchOutcome, launch};

/// Reads lines on fd 0 and writes `$PREFIX<line>` to fd 1.
pub const PREFIX_SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
    printf '%s%s\n' "$PREFIX" "$line"
done
"#;

/// Reads lines on fd 0 and writes `<line>$1` to fd 1.
pub const SUFFIX_SCRIPT: &str = r#"#!/bin/sh
suffix="$1"
while IFS= read -r line; do
    printf '%s%s\n' "$line" "$suffix"
done
"#;

const BUSY_RETRIES: usize = 20;

/// Scratch directory that holds inputs, outputs and fixture scripts.
#[derive(Debug)]
pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write `contents` to `name` and return its path.
    pub fn write(&self, name: &str, contents: &str) -> io::Result<PathBuf> {
        let path = self.join(name);
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Write an executable script.
    pub fn script(&self, name: &str, body: &str) -> io::Result<PathBuf> {
        let path = self.write(name, body)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    pub fn prefix_child(&self) -> io::Result<PathBuf> {
        self.script("prefix.sh", PREFIX_SCRIPT)
    }

    pub fn suffix_child(&self) -> io::Result<PathBuf> {
        self.script("suffix.sh", SUFFIX_SCRIPT)
    }

    pub fn read(&self, name: &str) -> io::Result<String> {
        fs::read_to_string(self.join(name))
    }
}

/// Manifest with fd 0 read from `input` and fd 1 written to `output`.
pub fn stdio_manifest(program: &Path, input: &Path, output: &Path) -> ManifestSpec {
    ManifestSpec::new(program)
        .bind(ChannelBinding::file(0, input, Direction::Read))
        .bind(ChannelBinding::file(1, output, Direction::Write))
}

/// Launch, retrying while the kernel reports the fixture script busy.
///
/// A script written moments ago can still be held open for writing by a
/// concurrently forked test process until that process execs.
pub fn launch_fixture(
    manifest: &LaunchManifest,
    options: &LaunchOptions,
) -> Result<LaunchOutcome, WrapperError> {
    for _ in 0..BUSY_RETRIES {
        match launch(manifest, options) {
            Err(WrapperError::Launch(LaunchError::Spawn { source, .. }))
                if source.raw_os_error() == Some(libc::ETXTBSY) =>
            {
                thread::sleep(Duration::from_millis(10));
            }
            other => return other,
        }
    }
    launch(manifest, options)
}

/// Number of descriptors currently open in this process.
#[cfg(target_os = "linux")]
pub fn open_fd_count() -> io::Result<usize> {
    Ok(fs::read_dir("/proc/self/fd")?.count())
}
