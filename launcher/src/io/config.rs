//! Launcher configuration stored as TOML (default `launcher.toml`).

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::exit_codes::WRAPPER_FAILURE;

/// Launcher configuration (TOML).
///
/// Edited by humans; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LauncherConfig {
    /// Exit code used when the wrapper itself fails. Must not collide with a
    /// code the child is expected to produce.
    pub wrapper_exit_code: i32,

    /// Wall-clock limit for the child in seconds. Unset waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Time between SIGTERM and SIGKILL when stopping the child.
    pub kill_grace_millis: u64,

    /// How often timeouts and cancellation are checked while waiting.
    pub poll_interval_millis: u64,

    /// Captured side-channel output beyond this many bytes is discarded.
    pub side_channel_limit_bytes: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            wrapper_exit_code: WRAPPER_FAILURE,
            timeout_secs: None,
            kill_grace_millis: 2_000,
            poll_interval_millis: 20,
            side_channel_limit_bytes: 1_000_000,
        }
    }
}

impl LauncherConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=255).contains(&self.wrapper_exit_code) {
            return Err(anyhow!("wrapper_exit_code must be in 1..=255"));
        }
        if self.timeout_secs == Some(0) {
            return Err(anyhow!("timeout_secs must be > 0 when set"));
        }
        if self.poll_interval_millis == 0 {
            return Err(anyhow!("poll_interval_millis must be > 0"));
        }
        if self.side_channel_limit_bytes == 0 {
            return Err(anyhow!("side_channel_limit_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

/// Load the launcher config for `run`.
///
/// A missing file yields the defaults, so a manifest can be run without
/// `init-config` ever having been called. A file that exists but fails to
/// parse or validate is an error: silently falling back would change the
/// wrapper exit code a caller relies on.
pub fn load_config(path: &Path) -> Result<LauncherConfig> {
    let cfg = match fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<LauncherConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => LauncherConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Write `cfg` for `init-config`.
///
/// The file is replaced in one rename, so a concurrent `run` reading the same
/// path sees either the old config or the new one.
pub fn write_config(path: &Path, cfg: &LauncherConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    replace_file(path, buf.as_bytes())
}

fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    let staging = path.with_extension("toml.tmp");
    let mut file = fs::File::create(&staging)
        .with_context(|| format!("create {}", staging.display()))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .with_context(|| format!("write {}", staging.display()))?;
    fs::rename(&staging, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
