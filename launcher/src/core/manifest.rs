//! Launch manifest model: channel bindings plus the target executable.
//!
//! [`ManifestSpec`] is the editable, serializable form. [`LaunchManifest`] is the
//! validated, immutable form handed to the resolver; every binding in it has a
//! matching [`BindingPlan`] that states exactly what to acquire.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::invariants::validate_manifest;
use crate::error::ManifestError;

/// Highest descriptor number a binding may target.
pub const MAX_DESCRIPTOR: u32 = 1023;

static ENV_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Abstract channel a child program reads from, writes to, or is parameterized by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelId {
    /// Numbered descriptor in the child's descriptor table.
    Fd(u32),
    /// Named environment variable.
    Env(String),
    /// Positional argument, 0 being the first argument after the program name.
    Arg(usize),
}

impl ChannelId {
    pub fn descriptor(&self) -> Option<u32> {
        match self {
            Self::Fd(fd) => Some(*fd),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fd(fd) => write!(f, "fd {fd}"),
            Self::Env(name) => write!(f, "env {name}"),
            Self::Arg(position) => write!(f, "arg[{position}]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingKind {
    File,
    Pipe,
    EnvVar,
    CliArg,
}

impl BindingKind {
    /// Parameter kinds inject a string; descriptor kinds attach an open handle.
    pub fn is_parameter(self) -> bool {
        matches!(self, Self::EnvVar | Self::CliArg)
    }
}

/// Data direction from the child's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

/// One of the wrapper's own standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    pub fn direction(self) -> Direction {
        match self {
            Self::Stdin => Direction::Read,
            Self::Stdout | Self::Stderr => Direction::Write,
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        };
        f.write_str(name)
    }
}

/// Where a binding's data comes from or goes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingSource {
    Path(PathBuf),
    Literal(String),
    Inherit(StdStream),
}

/// Declared association between one channel and one concrete resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub channel: ChannelId,
    pub kind: BindingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<BindingSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Open file writes in append mode instead of truncating.
    #[serde(default, skip_serializing_if = "is_false")]
    pub append: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Direction fixed by the descriptor convention, if any.
pub fn fixed_direction(fd: u32) -> Option<Direction> {
    match fd {
        0 => Some(Direction::Read),
        1 => Some(Direction::Write),
        _ => None,
    }
}

impl ChannelBinding {
    /// Bind descriptor `fd` to a file opened in `direction`.
    pub fn file(fd: u32, path: impl Into<PathBuf>, direction: Direction) -> Self {
        Self {
            channel: ChannelId::Fd(fd),
            kind: BindingKind::File,
            source: Some(BindingSource::Path(path.into())),
            direction: Some(direction),
            append: false,
        }
    }

    /// Bind descriptor `fd` to a file opened for appending.
    pub fn append_file(fd: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            append: true,
            ..Self::file(fd, path, Direction::Write)
        }
    }

    /// Bind descriptor `fd` to one of the wrapper's own standard streams.
    pub fn inherit(fd: u32, stream: StdStream) -> Self {
        Self {
            channel: ChannelId::Fd(fd),
            kind: BindingKind::File,
            source: Some(BindingSource::Inherit(stream)),
            direction: Some(stream.direction()),
            append: false,
        }
    }

    /// Bind descriptor `fd` to a pipe the wrapper fills with `value`.
    pub fn pipe_in(fd: u32, value: impl Into<String>) -> Self {
        Self {
            channel: ChannelId::Fd(fd),
            kind: BindingKind::Pipe,
            source: Some(BindingSource::Literal(value.into())),
            direction: Some(Direction::Read),
            append: false,
        }
    }

    /// Bind descriptor `fd` to a pipe the wrapper captures.
    pub fn pipe_out(fd: u32) -> Self {
        Self {
            channel: ChannelId::Fd(fd),
            kind: BindingKind::Pipe,
            source: None,
            direction: Some(Direction::Write),
            append: false,
        }
    }

    /// Inject `value` as environment variable `name`.
    pub fn env(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::parameter(ChannelId::Env(name.into()), BindingKind::EnvVar, value)
    }

    /// Inject `value` as positional argument `position`.
    pub fn arg(position: usize, value: impl Into<String>) -> Self {
        Self::parameter(ChannelId::Arg(position), BindingKind::CliArg, value)
    }

    fn parameter(channel: ChannelId, kind: BindingKind, value: impl Into<String>) -> Self {
        Self {
            channel,
            kind,
            source: Some(BindingSource::Literal(value.into())),
            direction: None,
            append: false,
        }
    }

    /// Effective direction: declared, or fixed by convention for descriptors 0 and 1.
    pub fn effective_direction(&self) -> Option<Direction> {
        let fd = self.channel.descriptor()?;
        self.direction.or_else(|| fixed_direction(fd))
    }

    /// Classify this binding into the concrete acquisition it requires.
    ///
    /// Returns a human-readable reason when the kind, channel, source and
    /// direction do not form a coherent binding.
    pub fn plan(&self) -> Result<BindingPlan, String> {
        if self.kind.is_parameter() {
            return self.plan_parameter();
        }
        let fd = match self.channel {
            ChannelId::Fd(fd) => fd,
            _ => return Err(format!("{:?} binding requires an fd channel", self.kind)),
        };
        if fd > MAX_DESCRIPTOR {
            return Err(format!("descriptor {fd} exceeds {MAX_DESCRIPTOR}"));
        }
        if let (Some(fixed), Some(declared)) = (fixed_direction(fd), self.direction)
            && fixed != declared
        {
            return Err(format!(
                "descriptor {fd} is fixed to {fixed:?}, declared {declared:?}"
            ));
        }
        let direction = self
            .effective_direction()
            .ok_or_else(|| format!("descriptor {fd} must declare a direction"))?;
        if self.append && !(self.kind == BindingKind::File && direction == Direction::Write) {
            return Err("append applies only to file writes".to_string());
        }

        match (self.kind, &self.source) {
            (BindingKind::File, Some(BindingSource::Path(path))) => {
                if path.as_os_str().is_empty() {
                    return Err("file path must not be empty".to_string());
                }
                Ok(BindingPlan::File {
                    fd,
                    path: path.clone(),
                    direction,
                    append: self.append,
                })
            }
            (BindingKind::File, Some(BindingSource::Inherit(stream))) => {
                if stream.direction() != direction {
                    return Err(format!(
                        "inherited {stream} cannot be bound for {direction:?}"
                    ));
                }
                if self.append {
                    return Err("append applies only to file paths".to_string());
                }
                Ok(BindingPlan::Inherit { fd, stream: *stream })
            }
            (BindingKind::File, _) => Err("file binding requires a path or inherit source".to_string()),
            (BindingKind::Pipe, None) => Ok(BindingPlan::Pipe {
                fd,
                direction,
                feed: None,
            }),
            (BindingKind::Pipe, Some(BindingSource::Literal(value))) => {
                if direction == Direction::Write {
                    return Err("captured pipes take no source".to_string());
                }
                Ok(BindingPlan::Pipe {
                    fd,
                    direction,
                    feed: Some(value.clone()),
                })
            }
            (BindingKind::Pipe, Some(_)) => Err("pipe source must be a literal".to_string()),
            (BindingKind::EnvVar | BindingKind::CliArg, _) => self.plan_parameter(),
        }
    }

    fn plan_parameter(&self) -> Result<BindingPlan, String> {
        if self.direction.is_some() {
            return Err("parameter bindings take no direction".to_string());
        }
        if self.append {
            return Err("append applies only to file writes".to_string());
        }
        let value = match &self.source {
            Some(BindingSource::Literal(value)) => value.clone(),
            _ => return Err(format!("{:?} binding requires a literal source", self.kind)),
        };
        match (self.kind, &self.channel) {
            (BindingKind::EnvVar, ChannelId::Env(name)) => {
                if !ENV_NAME_RE.is_match(name) {
                    return Err(format!("invalid environment variable name '{name}'"));
                }
                Ok(BindingPlan::Env {
                    name: name.clone(),
                    value,
                })
            }
            (BindingKind::CliArg, ChannelId::Arg(position)) => Ok(BindingPlan::Arg {
                position: *position,
                value,
            }),
            (BindingKind::EnvVar, _) => Err("env_var binding requires an env channel".to_string()),
            _ => Err("cli_arg binding requires an arg channel".to_string()),
        }
    }
}

/// Concrete acquisition a validated binding requires.
///
/// Environment and argument injection are two variants of the same parameter
/// path; everything else attaches a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingPlan {
    File {
        fd: u32,
        path: PathBuf,
        direction: Direction,
        append: bool,
    },
    Inherit {
        fd: u32,
        stream: StdStream,
    },
    Pipe {
        fd: u32,
        direction: Direction,
        /// Value written by the wrapper into a pipe the child reads.
        feed: Option<String>,
    },
    Env {
        name: String,
        value: String,
    },
    Arg {
        position: usize,
        value: String,
    },
}

/// Serializable manifest as written by humans (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSpec {
    /// Executable to run. Bare names are looked up on `PATH`.
    pub program: PathBuf,
    /// Static arguments, placed after any positional argument bindings.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub bindings: Vec<ChannelBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Start the child with an empty environment plus env bindings.
    #[serde(default, skip_serializing_if = "is_false")]
    pub clear_env: bool,
}

impl ManifestSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            bindings: Vec::new(),
            working_dir: None,
            clear_env: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn bind(mut self, binding: ChannelBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn clear_env(mut self, clear: bool) -> Self {
        self.clear_env = clear;
        self
    }

    /// Resolve relative binding paths and the working directory against `base`.
    ///
    /// The program path is left alone so bare names still go through `PATH`.
    pub fn rebase(&mut self, base: &Path) {
        for binding in &mut self.bindings {
            if let Some(BindingSource::Path(path)) = &mut binding.source
                && path.is_relative()
            {
                *path = base.join(&*path);
            }
        }
        if let Some(dir) = &mut self.working_dir
            && dir.is_relative()
        {
            *dir = base.join(&*dir);
        }
    }

    pub fn build(self) -> Result<LaunchManifest, ManifestError> {
        LaunchManifest::new(self)
    }
}

/// Validated, immutable description of one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchManifest {
    spec: ManifestSpec,
    plans: Vec<BindingPlan>,
}

impl LaunchManifest {
    pub fn new(spec: ManifestSpec) -> Result<Self, ManifestError> {
        let violations = validate_manifest(&spec);
        if !violations.is_empty() {
            return Err(ManifestError::Invalid { violations });
        }
        let plans = spec
            .bindings
            .iter()
            .map(ChannelBinding::plan)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|reason| ManifestError::Invalid {
                violations: vec![reason],
            })?;
        Ok(Self { spec, plans })
    }

    pub fn program(&self) -> &Path {
        &self.spec.program
    }

    pub fn args(&self) -> &[String] {
        &self.spec.args
    }

    pub fn bindings(&self) -> &[ChannelBinding] {
        &self.spec.bindings
    }

    /// Acquisition plans, index-aligned with [`Self::bindings`].
    pub fn plans(&self) -> &[BindingPlan] {
        &self.plans
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.spec.working_dir.as_deref()
    }

    pub fn clear_env(&self) -> bool {
        self.spec.clear_env
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_descriptors_take_fixed_direction() {
        let binding = ChannelBinding {
            direction: None,
            ..ChannelBinding::file(0, "in.txt", Direction::Read)
        };
        assert_eq!(binding.effective_direction(), Some(Direction::Read));

        let plan = binding.plan().expect("plan");
        assert!(matches!(
            plan,
            BindingPlan::File {
                fd: 0,
                direction: Direction::Read,
                ..
            }
        ));
    }

    #[test]
    fn stdin_cannot_be_bound_for_write() {
        let binding = ChannelBinding::file(0, "in.txt", Direction::Write);
        let err = binding.plan().unwrap_err();
        assert!(err.contains("fixed to Read"), "{err}");
    }

    #[test]
    fn side_channel_requires_declared_direction() {
        let binding = ChannelBinding {
            direction: None,
            ..ChannelBinding::pipe_in(3, "X:")
        };
        let err = binding.plan().unwrap_err();
        assert!(err.contains("must declare a direction"), "{err}");
    }

    #[test]
    fn side_channel_accepts_either_direction() {
        assert!(ChannelBinding::pipe_in(3, "value").plan().is_ok());
        assert!(ChannelBinding::pipe_out(3).plan().is_ok());
        assert!(ChannelBinding::file(3, "side.txt", Direction::Read).plan().is_ok());
        assert!(ChannelBinding::file(3, "side.txt", Direction::Write).plan().is_ok());
    }

    #[test]
    fn captured_pipe_rejects_literal() {
        let binding = ChannelBinding {
            direction: Some(Direction::Write),
            ..ChannelBinding::pipe_in(3, "value")
        };
        assert!(binding.plan().unwrap_err().contains("take no source"));
    }

    #[test]
    fn env_and_arg_share_parameter_plan() {
        assert_eq!(
            ChannelBinding::env("PREFIX", "X:").plan().expect("env"),
            BindingPlan::Env {
                name: "PREFIX".to_string(),
                value: "X:".to_string(),
            }
        );
        assert_eq!(
            ChannelBinding::arg(0, "!").plan().expect("arg"),
            BindingPlan::Arg {
                position: 0,
                value: "!".to_string(),
            }
        );
    }

    #[test]
    fn env_name_must_be_portable() {
        let err = ChannelBinding::env("BAD=NAME", "x").plan().unwrap_err();
        assert!(err.contains("invalid environment variable name"));
    }

    #[test]
    fn inherit_direction_must_match_stream() {
        let binding = ChannelBinding {
            direction: Some(Direction::Write),
            ..ChannelBinding::inherit(3, StdStream::Stdin)
        };
        assert!(binding.plan().unwrap_err().contains("inherited stdin"));
    }

    #[test]
    fn rebase_rewrites_relative_paths_only() {
        let mut spec = ManifestSpec::new("cat")
            .bind(ChannelBinding::file(0, "in.txt", Direction::Read))
            .bind(ChannelBinding::file(1, "/abs/out.txt", Direction::Write))
            .working_dir("work");
        spec.rebase(Path::new("/base"));

        assert_eq!(
            spec.bindings[0].source,
            Some(BindingSource::Path(PathBuf::from("/base/in.txt")))
        );
        assert_eq!(
            spec.bindings[1].source,
            Some(BindingSource::Path(PathBuf::from("/abs/out.txt")))
        );
        assert_eq!(spec.working_dir, Some(PathBuf::from("/base/work")));
        assert_eq!(spec.program, PathBuf::from("cat"));
    }

    #[test]
    fn binding_json_shape_is_stable() {
        let binding = ChannelBinding::env("PREFIX", "X:");
        let json = serde_json::to_string(&binding).expect("serialize");
        assert_eq!(
            json,
            r#"{"channel":{"env":"PREFIX"},"kind":"env_var","source":{"literal":"X:"}}"#
        );
    }
}
