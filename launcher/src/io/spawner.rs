//! Process launcher: starts the child with exactly the bound descriptors.
//!
//! The program is located on `PATH` before anything is forked. Descriptor
//! remapping then happens in the forked child, which execs the program itself:
//!
//! 1. Every bound source descriptor, and the write end of the launcher's own
//!    exec-status pipe, is duplicated above the highest target so that no
//!    `dup2` can clobber it.
//! 2. Each staged copy is `dup2`-ed onto its target number (clearing
//!    close-on-exec on the target).
//! 3. Every other descriptor is marked close-on-exec, so the child sees
//!    nothing it was not given.
//! 4. `execve` runs. On any failure from step 1 onwards the child writes the
//!    failing stage and errno to the status pipe and exits. A successful exec
//!    closes the pipe, so the wrapper reads either a report or end-of-file.
//!
//! The child leads a new process group so that stopping it reaches anything
//! it started.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use tracing::{debug, error, instrument, warn};

use crate::core::manifest::LaunchManifest;
use crate::error::LaunchError;
use crate::io::pipe::pipe;
use crate::io::table::ChannelTable;

/// Upper bound for the close-on-exec sweep when `close_range` is unavailable.
const FALLBACK_OPEN_MAX: RawFd = 65_536;

/// `CLOSE_RANGE_CLOEXEC` from `<linux/close_range.h>`.
#[cfg(target_os = "linux")]
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Search path used when the child's environment has no `PATH`.
const DEFAULT_SEARCH_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Exit status of a forked child that never reached the program.
const EXEC_FAILED_STATUS: libc::c_int = 127;

/// Size of the failure report: stage then errno, both native-endian `i32`.
const REPORT_LEN: usize = 8;

/// Where in the forked child a launch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
enum Stage {
    Descriptors = 1,
    Exec = 2,
}

/// Start the child described by `manifest` with the descriptors and parameters
/// resolved in `table`.
///
/// The returned child has already exec'd; the caller still owns the wrapper's
/// copies of the child-side descriptors and must release them.
#[instrument(skip_all, fields(program = %manifest.program().display()))]
pub fn spawn(manifest: &LaunchManifest, table: &ChannelTable) -> Result<Child, LaunchError> {
    if let Some(dir) = manifest.working_dir()
        && !dir.is_dir()
    {
        return Err(LaunchError::WorkingDirUnavailable {
            dir: dir.to_path_buf(),
        });
    }

    let env = child_env(manifest, table);
    let program = locate_program(manifest.program(), env.get(OsStr::new("PATH")))?;
    let image = ExecImage::new(&program, manifest.program(), &table.argv(manifest.args()), &env)
        .map_err(|source| LaunchError::Spawn {
            program: manifest.program().to_path_buf(),
            source,
        })?;
    let status = pipe().map_err(|source| LaunchError::Spawn {
        program: manifest.program().to_path_buf(),
        source,
    })?;

    // The pre-exec hook execs `image` itself; std only forks and changes
    // directory.
    let mut cmd = Command::new(&program);
    cmd.arg0(manifest.program());
    cmd.process_group(0);
    if let Some(dir) = manifest.working_dir() {
        cmd.current_dir(dir);
    }

    for entry in table.descriptors() {
        debug!(
            fd = entry.fd,
            raw = entry.raw,
            direction = ?entry.direction,
            binding_index = entry.binding_index,
            "descriptor plan"
        );
    }
    let mut plan = DescriptorPlan::from_table(table, status.writer.as_raw_fd());
    // SAFETY: the hook runs between fork and exec. It only calls
    // async-signal-safe functions (fcntl, dup2, close_range, execve, write,
    // _exit) and reads memory allocated before the fork; it never allocates.
    unsafe {
        cmd.pre_exec(move || plan.exec(&image));
    }

    let spawned = cmd.spawn();
    drop(status.writer);
    let mut child = spawned.map_err(|source| {
        error!(err = %source, "failed to spawn child");
        classify_spawn_error(manifest.program(), source)
    })?;

    let report = match read_report(status.reader) {
        Ok(report) => report,
        Err(source) => {
            reap(&mut child);
            return Err(LaunchError::Spawn {
                program: manifest.program().to_path_buf(),
                source,
            });
        }
    };
    match report {
        None => {
            debug!(pid = child.id(), path = %program.display(), "child started");
            Ok(child)
        }
        Some((stage, source)) => {
            reap(&mut child);
            error!(?stage, err = %source, "child failed before running the program");
            Err(match stage {
                Stage::Exec => classify_spawn_error(manifest.program(), source),
                Stage::Descriptors => LaunchError::Spawn {
                    program: manifest.program().to_path_buf(),
                    source,
                },
            })
        }
    }
}

fn classify_spawn_error(program: &Path, source: io::Error) -> LaunchError {
    let program = program.to_path_buf();
    match source.kind() {
        io::ErrorKind::NotFound => LaunchError::ExecutableNotFound { program, source },
        io::ErrorKind::PermissionDenied => LaunchError::ExecPermissionDenied { program, source },
        _ => LaunchError::Spawn { program, source },
    }
}

fn reap(child: &mut Child) {
    if let Err(err) = child.wait() {
        warn!(pid = child.id(), err = %err, "failed to reap child after launch failure");
    }
}

/// Environment the child starts with: inherited (unless cleared), then bound.
fn child_env(manifest: &LaunchManifest, table: &ChannelTable) -> BTreeMap<OsString, OsString> {
    let mut env = BTreeMap::new();
    if !manifest.clear_env() {
        env.extend(std::env::vars_os());
    }
    for (name, value) in table.env() {
        env.insert(OsString::from(name), OsString::from(value));
    }
    env
}

/// Resolve a bare program name against `search_path`.
///
/// Names containing a slash are used as given; exec reports whether they
/// exist. A name found only without execute permission is returned anyway so
/// that exec reports the permission error.
fn locate_program(program: &Path, search_path: Option<&OsString>) -> Result<PathBuf, LaunchError> {
    if program.as_os_str().as_bytes().contains(&b'/') {
        return Ok(program.to_path_buf());
    }

    let search = search_path.map_or(OsStr::new(DEFAULT_SEARCH_PATH), OsString::as_os_str);
    let mut not_executable = None;
    for dir in std::env::split_paths(search) {
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };
        let candidate = dir.join(program);
        match fs::metadata(&candidate) {
            Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o111 != 0 => {
                return Ok(candidate);
            }
            Ok(meta) if meta.is_file() => {
                not_executable.get_or_insert(candidate);
            }
            _ => {}
        }
    }

    not_executable.ok_or_else(|| LaunchError::ExecutableNotFound {
        program: program.to_path_buf(),
        source: io::Error::new(io::ErrorKind::NotFound, "not found on PATH"),
    })
}

/// Read the child's failure report, or `None` once a successful exec closes
/// the pipe.
fn read_report(reader: OwnedFd) -> io::Result<Option<(Stage, io::Error)>> {
    let mut file = File::from(reader);
    let mut buf = [0u8; REPORT_LEN];
    let mut filled = 0;
    while filled < REPORT_LEN {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }

    match filled {
        0 => Ok(None),
        REPORT_LEN => {
            let stage = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
            let errno = i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let stage = if stage == Stage::Exec as i32 {
                Stage::Exec
            } else {
                Stage::Descriptors
            };
            Ok(Some((stage, io::Error::from_raw_os_error(errno))))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated exec status report",
        )),
    }
}

/// Program path, argument vector and environment laid out for `execve`.
struct ExecImage {
    path: CString,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
}

// SAFETY: the pointer arrays point only into the `CString` buffers owned by
// the same value, which are never mutated or freed while it lives.
unsafe impl Send for ExecImage {}
// SAFETY: as above; shared access never writes through the pointers.
unsafe impl Sync for ExecImage {}

impl ExecImage {
    fn new(
        path: &Path,
        arg0: &Path,
        args: &[String],
        env: &BTreeMap<OsString, OsString>,
    ) -> io::Result<Self> {
        let path = c_string(path.as_os_str().as_bytes())?;
        let argv = std::iter::once(c_string(arg0.as_os_str().as_bytes()))
            .chain(args.iter().map(|arg| c_string(arg.as_bytes())))
            .collect::<io::Result<Vec<_>>>()?;
        let envp = env
            .iter()
            .map(|(name, value)| {
                let mut entry = name.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                c_string(&entry)
            })
            .collect::<io::Result<Vec<_>>>()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            path,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
        })
    }
}

fn c_string(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "program, argument or environment contains a NUL byte",
        )
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Precomputed descriptor moves applied in the forked child.
#[derive(Debug)]
struct DescriptorPlan {
    /// `(source, target)` pairs.
    moves: Vec<(RawFd, RawFd)>,
    /// Scratch space for staged copies; sized before fork.
    staged: Vec<RawFd>,
    /// Highest target descriptor, or -1 when nothing is bound.
    max_target: RawFd,
    /// Write end of the exec-status pipe in the wrapper.
    status: RawFd,
    open_max: RawFd,
}

impl DescriptorPlan {
    fn from_table(table: &ChannelTable, status: RawFd) -> Self {
        let moves: Vec<(RawFd, RawFd)> = table
            .descriptors()
            .map(|entry| (entry.raw, entry.fd as RawFd))
            .collect();
        let max_target = moves.iter().map(|(_, target)| *target).max().unwrap_or(-1);
        Self {
            staged: vec![-1; moves.len()],
            moves,
            max_target,
            status,
            open_max: open_max(),
        }
    }

    fn is_target(&self, fd: RawFd) -> bool {
        self.moves.iter().any(|(_, target)| *target == fd)
    }

    /// Runs in the forked child. Returns only if the status pipe itself could
    /// not be staged.
    fn exec(&mut self, image: &ExecImage) -> io::Result<()> {
        // SAFETY: `status` is open in the wrapper and therefore in the fork.
        let report = unsafe { libc::fcntl(self.status, libc::F_DUPFD_CLOEXEC, self.max_target + 1) };
        if report < 0 {
            return Err(io::Error::last_os_error());
        }

        if let Err(err) = self.apply() {
            fail(report, Stage::Descriptors, &err);
        }
        // SAFETY: every pointer array is null-terminated and points into
        // strings owned by `image`, which outlives this call.
        unsafe {
            libc::execve(
                image.path.as_ptr(),
                image.argv_ptrs.as_ptr(),
                image.envp_ptrs.as_ptr(),
            );
        }
        fail(report, Stage::Exec, &io::Error::last_os_error())
    }

    fn apply(&mut self) -> io::Result<()> {
        let floor = self.max_target + 1;
        for (slot, (source, _)) in self.staged.iter_mut().zip(&self.moves) {
            // SAFETY: `source` is open in the wrapper and therefore in the fork.
            let staged = unsafe { libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, floor) };
            if staged < 0 {
                return Err(io::Error::last_os_error());
            }
            *slot = staged;
        }

        for (staged, (_, target)) in self.staged.iter().zip(&self.moves) {
            // SAFETY: `staged` was just created above; `target` is a plain number.
            if unsafe { libc::dup2(*staged, *target) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        for fd in 0..floor {
            if !self.is_target(fd) {
                mark_cloexec(fd);
            }
        }
        mark_cloexec_from(floor, self.open_max);
        Ok(())
    }
}

/// Report a failure through the status pipe and leave the forked child.
fn fail(report: RawFd, stage: Stage, err: &io::Error) -> ! {
    let errno = err.raw_os_error().unwrap_or(libc::EIO);
    let mut buf = [0u8; REPORT_LEN];
    buf[..4].copy_from_slice(&(stage as i32).to_ne_bytes());
    buf[4..].copy_from_slice(&errno.to_ne_bytes());
    // SAFETY: `buf` is valid for its length; write and _exit are
    // async-signal-safe. A short write surfaces as a truncated report.
    unsafe {
        libc::write(report, buf.as_ptr().cast(), buf.len());
        libc::_exit(EXEC_FAILED_STATUS)
    }
}

fn open_max() -> RawFd {
    // SAFETY: sysconf has no preconditions.
    let limit = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if limit <= 0 {
        return FALLBACK_OPEN_MAX;
    }
    RawFd::try_from(limit)
        .unwrap_or(FALLBACK_OPEN_MAX)
        .min(FALLBACK_OPEN_MAX)
}

fn mark_cloexec(fd: RawFd) {
    // SAFETY: fcntl on a descriptor that may not be open just fails with EBADF.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 && flags & libc::FD_CLOEXEC == 0 {
            libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }
    }
}

fn mark_cloexec_from(first: RawFd, open_max: RawFd) {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range only changes descriptor flags in this process.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                libc::c_uint::MAX,
                CLOSE_RANGE_CLOEXEC,
            )
        };
        if rc == 0 {
            return;
        }
    }
    for fd in first..open_max {
        mark_cloexec(fd);
    }
}
