//! Descriptors the wrapper holds but did not bind must not reach the child.

#![cfg(target_os = "linux")]
#![allow(unsafe_code)]

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::Command;

use launcher::test_support::Fixture;
use launcher::{ChannelBinding, Direction, LaunchOptions, ManifestSpec, launch};

/// Duplicate `file` to a high descriptor without close-on-exec, the way a
/// careless library or parent process would leave it.
fn inheritable_copy(file: &File) -> OwnedFd {
    // SAFETY: `file` is open; F_DUPFD returns a fresh descriptor we own.
    let raw: RawFd = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_DUPFD, 100) };
    assert!(raw >= 100, "fcntl(F_DUPFD) failed");
    // SAFETY: `raw` is a newly created descriptor owned by nobody else.
    unsafe { OwnedFd::from_raw_fd(raw) }
}

#[test]
fn unbound_inheritable_descriptor_is_not_visible() {
    let fx = Fixture::new().expect("fixture");
    let secret = File::open(fx.write("secret.txt", "secret").expect("write")).expect("open");
    let leaky = inheritable_copy(&secret);
    let probe = format!(
        "[ -e /proc/self/fd/{n} ] && echo leaked || echo clean; \
         [ -e /proc/self/fd/3 ] && echo bound || echo unbound",
        n = leaky.as_raw_fd()
    );

    // A plain spawn passes the descriptor along.
    let control = Command::new("/bin/sh")
        .arg("-c")
        .arg(&probe)
        .output()
        .expect("control spawn");
    assert!(String::from_utf8_lossy(&control.stdout).starts_with("leaked"));

    let side = fx.write("side.txt", "side").expect("write side");
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg(&probe)
        .bind(ChannelBinding::pipe_out(1))
        .bind(ChannelBinding::file(3, &side, Direction::Read))
        .build()
        .expect("manifest");
    let outcome = launch(&manifest, &LaunchOptions::default()).expect("launch");

    assert_eq!(outcome.captured(1), Some(&b"clean\nbound\n"[..]));
}

#[test]
fn unbound_standard_descriptors_are_not_inherited() {
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg("[ -e /proc/self/fd/0 ] && echo stdin || echo no-stdin")
        .bind(ChannelBinding::pipe_out(1))
        .build()
        .expect("manifest");

    let outcome = launch(&manifest, &LaunchOptions::default()).expect("launch");
    assert_eq!(outcome.captured(1), Some(&b"no-stdin\n"[..]));
}
