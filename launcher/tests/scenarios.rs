//! End-to-end launches against small shell children.
//!
//! The prefix and suffix children read lines on fd 0 and write to fd 1; they
//! differ only in how their parameter arrives (environment vs argument).

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use launcher::test_support::{Fixture, launch_fixture, stdio_manifest};
use launcher::{
    BindingError, ChannelBinding, Direction, LaunchError, LaunchOptions, ManifestSpec, StdStream,
    WrapperError, exit_codes, launch, launch_detached,
};

#[test]
fn env_parameter_reaches_prefix_child() {
    let fx = Fixture::new().expect("fixture");
    let program = fx.prefix_child().expect("script");
    let input = fx.write("in.txt", "a\nb\n").expect("input");

    let manifest = stdio_manifest(&program, &input, &fx.join("out.txt"))
        .bind(ChannelBinding::env("PREFIX", "X:"))
        .build()
        .expect("manifest");
    let outcome = launch_fixture(&manifest, &LaunchOptions::default()).expect("launch");

    assert_eq!(outcome.exit_code(), exit_codes::OK);
    assert_eq!(fx.read("out.txt").expect("output"), "X:a\nX:b\n");
}

#[test]
fn argument_parameter_reaches_suffix_child() {
    let fx = Fixture::new().expect("fixture");
    let program = fx.suffix_child().expect("script");
    let input = fx.write("in.txt", "a\nb\n").expect("input");

    let manifest = stdio_manifest(&program, &input, &fx.join("out.txt"))
        .bind(ChannelBinding::arg(0, "!"))
        .build()
        .expect("manifest");
    let outcome = launch_fixture(&manifest, &LaunchOptions::default()).expect("launch");

    assert_eq!(outcome.exit_code(), exit_codes::OK);
    assert_eq!(fx.read("out.txt").expect("output"), "a!\nb!\n");
}

#[test]
fn bound_arguments_precede_static_ones() {
    let fx = Fixture::new().expect("fixture");
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg("printf '%s|' \"$0\" \"$@\"")
        .arg("static")
        .bind(ChannelBinding::file(1, fx.join("out.txt"), Direction::Write))
        .build()
        .expect("manifest");
    launch(&manifest, &LaunchOptions::default()).expect("launch");
    assert_eq!(fx.read("out.txt").expect("output"), "static|");

    let program = fx.script("args.sh", "#!/bin/sh\nprintf '%s|' \"$@\"\n").expect("script");
    let manifest = ManifestSpec::new(&program)
        .arg("static")
        .bind(ChannelBinding::arg(1, "second"))
        .bind(ChannelBinding::arg(0, "first"))
        .bind(ChannelBinding::file(1, fx.join("args.txt"), Direction::Write))
        .build()
        .expect("manifest");
    launch_fixture(&manifest, &LaunchOptions::default()).expect("launch");
    assert_eq!(fx.read("args.txt").expect("output"), "first|second|static|");
}

#[test]
fn failed_resolution_spawns_nothing() {
    let fx = Fixture::new().expect("fixture");
    let marker = fx.join("marker");
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg(format!("touch '{}'", marker.display()))
        .bind(ChannelBinding::file(1, fx.join("out.txt"), Direction::Write))
        .bind(ChannelBinding::pipe_out(3))
        .bind(ChannelBinding::file(0, fx.join("missing.txt"), Direction::Read))
        .build()
        .expect("manifest");

    let err = launch(&manifest, &LaunchOptions::default()).unwrap_err();
    match err {
        WrapperError::Binding(BindingError::PathUnavailable { index, .. }) => assert_eq!(index, 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!marker.exists(), "child must not run after a binding failure");
}

#[test]
fn sequential_read_then_write_on_one_path() {
    let fx = Fixture::new().expect("fixture");
    let shared = fx.write("shared.txt", "a\nb\n").expect("seed");
    let copy = fx.join("copy.txt");

    let read = stdio_manifest(Path::new("/bin/cat"), &shared, &copy)
        .build()
        .expect("manifest");
    launch(&read, &LaunchOptions::default()).expect("first launch");

    let program = fx.prefix_child().expect("script");
    let write = stdio_manifest(&program, &copy, &shared)
        .bind(ChannelBinding::env("PREFIX", "> "))
        .build()
        .expect("manifest");
    launch_fixture(&write, &LaunchOptions::default()).expect("second launch");

    assert_eq!(fx.read("copy.txt").expect("copy"), "a\nb\n");
    assert_eq!(fx.read("shared.txt").expect("shared"), "> a\n> b\n");
}

#[test]
fn side_channel_pipes_feed_and_capture() {
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg("read value <&3; printf '%s-%s' \"$value\" \"$TAG\" >&4; printf done")
        .bind(ChannelBinding::pipe_in(3, "secret\n"))
        .bind(ChannelBinding::pipe_out(4))
        .bind(ChannelBinding::pipe_out(1))
        .bind(ChannelBinding::env("TAG", "t1"))
        .build()
        .expect("manifest");

    let outcome = launch(&manifest, &LaunchOptions::default()).expect("launch");
    assert_eq!(outcome.captured(4), Some(&b"secret-t1"[..]));
    assert_eq!(outcome.captured(1), Some(&b"done"[..]));
}

#[test]
fn capture_is_bounded() {
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg("printf 0123456789")
        .bind(ChannelBinding::pipe_out(1))
        .build()
        .expect("manifest");
    let options = LaunchOptions {
        side_channel_limit_bytes: 4,
        ..LaunchOptions::default()
    };

    let outcome = launch(&manifest, &options).expect("launch");
    let captured = &outcome.captured[&1];
    assert_eq!(captured.bytes, b"0123");
    assert_eq!(captured.truncated, 6);
}

#[test]
fn child_exit_code_passes_through() {
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg("exit 42")
        .build()
        .expect("manifest");
    let outcome = launch(&manifest, &LaunchOptions::default()).expect("launch");
    assert_eq!(outcome.exit_code(), 42);
}

#[test]
fn non_executable_program_is_permission_denied() {
    let fx = Fixture::new().expect("fixture");
    let program = fx.write("plain.sh", "#!/bin/sh\nexit 0\n").expect("write");
    let manifest = ManifestSpec::new(&program).build().expect("manifest");

    let err = launch(&manifest, &LaunchOptions::default()).unwrap_err();
    assert!(
        matches!(err, WrapperError::Launch(LaunchError::ExecPermissionDenied { .. })),
        "{err}"
    );
}

#[test]
fn timeout_kills_child() {
    let manifest = ManifestSpec::new("sleep").arg("30").build().expect("manifest");
    let options = LaunchOptions {
        timeout: Some(Duration::from_millis(200)),
        kill_grace: Duration::from_millis(500),
        ..LaunchOptions::default()
    };

    let outcome = launch(&manifest, &options).expect("launch");
    assert!(outcome.timed_out);
    assert_eq!(outcome.exit_code(), exit_codes::SIGNAL_BASE + libc::SIGTERM);
}

#[test]
fn detached_handle_returns_before_child_exits() {
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg("sleep 1; exit 3")
        .build()
        .expect("manifest");

    let mut handle = launch_detached(&manifest, &LaunchOptions::default()).expect("launch");
    assert!(handle.pid() > 0);
    assert!(!handle.is_finished().expect("poll"));

    let outcome = handle.wait().expect("wait");
    assert_eq!(outcome.exit_code(), 3);
}

#[test]
fn cancellation_after_start_terminates_child() {
    let manifest = ManifestSpec::new("sleep").arg("30").build().expect("manifest");
    let options = LaunchOptions {
        kill_grace: Duration::from_millis(500),
        ..LaunchOptions::default()
    };

    let handle = launch_detached(&manifest, &options).expect("launch");
    let token = handle.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        token.cancel();
    });

    let outcome = handle.wait().expect("wait");
    canceller.join().expect("join canceller");
    assert!(outcome.cancelled);
    assert!(!outcome.status.success());
}

#[test]
fn missing_program_is_reported_with_many_descriptors_bound() {
    let fx = Fixture::new().expect("fixture");
    let mut spec = ManifestSpec::new("/nonexistent/launcher-child");
    for fd in 20..=80 {
        spec = spec.bind(ChannelBinding::file(
            fd,
            fx.join(&format!("f{fd}")),
            Direction::Write,
        ));
    }
    let manifest = spec.build().expect("manifest");

    let err = launch(&manifest, &LaunchOptions::default()).unwrap_err();
    assert!(
        matches!(err, WrapperError::Launch(LaunchError::ExecutableNotFound { .. })),
        "{err}"
    );
    for fd in 20..=80 {
        let written = fx.read(&format!("f{fd}")).expect("bound file");
        assert!(written.is_empty(), "fd {fd} received {written:?}");
    }
}

#[test]
fn inherited_stream_is_writable_by_child() {
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg("printf '' >&4")
        .bind(ChannelBinding::inherit(4, StdStream::Stderr))
        .build()
        .expect("manifest");

    let outcome = launch(&manifest, &LaunchOptions::default()).expect("launch");
    assert_eq!(outcome.exit_code(), exit_codes::OK);
}

#[test]
fn timeout_stops_grandchildren_holding_side_channels() {
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg("sleep 6 & sleep 30")
        .bind(ChannelBinding::pipe_out(3))
        .build()
        .expect("manifest");
    let options = LaunchOptions {
        timeout: Some(Duration::from_millis(200)),
        kill_grace: Duration::from_millis(200),
        ..LaunchOptions::default()
    };

    let started = Instant::now();
    let outcome = launch(&manifest, &options).expect("launch");
    assert!(outcome.timed_out);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "waited {:?}",
        started.elapsed()
    );
}

#[test]
fn exited_child_does_not_wait_on_lingering_grandchild() {
    let manifest = ManifestSpec::new("/bin/sh")
        .arg("-c")
        .arg("printf early >&3; sleep 6 & exit 0")
        .bind(ChannelBinding::pipe_out(3))
        .build()
        .expect("manifest");
    let options = LaunchOptions {
        kill_grace: Duration::from_millis(200),
        ..LaunchOptions::default()
    };

    let started = Instant::now();
    let outcome = launch(&manifest, &options).expect("launch");
    assert_eq!(outcome.exit_code(), exit_codes::OK);
    assert_eq!(outcome.captured(3), Some(&b"early"[..]));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "waited {:?}",
        started.elapsed()
    );
}
