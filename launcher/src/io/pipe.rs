//! Anonymous pipes and descriptor duplication.
//!
//! Every descriptor created here is close-on-exec; the spawner decides which
//! ones the child actually receives.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};

use crate::core::manifest::StdStream;

/// Both ends of an anonymous pipe.
#[derive(Debug)]
pub struct Pipe {
    pub reader: OwnedFd,
    pub writer: OwnedFd,
}

/// Create a pipe with both ends marked close-on-exec.
pub fn pipe() -> io::Result<Pipe> {
    let mut fds: [RawFd; 2] = [-1, -1];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        // SAFETY: `fds` is a valid, writable two-element buffer.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        // SAFETY: `fds` is a valid, writable two-element buffer.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    // SAFETY: the kernel just returned two fresh descriptors nobody else owns.
    let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        set_cloexec(&reader)?;
        set_cloexec(&writer)?;
    }

    Ok(Pipe { reader, writer })
}

/// Duplicate one of the wrapper's own standard streams.
pub fn duplicate_stream(stream: StdStream) -> io::Result<OwnedFd> {
    match stream {
        StdStream::Stdin => io::stdin().as_fd().try_clone_to_owned(),
        StdStream::Stdout => io::stdout().as_fd().try_clone_to_owned(),
        StdStream::Stderr => io::stderr().as_fd().try_clone_to_owned(),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let raw = fd.as_raw_fd();
    // SAFETY: `raw` is an open descriptor owned by `fd` for the whole call.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFD);
        if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    #[test]
    fn pipe_carries_bytes_and_is_cloexec() {
        let pipe = pipe().expect("pipe");
        // SAFETY: both descriptors are open for the duration of the checks.
        let flags = unsafe { libc::fcntl(pipe.reader.as_raw_fd(), libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);

        let mut writer = File::from(pipe.writer);
        writer.write_all(b"X:").expect("write");
        drop(writer);

        let mut buf = String::new();
        File::from(pipe.reader)
            .read_to_string(&mut buf)
            .expect("read");
        assert_eq!(buf, "X:");
    }
}
