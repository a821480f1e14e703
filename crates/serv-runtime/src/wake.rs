//! Cooperative stop
//!
//! A self-pipe registered with the notifier. Writing one byte wakes a
//! blocked `wait`; the dispatch loop drains the pipe and moves to Draining.
//! Both ends are non-blocking and close-on-exec, and both stay open until
//! the last handle is dropped, so a late `stop()` never hits EPIPE.

use crate::socket::{close_quietly, set_cloexec, set_nonblocking};
use serv_core::{Result, ServError};

use nix::errno::Errno;
use std::os::unix::io::RawFd;
use std::sync::Arc;

pub(crate) struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub(crate) fn new() -> Result<Arc<Self>> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(ServError::Resource(Errno::last()));
        }
        let pipe = WakePipe { read_fd: fds[0], write_fd: fds[1] };
        for fd in fds {
            set_nonblocking(fd)?;
            set_cloexec(fd)?;
        }
        Ok(Arc::new(pipe))
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn wake(&self) {
        loop {
            let n = unsafe { libc::write(self.write_fd, [1u8].as_ptr().cast(), 1) };
            // A full pipe already has a wakeup pending.
            if n >= 0 || Errno::last() != Errno::EINTR {
                return;
            }
        }
    }

    /// Empty the pipe so the next `wake` is a fresh transition.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 || (n < 0 && Errno::last() == Errno::EINTR) {
                continue;
            }
            return;
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        close_quietly(self.read_fd);
        close_quietly(self.write_fd);
    }
}

/// Asks a running server to stop, from any thread
///
/// The loop finishes the event it is handling, closes every connection and
/// the listener, and `run` returns `Ok(())`.
#[derive(Clone)]
pub struct StopHandle {
    pipe: Arc<WakePipe>,
}

impl StopHandle {
    pub(crate) fn new(pipe: Arc<WakePipe>) -> Self {
        Self { pipe }
    }

    pub fn stop(&self) {
        self.pipe.wake();
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StopHandle(fd={})", self.pipe.write_fd)
    }
}
