//! Byte transfer on non-blocking fds
//!
//! `read_fully`/`write_fully` keep going until the whole buffer is moved,
//! the peer hits EOF, or the fd would block. Interrupted calls are retried
//! transparently. None of these ever report more bytes than were asked for.

use serv_core::{Result, ServError};

use nix::errno::Errno;
use std::os::unix::io::RawFd;

/// Fill `buf` from `fd`.
///
/// Returns `Ok(n)` with `n == buf.len()`, or `n < buf.len()` if the peer
/// reached EOF first. On `EAGAIN` returns `WouldBlock` carrying the bytes
/// already stored in `buf`.
pub fn read_fully(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let rest = &mut buf[done..];
        let n = unsafe { libc::read(fd, rest.as_mut_ptr().cast(), rest.len()) };
        match n {
            0 => break,
            n if n > 0 => done += n as usize,
            _ => match Errno::last() {
                Errno::EINTR => continue,
                e if is_would_block(e) => return Err(ServError::WouldBlock { transferred: done }),
                e => return Err(ServError::Transfer(e)),
            },
        }
    }
    Ok(done)
}

/// Write all of `buf` to `fd`.
///
/// `Ok(buf.len())` once everything is written. On `EAGAIN` returns
/// `WouldBlock` carrying how much of `buf` went out; the caller resumes
/// from there when the fd is writable again.
pub fn write_fully(fd: RawFd, buf: &[u8]) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        let rest = &buf[done..];
        let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
        if n >= 0 {
            done += n as usize;
            continue;
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e if is_would_block(e) => return Err(ServError::WouldBlock { transferred: done }),
            e => return Err(ServError::Transfer(e)),
        }
    }
    Ok(done)
}

/// One `read(2)`, retried only on `EINTR`.
///
/// `Ok(0)` is EOF (or an empty `buf`).
pub fn read_some(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e if is_would_block(e) => return Err(ServError::WouldBlock { transferred: 0 }),
            e => return Err(ServError::Transfer(e)),
        }
    }
}

/// One `write(2)`, retried only on `EINTR`.
pub fn write_some(fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e if is_would_block(e) => return Err(ServError::WouldBlock { transferred: 0 }),
            e => return Err(ServError::Transfer(e)),
        }
    }
}

#[inline]
fn is_would_block(e: Errno) -> bool {
    e == Errno::EAGAIN || e == Errno::EWOULDBLOCK
}
