//! Socket primitives
//!
//! Thin wrappers over the BSD socket calls the server needs: listener
//! setup, outbound connect, non-blocking accept, fd flag toggles.
//! Every function either returns a fully configured fd or closes whatever
//! it opened before returning the error.

use serv_core::{Result, ServError};

use libc::{c_int, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use std::ffi::{CStr, CString};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::{iter, mem, ptr};

/// One connection taken off the listener's accept queue
#[derive(Debug)]
pub struct Accepted {
    pub fd: RawFd,
    pub peer_addr: String,
    pub peer_port: u16,
}

/// Set `O_NONBLOCK` on an fd.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let errno = |errno| ServError::Socket { op: "fcntl(O_NONBLOCK)", errno };
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(errno)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(errno)?;
    Ok(())
}

/// Set `FD_CLOEXEC` on an fd.
pub fn set_cloexec(fd: RawFd) -> Result<()> {
    let errno = |errno| ServError::Socket { op: "fcntl(FD_CLOEXEC)", errno };
    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(errno)?;
    let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(errno)?;
    Ok(())
}

/// Resolve, create, `SO_REUSEADDR`, bind, listen.
///
/// `host = None` binds the wildcard address. Each resolved address is tried
/// in order until one binds. The returned fd is still blocking; the caller
/// decides when to flip it.
pub fn create_listener(host: Option<&str>, port: &str, backlog: i32) -> Result<RawFd> {
    let addrs = AddrList::resolve(host, port, true)?;

    let mut last = Errno::EADDRNOTAVAIL;
    for ai in addrs.iter() {
        let fd = match open_stream(ai) {
            Ok(fd) => fd,
            Err(e) => {
                last = e.errno().unwrap_or(last);
                continue;
            }
        };

        if let Err(e) = set_reuseaddr(fd) {
            close_quietly(fd);
            return Err(e);
        }

        if unsafe { libc::bind(fd, ai.ai_addr, ai.ai_addrlen) } < 0 {
            last = Errno::last();
            close_quietly(fd);
            continue;
        }

        if unsafe { libc::listen(fd, backlog) } < 0 {
            let errno = Errno::last();
            close_quietly(fd);
            return Err(ServError::Socket { op: "listen", errno });
        }

        return Ok(fd);
    }

    Err(ServError::Bind(last))
}

/// Resolve and open a blocking client connection.
pub fn connect(host: &str, port: &str) -> Result<RawFd> {
    let addrs = AddrList::resolve(Some(host), port, false)?;

    let mut last = Errno::ECONNREFUSED;
    for ai in addrs.iter() {
        let fd = match open_stream(ai) {
            Ok(fd) => fd,
            Err(e) => {
                last = e.errno().unwrap_or(last);
                continue;
            }
        };

        loop {
            if unsafe { libc::connect(fd, ai.ai_addr, ai.ai_addrlen) } == 0 {
                return Ok(fd);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => {
                    last = errno;
                    close_quietly(fd);
                    break;
                }
            }
        }
    }

    Err(ServError::Socket { op: "connect", errno: last })
}

/// Accept one pending connection.
///
/// `Ok(None)` means the accept queue is drained (would-block). The new fd is
/// non-blocking and close-on-exec.
pub fn accept_one(listener: RawFd) -> Result<Option<Accepted>> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let fd = loop {
        match raw_accept(listener, &mut storage, &mut len) {
            Ok(fd) => break fd,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(None),
            #[allow(unreachable_patterns)]
            Err(Errno::EWOULDBLOCK) => return Ok(None),
            Err(errno) => return Err(ServError::Accept(errno)),
        }
    };

    let (peer_addr, peer_port) = match sockaddr_to_std(&storage) {
        Some(addr) => (addr.ip().to_string(), addr.port()),
        None => (String::new(), 0),
    };

    Ok(Some(Accepted { fd, peer_addr, peer_port }))
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn raw_accept(
            listener: RawFd,
            storage: &mut sockaddr_storage,
            len: &mut socklen_t,
        ) -> std::result::Result<RawFd, Errno> {
            let fd = unsafe {
                libc::accept4(
                    listener,
                    storage as *mut _ as *mut sockaddr,
                    len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            Errno::result(fd)
        }
    } else {
        // No accept4: flip the flags by hand. A failure there is reported as
        // an accept failure for this one connection.
        fn raw_accept(
            listener: RawFd,
            storage: &mut sockaddr_storage,
            len: &mut socklen_t,
        ) -> std::result::Result<RawFd, Errno> {
            let fd = Errno::result(unsafe {
                libc::accept(listener, storage as *mut _ as *mut sockaddr, len)
            })?;
            if let Err(e) = set_nonblocking(fd).and_then(|_| set_cloexec(fd)) {
                close_quietly(fd);
                return Err(e.errno().unwrap_or(Errno::EINVAL));
            }
            Ok(fd)
        }
    }
}

/// Local address a socket is bound to.
pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };
    if rc < 0 {
        return Err(ServError::Socket { op: "getsockname", errno: Errno::last() });
    }
    sockaddr_to_std(&storage).ok_or(ServError::Socket {
        op: "getsockname",
        errno: Errno::EAFNOSUPPORT,
    })
}

/// `shutdown(SHUT_RDWR)`.
pub fn shutdown(fd: RawFd) -> Result<()> {
    if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } < 0 {
        return Err(ServError::Socket { op: "shutdown", errno: Errno::last() });
    }
    Ok(())
}

/// `close(2)`. The fd is gone even when this reports an error.
pub fn close(fd: RawFd) -> Result<()> {
    if unsafe { libc::close(fd) } < 0 {
        return Err(ServError::Socket { op: "close", errno: Errno::last() });
    }
    Ok(())
}

pub(crate) fn close_quietly(fd: RawFd) {
    unsafe { libc::close(fd) };
}

fn open_stream(ai: &libc::addrinfo) -> Result<RawFd> {
    let fd = unsafe { libc::socket(ai.ai_family, ai.ai_socktype, ai.ai_protocol) };
    if fd < 0 {
        return Err(ServError::Socket { op: "socket", errno: Errno::last() });
    }
    if let Err(e) = set_cloexec(fd) {
        close_quietly(fd);
        return Err(e);
    }
    Ok(fd)
}

fn set_reuseaddr(fd: RawFd) -> Result<()> {
    let yes: c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &yes as *const _ as *const _,
            mem::size_of::<c_int>() as socklen_t,
        )
    };
    if rc < 0 {
        return Err(ServError::Socket { op: "setsockopt(SO_REUSEADDR)", errno: Errno::last() });
    }
    Ok(())
}

/// Owned `getaddrinfo` result list, freed on drop.
struct AddrList(*mut libc::addrinfo);

impl AddrList {
    fn resolve(host: Option<&str>, port: &str, passive: bool) -> Result<Self> {
        let c_host = host
            .map(CString::new)
            .transpose()
            .map_err(|_| ServError::Argument("host contains a NUL byte"))?;
        let c_port =
            CString::new(port).map_err(|_| ServError::Argument("port contains a NUL byte"))?;

        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;
        if passive && host.is_none() {
            hints.ai_flags = libc::AI_PASSIVE;
        }

        let mut list: *mut libc::addrinfo = ptr::null_mut();
        let rc = unsafe {
            libc::getaddrinfo(
                c_host.as_ref().map_or(ptr::null(), |h| h.as_ptr()),
                c_port.as_ptr(),
                &hints,
                &mut list,
            )
        };
        if rc != 0 {
            let reason = if rc == libc::EAI_SYSTEM {
                Errno::last().desc().to_string()
            } else {
                unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
                    .to_string_lossy()
                    .into_owned()
            };
            return Err(ServError::Resolve {
                host: host.map(str::to_string),
                port: port.to_string(),
                reason,
            });
        }
        Ok(AddrList(list))
    }

    fn iter(&self) -> impl Iterator<Item = &libc::addrinfo> {
        iter::successors(unsafe { self.0.as_ref() }, |ai| unsafe { ai.ai_next.as_ref() })
    }
}

impl Drop for AddrList {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libc::freeaddrinfo(self.0) };
        }
    }
}

/// Convert a kernel-filled `sockaddr_storage` to a std address.
fn sockaddr_to_std(storage: &sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
