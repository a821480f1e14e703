//! Connection lifecycle callbacks
//!
//! Implement only what you need; every method defaults to a no-op. All
//! callbacks run on the dispatch thread and must not block.
//!
//! On the edge-triggered backend a readiness event is reported once per
//! transition, so `on_read`/`on_write` should move data until the fd would
//! block (see `transfer::read_some` and friends) or they will not be called
//! again for data that is already buffered.

use crate::context::Context;
use serv_core::ErrorKind;

use std::os::unix::io::RawFd;

/// What to do with a connection after `on_read`/`on_write`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Keep,
    /// Deregister and close once the current event is done
    Close,
}

pub trait Handler {
    /// A new connection was accepted and registered.
    fn on_accept(&mut self, cx: &mut Context, fd: RawFd, peer_addr: &str, peer_port: u16) {
        let _ = (cx, fd, peer_addr, peer_port);
    }

    fn on_read(&mut self, cx: &mut Context, fd: RawFd) -> Verdict {
        let _ = (cx, fd);
        Verdict::Keep
    }

    fn on_write(&mut self, cx: &mut Context, fd: RawFd) -> Verdict {
        let _ = (cx, fd);
        Verdict::Keep
    }

    /// Both directions are gone. The connection is torn down afterwards.
    fn on_hangup(&mut self, cx: &mut Context, fd: RawFd) {
        let _ = (cx, fd);
    }

    /// The peer shut down its write side. The connection is torn down
    /// afterwards; buffered data is still handed to `on_read` first.
    fn on_read_hangup(&mut self, cx: &mut Context, fd: RawFd) {
        let _ = (cx, fd);
    }

    /// `fd` is the listener for `ErrorKind::Accept`, otherwise the
    /// connection that failed.
    ///
    /// - `Accept`: after `MAX_ACCEPT_ERRORS` consecutive failures in one
    ///   wakeup the acceptor yields with connections possibly still queued.
    ///   On the epoll backend the listener is not reported again until
    ///   another connection arrives.
    /// - `Registration`: the accepted fd never became a connection. It is
    ///   already out of the registry and is closed as soon as this returns,
    ///   so it must not be kept or passed to `Context`.
    /// - `Socket`: the connection is torn down after the event's remaining
    ///   callbacks.
    fn on_error(&mut self, cx: &mut Context, fd: RawFd, kind: ErrorKind) {
        let _ = (cx, fd, kind);
    }
}
