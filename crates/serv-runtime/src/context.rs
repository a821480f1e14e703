//! Dispatch context handed to every handler callback

use crate::notifier::Notifier;
use crate::socket;
use crate::wake::{StopHandle, WakePipe};

use serv_core::{
    kdebug, kwarn, Backend, ConnId, Connection, Interest, Registry, Result, ServError,
    ServerConfig,
};

use nix::errno::Errno;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Lifetime counters for one server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Connections accepted and registered
    pub accepted: u64,
    /// Connections torn down (by event, verdict, `close` or drain)
    pub closed: u64,
    /// Hard accept() failures
    pub accept_errors: u64,
    /// Events dropped because the fd had been recycled or closed
    pub stale_events: u64,
}

/// Server state visible to handlers
///
/// Owns the notifier, the registry and the listener. Dropping it closes
/// every remaining connection and the listener.
pub struct Context {
    pub(crate) config: ServerConfig,
    pub(crate) notifier: Box<dyn Notifier>,
    pub(crate) registry: Registry,
    pub(crate) listener_fd: RawFd,
    pub(crate) wake: Arc<WakePipe>,
    pub(crate) new_fd_interest: Interest,
    pub(crate) stopping: bool,
    pub(crate) stats: Stats,
}

impl Context {
    pub(crate) fn new(
        config: ServerConfig,
        notifier: Box<dyn Notifier>,
        listener_fd: RawFd,
        wake: Arc<WakePipe>,
    ) -> Self {
        let new_fd_interest = config.new_fd_interest;
        Self {
            config,
            notifier,
            registry: Registry::new(),
            listener_fd,
            wake,
            new_fd_interest,
            stopping: false,
            stats: Stats::default(),
        }
    }

    /// The listening socket; -1 once the server has shut down
    pub fn listener_fd(&self) -> RawFd {
        self.listener_fd
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn backend(&self) -> Backend {
        self.notifier.backend()
    }

    /// Replace the readiness interest of a live connection
    ///
    /// Fails with `Registration` if `fd` is not a registered connection
    /// (the listener included) or the backend rejects the change.
    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let id = self
            .registry
            .id_of(fd)
            .ok_or(ServError::Registration { fd, errno: Errno::ENOENT })?;
        self.notifier.modify(fd, id.generation(), interest)
    }

    /// Interest used for connections accepted from now on
    pub fn set_default_new_fd_interest(&mut self, interest: Interest) {
        self.new_fd_interest = interest;
    }

    pub fn default_new_fd_interest(&self) -> Interest {
        self.new_fd_interest
    }

    pub fn connection(&self, fd: RawFd) -> Option<&Connection> {
        self.registry.lookup(fd)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Tear down the connection on `fd` now
    ///
    /// Returns false if `fd` is not a live connection. Remaining handlers
    /// for the event being dispatched are skipped.
    pub fn close(&mut self, fd: RawFd) -> bool {
        self.teardown(fd)
    }

    /// Leave the dispatch loop after the current event
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.wake))
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub(crate) fn is_live(&self, id: ConnId) -> bool {
        self.registry.is_live(id)
    }

    /// Deregister, forget, close. At most once per connection.
    pub(crate) fn teardown(&mut self, fd: RawFd) -> bool {
        if self.registry.lookup(fd).is_none() {
            return false;
        }
        if let Err(e) = self.notifier.remove(fd) {
            kwarn!("teardown fd={}: {}", fd, e);
        }
        self.registry.remove(fd);
        if let Err(e) = socket::close(fd) {
            kwarn!("teardown fd={}: {}", fd, e);
        }
        self.stats.closed += 1;
        kdebug!("closed fd={}", fd);
        true
    }

    /// Close all connections, then the listener. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        for fd in self.registry.fds() {
            self.teardown(fd);
        }
        if self.listener_fd >= 0 {
            let fd = self.listener_fd;
            let _ = self.notifier.remove(fd);
            // Not connected; ENOTCONN on most systems.
            let _ = socket::shutdown(fd);
            if let Err(e) = socket::close(fd) {
                kwarn!("closing listener fd={}: {}", fd, e);
            }
            self.listener_fd = -1;
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}
