//! Readiness notification
//!
//! One contract, two backends:
//! - `EpollNotifier` (Linux/Android): edge-triggered, events buffered from
//!   one `epoll_wait` and served one at a time.
//! - `SelectNotifier` (any unix): level-triggered scan of fd_sets up to the
//!   highest registered fd.
//!
//! Each registration carries a generation that comes back with every event,
//! so the dispatch loop can reject events aimed at a previous occupant of a
//! recycled fd number.

use serv_core::{kinfo, Backend, Interest, Ready, Result, ServError};
use std::os::unix::io::RawFd;

mod batch;
mod select;

pub use select::SelectNotifier;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub use epoll::EpollNotifier;

        fn new_epoll(max_batch: usize) -> Result<Box<dyn Notifier>> {
            Ok(Box::new(EpollNotifier::new(max_batch)?))
        }
    } else {
        fn new_epoll(_max_batch: usize) -> Result<Box<dyn Notifier>> {
            Err(ServError::Argument("epoll backend is not available on this platform"))
        }
    }
}

/// One readiness event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    /// Generation the fd was registered with
    pub generation: u32,
    pub ready: Ready,
    /// Events still queued in the current batch after this one
    pub remaining: usize,
}

/// Backend-agnostic readiness multiplexer
///
/// Owned by exactly one dispatch loop; never shared across threads.
/// Backend resources are released on drop.
pub trait Notifier {
    /// Register `fd` for `interest`, tagging its events with `generation`.
    ///
    /// Fails with `Registration` if the backend rejects the fd.
    fn add(&mut self, fd: RawFd, generation: u32, interest: Interest) -> Result<()>;

    /// Replace the interest (and generation tag) of a registered fd.
    fn modify(&mut self, fd: RawFd, generation: u32, interest: Interest) -> Result<()>;

    /// Deregister `fd`.
    ///
    /// Once this returns, `wait` never yields an event for this
    /// registration, including ones already sitting in the current batch.
    fn remove(&mut self, fd: RawFd) -> Result<()>;

    /// Next ready event, blocking without timeout when the batch is empty.
    ///
    /// `EINTR` is retried. Any other failure is `ServError::Notifier` and
    /// the notifier should be considered unusable.
    fn wait(&mut self) -> Result<Event>;

    /// The concrete backend in use (never `Backend::Auto`)
    fn backend(&self) -> Backend;
}

/// Create a notifier for `backend`, batching up to `max_batch` events
///
/// `Backend::Auto` probes epoll first and falls back to select when epoll
/// is missing or its instance cannot be created.
pub fn new_notifier(backend: Backend, max_batch: usize) -> Result<Box<dyn Notifier>> {
    match backend {
        Backend::Epoll => new_epoll(max_batch),
        Backend::Select => Ok(Box::new(SelectNotifier::new(max_batch)?)),
        Backend::Auto => {
            check_max_batch(max_batch)?;
            match new_epoll(max_batch) {
                Ok(notifier) => Ok(notifier),
                Err(e) => {
                    kinfo!("epoll unavailable ({}), using select", e);
                    Ok(Box::new(SelectNotifier::new(max_batch)?))
                }
            }
        }
    }
}

fn check_max_batch(max_batch: usize) -> Result<()> {
    if max_batch == 0 {
        return Err(ServError::Argument("max_batch must be at least 1"));
    }
    if max_batch > i32::MAX as usize {
        return Err(ServError::Argument("max_batch exceeds i32::MAX"));
    }
    Ok(())
}
