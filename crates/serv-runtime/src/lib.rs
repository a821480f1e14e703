//! # serv-runtime
//!
//! Platform-specific half of libserv: everything that makes syscalls.
//!
//! This crate provides:
//! - Socket primitives (listener setup, non-blocking accept, connect)
//! - Transfer primitives over non-blocking fds
//! - The readiness notifier with epoll and select backends
//! - The acceptor and the single-threaded dispatch loop (`Server`)
//!
//! ```ignore
//! use serv_runtime::{Context, Handler, Server, Verdict};
//! use serv_core::ServerConfig;
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     fn on_read(&mut self, _cx: &mut Context, fd: i32) -> Verdict {
//!         let mut buf = [0u8; 512];
//!         match serv_runtime::transfer::read_some(fd, &mut buf) {
//!             Ok(0) | Err(_) => Verdict::Close,
//!             Ok(_) => Verdict::Keep,
//!         }
//!     }
//! }
//!
//! let config = ServerConfig::new().port("9999");
//! serv_runtime::run(config, Hello)?;
//! ```

pub mod socket;
pub mod transfer;
pub mod notifier;
pub mod handler;
pub mod context;
pub mod server;
mod acceptor;
mod wake;

// Re-exports
pub use context::{Context, Stats};
pub use handler::{Handler, Verdict};
pub use notifier::{new_notifier, Event, Notifier};
pub use server::{run, Server, State};
pub use wake::StopHandle;

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("serv-runtime needs a unix target");
    }
}
