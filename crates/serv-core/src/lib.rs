//! # serv-core
//!
//! Core types for the libserv single-threaded, event-driven TCP server.
//!
//! This crate is platform-agnostic and performs no syscalls of its own.
//! Everything that touches sockets or readiness notification lives in
//! `serv-runtime`.
//!
//! ## Modules
//!
//! - `error` - Error taxonomy (`ServError`) and the `ErrorKind` handed to `on_error`
//! - `interest` - Interest masks (what to watch) and readiness masks (what fired)
//! - `config` - Server configuration and validation
//! - `registry` - fd-indexed connection arena with per-slot generations
//! - `kprint` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

pub mod error;
pub mod interest;
pub mod config;
pub mod registry;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use config::{Backend, ServerConfig};
pub use error::{ErrorKind, Result, ServError};
pub use interest::{Interest, Ready};
pub use registry::{ConnId, Connection, Registry};
pub use env::{env_get, env_get_bool, env_get_opt};

/// Defaults shared by the config layer and the runtime.
pub mod constants {
    /// Listen backlog used when none is configured.
    pub const DEFAULT_BACKLOG: i32 = 1;

    /// Events fetched from the backend per `wait` refill.
    pub const DEFAULT_MAX_EVENTS: usize = 1000;

    /// Per-connection read buffer size hint (bytes).
    pub const DEFAULT_READ_BUF: usize = 512;

    /// Per-connection write buffer size hint (bytes).
    pub const DEFAULT_WRITE_BUF: usize = 512;

    /// Hard accept failures tolerated in one listener wakeup before the
    /// acceptor yields back to the loop.
    pub const MAX_ACCEPT_ERRORS: usize = 16;
}
