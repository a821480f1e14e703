//! Server configuration

use crate::constants::{
    DEFAULT_BACKLOG, DEFAULT_MAX_EVENTS, DEFAULT_READ_BUF, DEFAULT_WRITE_BUF,
};
use crate::env::{env_get, env_get_opt};
use crate::error::{Result, ServError};
use crate::interest::Interest;
use std::str::FromStr;

/// Which readiness backend the notifier uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Probe at startup: epoll where it exists and works, select otherwise
    #[default]
    Auto,
    /// Edge-triggered epoll (Linux/Android only)
    Epoll,
    /// Level-triggered select scan, portable
    Select,
}

impl FromStr for Backend {
    type Err = ServError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" | "" => Ok(Backend::Auto),
            "epoll" => Ok(Backend::Epoll),
            "select" => Ok(Backend::Select),
            _ => Err(ServError::Argument("unknown notifier backend")),
        }
    }
}

/// Configuration for one `run` of the server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host; `None` (or empty) binds the wildcard address
    pub host: Option<String>,

    /// Port or service name; required. "0" picks an ephemeral port
    pub port: Option<String>,

    /// listen(2) backlog (default: 1)
    pub backlog: i32,

    /// Max events fetched from the backend per refill (default: 1000)
    pub max_events: usize,

    /// Per-connection read buffer size hint
    pub read_buf_size: usize,

    /// Per-connection write buffer size hint
    pub write_buf_size: usize,

    /// Interest registered for every newly accepted fd (default: Readable)
    pub new_fd_interest: Interest,

    /// Notifier backend selection
    pub backend: Backend,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            backlog: DEFAULT_BACKLOG,
            max_events: DEFAULT_MAX_EVENTS,
            read_buf_size: DEFAULT_READ_BUF,
            write_buf_size: DEFAULT_WRITE_BUF,
            new_fd_interest: Interest::READABLE,
            backend: Backend::Auto,
        }
    }
}

impl ServerConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `SERV_*` environment variables.
    ///
    /// Unparseable values fall back to the default; an unknown
    /// `SERV_NOTIFIER` is an error.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let backend = match env_get_opt::<String>("SERV_NOTIFIER") {
            Some(name) => name.parse()?,
            None => d.backend,
        };

        Ok(Self {
            host: env_get_opt("SERV_HOST").or(d.host),
            port: env_get_opt("SERV_PORT").or(d.port),
            backlog: env_get("SERV_BACKLOG", d.backlog),
            max_events: env_get("SERV_MAX_EVENTS", d.max_events),
            read_buf_size: env_get("SERV_READ_BUF", d.read_buf_size),
            write_buf_size: env_get("SERV_WRITE_BUF", d.write_buf_size),
            new_fd_interest: d.new_fd_interest,
            backend,
        })
    }

    /// Set the bind host (empty string means wildcard)
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port or service name
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Set the listen backlog
    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    /// Set max events per notifier refill
    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    /// Set per-connection buffer size hints
    pub fn buffer_sizes(mut self, read: usize, write: usize) -> Self {
        self.read_buf_size = read;
        self.write_buf_size = write;
        self
    }

    /// Set the interest registered for newly accepted fds
    pub fn new_fd_interest(mut self, interest: Interest) -> Self {
        self.new_fd_interest = interest;
        self
    }

    /// Force a notifier backend
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Host to hand to the resolver; empty means wildcard
    pub fn bind_host(&self) -> Option<&str> {
        self.host.as_deref().filter(|h| !h.is_empty())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.port.as_deref() {
            None | Some("") => return Err(ServError::Argument("port is required")),
            Some(_) => {}
        }
        if self.backlog < 1 {
            return Err(ServError::Argument("backlog must be at least 1"));
        }
        if self.max_events == 0 {
            return Err(ServError::Argument("max_events must be at least 1"));
        }
        if self.max_events > i32::MAX as usize {
            return Err(ServError::Argument("max_events exceeds i32::MAX"));
        }
        Ok(())
    }
}
