//! Error types for the server core

use core::fmt;
use nix::errno::Errno;
use std::os::unix::io::RawFd;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServError>;

/// Errors that can occur while starting or running the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServError {
    /// Missing or invalid configuration
    Argument(&'static str),

    /// Host/port could not be resolved (getaddrinfo failure)
    Resolve {
        host: Option<String>,
        port: String,
        reason: String,
    },

    /// socket/setsockopt/listen/fcntl/shutdown/close failed
    Socket { op: &'static str, errno: Errno },

    /// No resolved address could be bound
    Bind(Errno),

    /// accept() failed with a hard (non would-block) error
    Accept(Errno),

    /// The notifier rejected an add/modify/remove
    Registration { fd: RawFd, errno: Errno },

    /// Notifier state could not be allocated
    Resource(Errno),

    /// Hard I/O failure during read/write
    Transfer(Errno),

    /// Non-blocking fd has no data/space right now
    WouldBlock { transferred: usize },

    /// wait() failed; terminates the dispatch loop
    Notifier(Errno),
}

impl ServError {
    /// Only a failing `wait` stops the loop; everything else is recovered in place.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServError::Notifier(_))
    }

    /// OS error code carried by this error, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            ServError::Socket { errno, .. } | ServError::Registration { errno, .. } => Some(*errno),
            ServError::Bind(e)
            | ServError::Accept(e)
            | ServError::Resource(e)
            | ServError::Transfer(e)
            | ServError::Notifier(e) => Some(*e),
            ServError::WouldBlock { .. } => Some(Errno::EAGAIN),
            ServError::Argument(_) | ServError::Resolve { .. } => None,
        }
    }

    /// `ErrorKind` reported to `on_error` for per-connection failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServError::Accept(_) => ErrorKind::Accept,
            ServError::Registration { .. } => ErrorKind::Registration,
            _ => ErrorKind::Socket,
        }
    }
}

impl fmt::Display for ServError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServError::Argument(msg) => write!(f, "invalid argument: {}", msg),
            ServError::Resolve { host, port, reason } => write!(
                f,
                "cannot resolve {}:{}: {}",
                host.as_deref().unwrap_or("*"),
                port,
                reason
            ),
            ServError::Socket { op, errno } => write!(f, "{} failed: {}", op, errno.desc()),
            ServError::Bind(e) => write!(f, "bind failed: {}", e.desc()),
            ServError::Accept(e) => write!(f, "accept failed: {}", e.desc()),
            ServError::Registration { fd, errno } => {
                write!(f, "notifier registration of fd {} failed: {}", fd, errno.desc())
            }
            ServError::Resource(e) => write!(f, "notifier allocation failed: {}", e.desc()),
            ServError::Transfer(e) => write!(f, "transfer failed: {}", e.desc()),
            ServError::WouldBlock { transferred } => {
                write!(f, "would block after {} bytes", transferred)
            }
            ServError::Notifier(e) => write!(f, "notifier wait failed: {}", e.desc()),
        }
    }
}

impl std::error::Error for ServError {}

/// What went wrong, as reported to the `on_error` handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// accept() on the listener failed; the acceptor keeps draining
    Accept,

    /// The backend reported an error condition on a connection
    Socket,

    /// A freshly accepted fd could not be registered with the notifier
    Registration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Accept => write!(f, "accept"),
            ErrorKind::Socket => write!(f, "socket"),
            ErrorKind::Registration => write!(f, "registration"),
        }
    }
}
