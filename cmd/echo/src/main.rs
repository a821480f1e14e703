//! libserv Echo Server
//!
//! Single-threaded TCP echo server on the libserv dispatch loop. Output
//! that does not fit in the socket buffer is parked per connection and
//! flushed when the fd turns writable again.
//!
//! Usage:
//!     cargo build --release -p serv-echo
//!     ./target/release/serv-echo [port]
//!
//! Environment (see `ServerConfig::from_env`):
//!     SERV_HOST, SERV_PORT, SERV_BACKLOG, SERV_MAX_EVENTS,
//!     SERV_READ_BUF, SERV_WRITE_BUF, SERV_NOTIFIER=auto|epoll|select,
//!     SERV_LOG_LEVEL=off|error|warn|info|debug|trace
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999

use serv_core::{kerror, kinfo, kwarn, ErrorKind, Interest, ServError, ServerConfig};
use serv_runtime::transfer::{read_some, write_fully};
use serv_runtime::{Context, Handler, Server, StopHandle, Verdict};

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::process::ExitCode;
use std::sync::OnceLock;

static STOP: OnceLock<StopHandle> = OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    // StopHandle::stop is a single write(2).
    if let Some(stop) = STOP.get() {
        stop.stop();
    }
}

#[derive(Default)]
struct Echo {
    /// Bytes read but not yet written back, per fd
    backlog: HashMap<RawFd, Vec<u8>>,
    bytes: u64,
}

impl Echo {
    /// Write `data` (after anything already parked) and park the rest.
    fn send(&mut self, cx: &mut Context, fd: RawFd, data: &[u8]) -> Verdict {
        let parked = self.backlog.entry(fd).or_default();
        let was_empty = parked.is_empty();
        parked.extend_from_slice(data);

        let written = match write_fully(fd, parked) {
            Ok(n) => n,
            Err(ServError::WouldBlock { transferred }) => transferred,
            Err(e) => {
                kwarn!("fd={}: {}", fd, e);
                return Verdict::Close;
            }
        };
        parked.drain(..written);
        self.bytes += written as u64;

        let interest = if parked.is_empty() { Interest::READABLE } else { Interest::BOTH };
        if was_empty != parked.is_empty() {
            if let Err(e) = cx.set_interest(fd, interest) {
                kwarn!("fd={}: {}", fd, e);
                return Verdict::Close;
            }
        }
        Verdict::Keep
    }
}

impl Handler for Echo {
    fn on_accept(&mut self, _cx: &mut Context, fd: RawFd, peer_addr: &str, peer_port: u16) {
        kinfo!("fd={} connected from {}:{}", fd, peer_addr, peer_port);
        self.backlog.remove(&fd);
    }

    fn on_read(&mut self, cx: &mut Context, fd: RawFd) -> Verdict {
        let size = cx.connection(fd).map_or(512, |c| c.read_buf_size());
        let mut buf = vec![0u8; size];
        loop {
            match read_some(fd, &mut buf) {
                Ok(0) => return Verdict::Close,
                Ok(n) => {
                    if self.send(cx, fd, &buf[..n]) == Verdict::Close {
                        return Verdict::Close;
                    }
                }
                Err(ServError::WouldBlock { .. }) => return Verdict::Keep,
                Err(e) => {
                    kwarn!("fd={}: {}", fd, e);
                    return Verdict::Close;
                }
            }
        }
    }

    fn on_write(&mut self, cx: &mut Context, fd: RawFd) -> Verdict {
        self.send(cx, fd, &[])
    }

    fn on_hangup(&mut self, _cx: &mut Context, fd: RawFd) {
        self.backlog.remove(&fd);
    }

    fn on_read_hangup(&mut self, _cx: &mut Context, fd: RawFd) {
        kinfo!("fd={} peer finished sending", fd);
    }

    fn on_error(&mut self, _cx: &mut Context, fd: RawFd, kind: ErrorKind) {
        kwarn!("fd={}: {} error", fd, kind);
        if kind != ErrorKind::Accept {
            self.backlog.remove(&fd);
        }
    }
}

fn main() -> ExitCode {
    let mut config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            kerror!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = std::env::args().nth(1) {
        config = config.port(port);
    }
    if config.port.is_none() {
        config = config.port("9999");
    }

    let mut server = match Server::bind(config, Echo::default()) {
        Ok(server) => server,
        Err(e) => {
            kerror!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let _ = STOP.set(server.stop_handle());
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    match server.local_addr() {
        Ok(addr) => eprintln!("serv-echo listening on {} ({:?})", addr, server.backend()),
        Err(e) => kwarn!("{}", e),
    }

    let result = server.run();
    let stats = server.stats();
    eprintln!(
        "accepted={} closed={} accept_errors={} stale={} echoed={}B",
        stats.accepted,
        stats.closed,
        stats.accept_errors,
        stats.stale_events,
        server.handler().bytes,
    );

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            kerror!("{}", e);
            ExitCode::FAILURE
        }
    }
}
