//! Dispatch loop
//!
//! ```text
//! Starting --bind--> Running --stop / fatal wait error--> Draining --> Stopped
//! ```
//!
//! `bind` performs all of Starting and returns a server that is listening
//! but not yet dispatching. `run` blocks in the loop until a stop is
//! requested (`Ok`) or the notifier fails (`Err`), then drains: every live
//! connection is torn down, the listener is shut down and closed.

use crate::acceptor;
use crate::context::{Context, Stats};
use crate::handler::{Handler, Verdict};
use crate::notifier::{new_notifier, Event};
use crate::socket;
use crate::wake::{StopHandle, WakePipe};

use serv_core::{
    kerror, kinfo, kprint, ktrace, kwarn, Backend, ConnId, ErrorKind, Interest, Result,
    ServError, ServerConfig,
};

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Lifecycle of one server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Running,
    Draining,
    Stopped,
}

pub struct Server<H: Handler> {
    cx: Context,
    handler: H,
    state: State,
}

impl<H: Handler> Server<H> {
    /// Create the listener and notifier and register both internal fds
    ///
    /// Nothing is dispatched until `run`; connections queue in the backlog.
    pub fn bind(config: ServerConfig, handler: H) -> Result<Self> {
        kprint::init();
        config.validate()?;

        let notifier = new_notifier(config.backend, config.max_events)?;
        let wake = WakePipe::new()?;
        let port = config.port.clone().unwrap_or_default();
        let listener = socket::create_listener(config.bind_host(), &port, config.backlog)?;

        // From here on the context owns the listener and closes it on error.
        let mut cx = Context::new(config, notifier, listener, wake);
        socket::set_nonblocking(listener)?;
        cx.notifier
            .add(listener, ConnId::INTERNAL_GENERATION, Interest::READABLE)?;
        cx.notifier
            .add(cx.wake.read_fd(), ConnId::INTERNAL_GENERATION, Interest::READABLE)?;

        match socket::local_addr(listener) {
            Ok(addr) => kinfo!("listening on {} (fd {}, {:?})", addr, listener, cx.backend()),
            Err(_) => kinfo!("listening on fd {} ({:?})", listener, cx.backend()),
        }

        Ok(Self { cx, handler, state: State::Starting })
    }

    /// Dispatch events until stopped
    ///
    /// Returns `Ok(())` after a requested stop and the notifier's error
    /// after a failed `wait`. In both cases the server is `Stopped` on
    /// return, with all connections and the listener closed.
    pub fn run(&mut self) -> Result<()> {
        if self.state != State::Starting {
            return Err(ServError::Argument("server has already run"));
        }
        self.state = State::Running;
        kinfo!("running");

        let result = loop {
            if self.cx.is_stopping() {
                break Ok(());
            }
            match self.cx.notifier.wait() {
                Ok(event) => self.dispatch(event),
                Err(e) => {
                    kerror!("{}", e);
                    break Err(e);
                }
            }
        };

        self.state = State::Draining;
        kinfo!("draining {} connection(s)", self.cx.connection_count());
        self.cx.shutdown();
        self.state = State::Stopped;
        kinfo!("stopped: {:?}", self.cx.stats());
        result
    }

    fn dispatch(&mut self, event: Event) {
        let cx = &mut self.cx;
        let Event { fd, generation, ready, .. } = event;

        if fd == cx.listener_fd() {
            if ready.is_readable() {
                acceptor::accept_ready(cx, &mut self.handler);
            }
            if ready.is_terminal() {
                kwarn!("listener fd={} reported {:?}", fd, ready);
            }
            return;
        }

        if fd == cx.wake.read_fd() && generation == ConnId::INTERNAL_GENERATION {
            cx.wake.drain();
            kinfo!("stop requested");
            cx.stop();
            return;
        }

        let id = ConnId::new(fd, generation);
        if !cx.is_live(id) {
            cx.stats.stale_events += 1;
            ktrace!("stale event {:?} {:?}", id, ready);
            return;
        }

        let handler = &mut self.handler;
        let mut close = ready.is_terminal();

        // Every set bit gets its callback; the teardown below happens once.
        if ready.is_error() {
            handler.on_error(cx, fd, ErrorKind::Socket);
        }
        if ready.is_hangup() && cx.is_live(id) {
            handler.on_hangup(cx, fd);
        }
        if ready.is_read_hangup() && cx.is_live(id) {
            handler.on_read_hangup(cx, fd);
        }

        if ready.is_readable() && cx.is_live(id) && handler.on_read(cx, fd) == Verdict::Close {
            close = true;
        }
        if ready.is_writable() && cx.is_live(id) && handler.on_write(cx, fd) == Verdict::Close {
            close = true;
        }

        if close && cx.is_live(id) {
            cx.teardown(fd);
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The listening socket; -1 once stopped
    pub fn listener_fd(&self) -> RawFd {
        self.cx.listener_fd()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        socket::local_addr(self.cx.listener_fd())
    }

    pub fn backend(&self) -> Backend {
        self.cx.backend()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.cx.stop_handle()
    }

    pub fn stats(&self) -> Stats {
        self.cx.stats()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Consume the server, closing anything still open
    pub fn into_handler(self) -> H {
        self.handler
    }
}

/// Bind and run until stopped
pub fn run<H: Handler>(config: ServerConfig, handler: H) -> Result<()> {
    Server::bind(config, handler)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{read_some, write_fully};
    use serv_core::Ready;
    use std::collections::HashSet;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Log {
        accepts: Vec<(RawFd, String, u16)>,
        chunks: Vec<Vec<u8>>,
        eofs: usize,
        hangups: usize,
        read_hangups: usize,
        errors: Vec<ErrorKind>,
        live_at_accept: Vec<usize>,
        closed_at_accept: Vec<u64>,
        /// fd per terminal event; callbacks of one event land on one entry
        ends: Vec<RawFd>,
    }

    impl Log {
        fn end(&mut self, fd: RawFd) {
            if self.ends.last() != Some(&fd) {
                self.ends.push(fd);
            }
        }
    }

    /// Echoes everything back; closes on EOF or transfer failure.
    #[derive(Clone, Default)]
    struct Echo {
        log: Arc<Mutex<Log>>,
    }

    impl Handler for Echo {
        fn on_accept(&mut self, cx: &mut Context, fd: RawFd, peer_addr: &str, peer_port: u16) {
            let mut log = self.log.lock().unwrap();
            log.accepts.push((fd, peer_addr.to_string(), peer_port));
            log.live_at_accept.push(cx.connection_count());
            log.closed_at_accept.push(cx.stats().closed);
        }

        fn on_read(&mut self, cx: &mut Context, fd: RawFd) -> Verdict {
            let size = cx.connection(fd).map_or(512, |c| c.read_buf_size());
            let mut buf = vec![0u8; size];
            let mut got = Vec::new();
            let verdict = loop {
                match read_some(fd, &mut buf) {
                    Ok(0) => {
                        let mut log = self.log.lock().unwrap();
                        log.eofs += 1;
                        log.end(fd);
                        break Verdict::Close;
                    }
                    Ok(n) => {
                        got.extend_from_slice(&buf[..n]);
                        if write_fully(fd, &buf[..n]).is_err() {
                            break Verdict::Close;
                        }
                    }
                    Err(ServError::WouldBlock { .. }) => break Verdict::Keep,
                    Err(_) => break Verdict::Close,
                }
            };
            if !got.is_empty() {
                self.log.lock().unwrap().chunks.push(got);
            }
            verdict
        }

        fn on_hangup(&mut self, _cx: &mut Context, fd: RawFd) {
            let mut log = self.log.lock().unwrap();
            log.hangups += 1;
            log.end(fd);
        }

        fn on_read_hangup(&mut self, _cx: &mut Context, fd: RawFd) {
            let mut log = self.log.lock().unwrap();
            log.read_hangups += 1;
            log.end(fd);
        }

        fn on_error(&mut self, _cx: &mut Context, fd: RawFd, kind: ErrorKind) {
            let mut log = self.log.lock().unwrap();
            log.errors.push(kind);
            log.end(fd);
        }
    }

    struct Running<H> {
        port: u16,
        stop: StopHandle,
        go: Option<mpsc::Sender<()>>,
        join: JoinHandle<Result<(Stats, H)>>,
    }

    impl<H> Running<H> {
        fn go(&mut self) {
            if let Some(go) = self.go.take() {
                go.send(()).unwrap();
            }
        }

        fn finish(mut self) -> (Stats, H) {
            self.go();
            self.stop.stop();
            self.join.join().unwrap().unwrap()
        }
    }

    /// Bind on loopback in a fresh thread; the loop starts on `go()`.
    fn start<H: Handler + Send + 'static>(backend: Backend, backlog: i32, handler: H) -> Running<H> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let join = thread::spawn(move || {
            let config = ServerConfig::new()
                .host("127.0.0.1")
                .port("0")
                .backlog(backlog)
                .backend(backend);
            let mut server = Server::bind(config, handler)?;
            assert_eq!(server.state(), State::Starting);
            assert_eq!(server.backend(), backend);
            ready_tx
                .send((server.local_addr()?.port(), server.stop_handle()))
                .unwrap();
            let _ = go_rx.recv();
            server.run()?;
            assert_eq!(server.state(), State::Stopped);
            assert_eq!(server.listener_fd(), -1);
            Ok((server.stats(), server.into_handler()))
        });
        let (port, stop) = ready_rx.recv().expect("server failed to bind");
        Running { port, stop, go: Some(go_tx), join }
    }

    fn backends() -> Vec<Backend> {
        let mut v = vec![Backend::Select];
        if cfg!(any(target_os = "linux", target_os = "android")) {
            v.push(Backend::Epoll);
        }
        v
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_bind_requires_port() {
        let err = Server::bind(ServerConfig::new(), Echo::default()).err().unwrap();
        assert_eq!(err, ServError::Argument("port is required"));
    }

    #[test]
    fn test_bind_conflict_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port().to_string();
        let config = ServerConfig::new().host("127.0.0.1").port(port);
        assert!(matches!(Server::bind(config, Echo::default()), Err(ServError::Bind(_))));
    }

    #[test]
    fn test_burst_before_first_wakeup() {
        for backend in backends() {
            let echo = Echo::default();
            let log = Arc::clone(&echo.log);
            let mut server = start(backend, 1, echo);

            // Connect from separate threads: with backlog 1 the kernel may
            // hold back the last handshake until the loop starts accepting.
            let port = server.port;
            let clients: Vec<_> = (0..3)
                .map(|_| thread::spawn(move || TcpStream::connect(("127.0.0.1", port)).unwrap()))
                .collect();
            thread::sleep(Duration::from_millis(100));
            server.go();

            let clients: Vec<TcpStream> = clients.into_iter().map(|c| c.join().unwrap()).collect();
            wait_until(|| log.lock().unwrap().accepts.len() == 3);

            let expected: HashSet<u16> =
                clients.iter().map(|c| c.local_addr().unwrap().port()).collect();
            let got: HashSet<u16> = log.lock().unwrap().accepts.iter().map(|a| a.2).collect();
            assert_eq!(got, expected, "{:?}", backend);
            assert!(log.lock().unwrap().accepts.iter().all(|a| a.1 == "127.0.0.1"));

            let (stats, _) = server.finish();
            assert_eq!(stats.accepted, 3);
            assert_eq!(stats.closed, 3);
            assert_eq!(stats.accept_errors, 0);
        }
    }

    #[test]
    fn test_split_writes_arrive_in_order() {
        for backend in backends() {
            let echo = Echo::default();
            let log = Arc::clone(&echo.log);
            let mut server = start(backend, 4, echo);
            server.go();

            let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
            client.write_all(b"hello").unwrap();
            wait_until(|| log.lock().unwrap().chunks.concat().len() == 5);
            client.write_all(b"world").unwrap();
            wait_until(|| log.lock().unwrap().chunks.concat().len() == 10);

            let mut echoed = [0u8; 10];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(&echoed, b"helloworld");

            {
                let log = log.lock().unwrap();
                assert_eq!(log.chunks.len(), 2, "{:?}", backend);
                assert_eq!(log.chunks.concat(), b"helloworld");
            }
            server.finish();
        }
    }

    #[test]
    fn test_immediate_close_single_teardown() {
        for backend in backends() {
            let echo = Echo::default();
            let log = Arc::clone(&echo.log);
            let mut server = start(backend, 4, echo);
            server.go();

            drop(TcpStream::connect(("127.0.0.1", server.port)).unwrap());
            wait_until(|| {
                let log = log.lock().unwrap();
                log.eofs + log.hangups + log.read_hangups > 0
            });

            // A second client sees only itself: the first is already gone.
            let _second = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
            wait_until(|| log.lock().unwrap().accepts.len() == 2);

            let (stats, _) = server.finish();
            let log = log.lock().unwrap();
            assert_eq!(log.live_at_accept, vec![1, 1], "{:?}", backend);
            // The first connection was closed exactly once before the second arrived.
            assert_eq!(log.closed_at_accept, vec![0, 1], "{:?}", backend);
            // One terminal event for the first fd; the second is closed by the drain.
            assert_eq!(log.ends, vec![log.accepts[0].0], "{:?}", backend);
            assert!(log.eofs <= 1 && log.hangups <= 1 && log.read_hangups <= 1);
            assert!(log.errors.is_empty());
            assert_eq!(stats.accepted, 2);
            assert_eq!(stats.closed, 2);
        }
    }

    #[test]
    fn test_stop_closes_live_connections() {
        for backend in backends() {
            let echo = Echo::default();
            let log = Arc::clone(&echo.log);
            let mut server = start(backend, 4, echo);
            server.go();

            let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
            wait_until(|| log.lock().unwrap().accepts.len() == 1);

            let (stats, _) = server.finish();
            assert_eq!(stats.closed, 1);

            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).unwrap(), 0);
        }
    }

    /// Writes a greeting once the fd turns writable, then goes back to
    /// read-only interest.
    struct Greeter {
        listener_rejected: Arc<Mutex<bool>>,
    }

    impl Handler for Greeter {
        fn on_accept(&mut self, cx: &mut Context, fd: RawFd, _peer: &str, _port: u16) {
            let listener = cx.listener_fd();
            *self.listener_rejected.lock().unwrap() =
                cx.set_interest(listener, Interest::BOTH).is_err();
            cx.set_interest(fd, Interest::BOTH).unwrap();
        }

        fn on_write(&mut self, cx: &mut Context, fd: RawFd) -> Verdict {
            if write_fully(fd, b"hi\n").is_err() {
                return Verdict::Close;
            }
            cx.set_interest(fd, Interest::READABLE).unwrap();
            Verdict::Keep
        }

        fn on_read(&mut self, _cx: &mut Context, fd: RawFd) -> Verdict {
            // Unread data would turn the close into a reset.
            let mut buf = [0u8; 64];
            while let Ok(n) = read_some(fd, &mut buf) {
                if n == 0 {
                    break;
                }
            }
            Verdict::Close
        }
    }

    #[test]
    fn test_set_interest_drives_on_write() {
        for backend in backends() {
            let rejected = Arc::new(Mutex::new(false));
            let mut server =
                start(backend, 4, Greeter { listener_rejected: Arc::clone(&rejected) });
            server.go();

            let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
            let mut buf = [0u8; 3];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hi\n");

            // Any byte makes on_read ask for a close.
            client.write_all(b"x").unwrap();
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).unwrap();
            assert!(rest.is_empty(), "{:?}", backend);

            let (stats, _) = server.finish();
            assert_eq!(stats.closed, 1);
            assert!(*rejected.lock().unwrap());
        }
    }

    /// Stops the server from inside a handler.
    struct StopOnAccept;

    impl Handler for StopOnAccept {
        fn on_accept(&mut self, cx: &mut Context, _fd: RawFd, _peer: &str, _port: u16) {
            cx.stop();
        }
    }

    #[test]
    fn test_stop_from_handler() {
        let mut server = start(Backend::Select, 4, StopOnAccept);
        server.go();
        let _client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();
        let (stats, _) = server.join.join().unwrap().unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.closed, 1);
    }

    #[test]
    fn test_stale_event_dropped() {
        let config = ServerConfig::new().host("127.0.0.1").port("0").backend(Backend::Select);
        let mut server = Server::bind(config, Echo::default()).unwrap();

        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let id = server.cx.registry.insert(fds[0], "peer", 1, (512, 512)).unwrap();
        server.cx.notifier.add(fds[0], id.generation(), Interest::READABLE).unwrap();

        // An event minted for a previous occupant of the same fd.
        server.dispatch(Event {
            fd: fds[0],
            generation: id.generation().wrapping_sub(1),
            ready: Ready::READABLE | Ready::HANGUP,
            remaining: 0,
        });
        assert_eq!(server.stats().stale_events, 1);
        assert!(server.cx.connection(fds[0]).is_some());

        let log = server.handler().log.lock().unwrap();
        assert_eq!(log.hangups, 0);
        assert!(log.chunks.is_empty());
        drop(log);

        unsafe { libc::close(fds[1]) };
    }

    #[test]
    fn test_terminal_event_runs_read_then_tears_down_once() {
        let config = ServerConfig::new().host("127.0.0.1").port("0").backend(Backend::Select);
        let mut server = Server::bind(config, Echo::default()).unwrap();

        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        socket::set_nonblocking(fds[0]).unwrap();
        let id = server.cx.registry.insert(fds[0], "peer", 1, (512, 512)).unwrap();
        server.cx.notifier.add(fds[0], id.generation(), Interest::READABLE).unwrap();

        assert_eq!(unsafe { libc::write(fds[1], b"last".as_ptr().cast(), 4) }, 4);
        unsafe { libc::close(fds[1]) };

        server.dispatch(Event {
            fd: fds[0],
            generation: id.generation(),
            ready: Ready::READABLE | Ready::READ_HANGUP,
            remaining: 0,
        });

        let log = server.handler().log.lock().unwrap();
        assert_eq!(log.read_hangups, 1);
        assert_eq!(log.chunks, vec![b"last".to_vec()]);
        drop(log);
        assert_eq!(server.stats().closed, 1);
        assert!(server.cx.connection(fds[0]).is_none());
    }

    #[test]
    fn test_all_terminal_bits_reported_one_teardown() {
        let config = ServerConfig::new().host("127.0.0.1").port("0").backend(Backend::Select);
        let mut server = Server::bind(config, Echo::default()).unwrap();

        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let id = server.cx.registry.insert(fds[0], "peer", 1, (512, 512)).unwrap();
        server.cx.notifier.add(fds[0], id.generation(), Interest::READABLE).unwrap();

        server.dispatch(Event {
            fd: fds[0],
            generation: id.generation(),
            ready: Ready::ERROR | Ready::HANGUP | Ready::READ_HANGUP,
            remaining: 0,
        });

        let log = server.handler().log.lock().unwrap();
        assert_eq!((log.errors.len(), log.hangups, log.read_hangups), (1, 1, 1));
        assert_eq!(log.errors[0], ErrorKind::Socket);
        drop(log);
        assert_eq!(server.stats().closed, 1);
        assert!(server.cx.connection(fds[0]).is_none());

        unsafe { libc::close(fds[1]) };
    }

    /// Closes the connection from `on_error`.
    #[derive(Default)]
    struct CloseOnError {
        hangups: usize,
    }

    impl Handler for CloseOnError {
        fn on_error(&mut self, cx: &mut Context, fd: RawFd, _kind: ErrorKind) {
            assert!(cx.close(fd));
        }

        fn on_hangup(&mut self, _cx: &mut Context, _fd: RawFd) {
            self.hangups += 1;
        }
    }

    #[test]
    fn test_close_in_terminal_handler_suppresses_rest() {
        let config = ServerConfig::new().host("127.0.0.1").port("0").backend(Backend::Select);
        let mut server = Server::bind(config, CloseOnError::default()).unwrap();

        let mut fds = [0; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let id = server.cx.registry.insert(fds[0], "peer", 1, (512, 512)).unwrap();
        server.cx.notifier.add(fds[0], id.generation(), Interest::READABLE).unwrap();

        server.dispatch(Event {
            fd: fds[0],
            generation: id.generation(),
            ready: Ready::ERROR | Ready::HANGUP,
            remaining: 0,
        });

        assert_eq!(server.handler().hangups, 0);
        assert_eq!(server.stats().closed, 1);

        unsafe { libc::close(fds[1]) };
    }

    #[test]
    fn test_run_twice_rejected() {
        let config = ServerConfig::new().host("127.0.0.1").port("0");
        let mut server = Server::bind(config, StopOnAccept).unwrap();
        server.stop_handle().stop();
        server.run().unwrap();
        assert_eq!(server.state(), State::Stopped);
        assert!(matches!(server.run(), Err(ServError::Argument(_))));
    }
}
