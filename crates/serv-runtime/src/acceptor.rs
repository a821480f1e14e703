//! Listener drain
//!
//! Runs on every listener-readable event and accepts until the queue is
//! empty. Each connection is recorded, registered with the default
//! interest, then announced via `on_accept`.

use crate::context::Context;
use crate::handler::Handler;
use crate::socket::{self, Accepted};

use serv_core::constants::MAX_ACCEPT_ERRORS;
use serv_core::{kdebug, kwarn, ErrorKind};

pub(crate) fn accept_ready<H: Handler>(cx: &mut Context, handler: &mut H) {
    let listener = cx.listener_fd();
    let mut consecutive_errors = 0;

    loop {
        match socket::accept_one(listener) {
            Ok(None) => break,
            Ok(Some(accepted)) => {
                consecutive_errors = 0;
                admit(cx, handler, accepted);
            }
            Err(e) => {
                cx.stats.accept_errors += 1;
                consecutive_errors += 1;
                kwarn!("listener fd={}: {}", listener, e);
                handler.on_error(cx, listener, e.kind());
                if consecutive_errors >= MAX_ACCEPT_ERRORS {
                    kwarn!(
                        "listener fd={}: {} accept failures in a row, yielding",
                        listener,
                        consecutive_errors
                    );
                    break;
                }
            }
        }
    }
}

fn admit<H: Handler>(cx: &mut Context, handler: &mut H, accepted: Accepted) {
    let Accepted { fd, peer_addr, peer_port } = accepted;
    let bufs = (cx.config.read_buf_size, cx.config.write_buf_size);

    let Some(id) = cx.registry.insert(fd, peer_addr.as_str(), peer_port, bufs) else {
        socket::close_quietly(fd);
        return;
    };

    if let Err(e) = cx.notifier.add(fd, id.generation(), cx.new_fd_interest) {
        kwarn!("dropping fd={} from {}:{}: {}", fd, peer_addr, peer_port, e);
        cx.registry.remove(fd);
        handler.on_error(cx, fd, ErrorKind::Registration);
        socket::close_quietly(fd);
        return;
    }

    cx.stats.accepted += 1;
    kdebug!("accepted fd={} from {}:{} ({:?})", fd, peer_addr, peer_port, id);
    handler.on_accept(cx, fd, &peer_addr, peer_port);
}
