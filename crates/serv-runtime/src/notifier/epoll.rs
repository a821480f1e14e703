//! Edge-triggered epoll backend
//!
//! Every registration asks for `EPOLLET | EPOLLRDHUP` on top of the caller's
//! interest. `data.u64` holds the packed `ConnId` token so the generation
//! travels with each event.

use super::batch::Batch;
use super::{check_max_batch, Event, Notifier};

use serv_core::{ktrace, Backend, ConnId, Interest, Ready, Result, ServError};

use libc::{
    epoll_event, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, EPOLL_CLOEXEC,
    EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};
use nix::errno::Errno;
use std::os::unix::io::RawFd;

pub struct EpollNotifier {
    epfd: RawFd,
    buf: Vec<epoll_event>,
    batch: Batch,
}

impl EpollNotifier {
    /// Create an epoll instance able to return `max_batch` events per wait
    pub fn new(max_batch: usize) -> Result<Self> {
        check_max_batch(max_batch)?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(max_batch)
            .map_err(|_| ServError::Resource(Errno::ENOMEM))?;
        buf.resize(max_batch, epoll_event { events: 0, u64: 0 });

        let mut events = Vec::new();
        events
            .try_reserve_exact(max_batch)
            .map_err(|_| ServError::Resource(Errno::ENOMEM))?;

        let epfd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(ServError::Resource(Errno::last()));
        }

        Ok(Self { epfd, buf, batch: Batch::new(events) })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, generation: u32, interest: Interest) -> Result<()> {
        let mut ev = epoll_event {
            events: interest_to_epoll(interest),
            u64: ConnId::new(fd, generation).to_token(),
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
            return Err(ServError::Registration { fd, errno: Errno::last() });
        }
        Ok(())
    }

    fn refill(&mut self) -> Result<()> {
        let n = loop {
            let n = unsafe {
                libc::epoll_wait(self.epfd, self.buf.as_mut_ptr(), self.buf.len() as i32, -1)
            };
            if n >= 0 {
                break n as usize;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return Err(ServError::Notifier(errno)),
            }
        };

        self.batch.reset();
        for raw in &self.buf[..n] {
            let id = ConnId::from_token(raw.u64);
            let ready = epoll_to_ready(raw.events);
            ktrace!("epoll: fd={} gen={} {:?}", id.fd(), id.generation(), ready);
            self.batch.push(Event {
                fd: id.fd(),
                generation: id.generation(),
                ready,
                remaining: 0,
            });
        }
        Ok(())
    }
}

impl Notifier for EpollNotifier {
    fn add(&mut self, fd: RawFd, generation: u32, interest: Interest) -> Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, generation, interest)
    }

    fn modify(&mut self, fd: RawFd, generation: u32, interest: Interest) -> Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, generation, interest)
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        // Kernels before 2.6.9 want a non-null event even for DEL.
        let mut ev = epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, EPOLL_CTL_DEL, fd, &mut ev) };
        self.batch.purge(fd);
        if rc < 0 {
            return Err(ServError::Registration { fd, errno: Errno::last() });
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.batch.pop() {
                return Ok(event);
            }
            self.refill()?;
        }
    }

    fn backend(&self) -> Backend {
        Backend::Epoll
    }
}

impl Drop for EpollNotifier {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut flags = EPOLLET | EPOLLRDHUP;
    if interest.is_readable() {
        flags |= EPOLLIN;
    }
    if interest.is_writable() {
        flags |= EPOLLOUT;
    }
    flags as u32
}

fn epoll_to_ready(events: u32) -> Ready {
    let mut ready = Ready::EMPTY;
    if events & EPOLLIN as u32 != 0 {
        ready |= Ready::READABLE;
    }
    if events & EPOLLOUT as u32 != 0 {
        ready |= Ready::WRITABLE;
    }
    if events & EPOLLHUP as u32 != 0 {
        ready |= Ready::HANGUP;
    }
    if events & EPOLLRDHUP as u32 != 0 {
        ready |= Ready::READ_HANGUP;
    }
    if events & EPOLLERR as u32 != 0 {
        ready |= Ready::ERROR;
    }
    ready
}
