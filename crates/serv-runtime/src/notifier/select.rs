//! Portable select(2) backend
//!
//! Level-triggered. Keeps master read/write fd_sets plus a per-fd table of
//! registration generations, and rescans `0..=high_water` after every
//! select. An fd that is both readable and writable yields a single event
//! with both bits set.
//!
//! A scan that fills the batch remembers where it stopped and the next
//! scan starts there, so a busy low fd cannot starve higher ones.

use super::batch::Batch;
use super::{check_max_batch, Event, Notifier};

use serv_core::{ktrace, Backend, Interest, Ready, Result, ServError};

use libc::fd_set;
use nix::errno::Errno;
use std::os::unix::io::RawFd;
use std::{mem, ptr};

pub struct SelectNotifier {
    read_set: fd_set,
    write_set: fd_set,
    /// Generation per registered fd, indexed by fd
    registered: Vec<Option<u32>>,
    /// Highest registered fd, -1 when empty
    high_water: RawFd,
    /// First fd of the next scan
    cursor: RawFd,
    max_batch: usize,
    batch: Batch,
}

impl SelectNotifier {
    pub fn new(max_batch: usize) -> Result<Self> {
        check_max_batch(max_batch)?;

        let mut events = Vec::new();
        events
            .try_reserve_exact(max_batch.min(libc::FD_SETSIZE as usize))
            .map_err(|_| ServError::Resource(Errno::ENOMEM))?;

        let mut read_set: fd_set = unsafe { mem::zeroed() };
        let mut write_set: fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
        }

        Ok(Self {
            read_set,
            write_set,
            registered: Vec::new(),
            high_water: -1,
            cursor: 0,
            max_batch,
            batch: Batch::new(events),
        })
    }

    fn generation_of(&self, fd: RawFd) -> Option<u32> {
        let idx = usize::try_from(fd).ok()?;
        self.registered.get(idx).copied().flatten()
    }

    fn apply(&mut self, fd: RawFd, interest: Interest) {
        unsafe {
            libc::FD_CLR(fd, &mut self.read_set);
            libc::FD_CLR(fd, &mut self.write_set);
            if interest.is_readable() {
                libc::FD_SET(fd, &mut self.read_set);
            }
            if interest.is_writable() {
                libc::FD_SET(fd, &mut self.write_set);
            }
        }
    }

    fn refill(&mut self) -> Result<()> {
        loop {
            let mut rd = self.read_set;
            let mut wr = self.write_set;
            let rc = unsafe {
                libc::select(
                    self.high_water + 1,
                    &mut rd,
                    &mut wr,
                    ptr::null_mut(),
                    ptr::null_mut(),
                )
            };
            if rc < 0 {
                match Errno::last() {
                    Errno::EINTR => continue,
                    errno => return Err(ServError::Notifier(errno)),
                }
            }

            self.batch.reset();
            let start = if self.cursor > self.high_water { 0 } else { self.cursor };
            self.cursor = 0;
            for fd in (start..=self.high_water).chain(0..start) {
                let Some(generation) = self.generation_of(fd) else {
                    continue;
                };
                let mut ready = Ready::EMPTY;
                if unsafe { libc::FD_ISSET(fd, &rd) } {
                    ready |= Ready::READABLE;
                }
                if unsafe { libc::FD_ISSET(fd, &wr) } {
                    ready |= Ready::WRITABLE;
                }
                if ready.is_empty() {
                    continue;
                }
                ktrace!("select: fd={} gen={} {:?}", fd, generation, ready);
                self.batch.push(Event { fd, generation, ready, remaining: 0 });
                if self.batch.len() >= self.max_batch {
                    self.cursor = fd + 1;
                    break;
                }
            }
            return Ok(());
        }
    }
}

impl Notifier for SelectNotifier {
    fn add(&mut self, fd: RawFd, generation: u32, interest: Interest) -> Result<()> {
        let idx = usize::try_from(fd).map_err(|_| ServError::Registration {
            fd,
            errno: Errno::EBADF,
        })?;
        if idx >= libc::FD_SETSIZE as usize {
            return Err(ServError::Registration { fd, errno: Errno::ENOSPC });
        }
        if self.generation_of(fd).is_some() {
            return Err(ServError::Registration { fd, errno: Errno::EEXIST });
        }

        if idx >= self.registered.len() {
            self.registered.resize(idx + 1, None);
        }
        self.registered[idx] = Some(generation);
        self.apply(fd, interest);
        self.high_water = self.high_water.max(fd);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, generation: u32, interest: Interest) -> Result<()> {
        if self.generation_of(fd).is_none() {
            return Err(ServError::Registration { fd, errno: Errno::ENOENT });
        }
        self.registered[fd as usize] = Some(generation);
        self.apply(fd, interest);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> Result<()> {
        if self.generation_of(fd).is_none() {
            return Err(ServError::Registration { fd, errno: Errno::ENOENT });
        }
        self.registered[fd as usize] = None;
        self.apply(fd, Interest::NONE);
        self.batch.purge(fd);

        if fd == self.high_water {
            self.high_water = self
                .registered
                .iter()
                .rposition(Option::is_some)
                .map_or(-1, |idx| idx as RawFd);
            self.registered.truncate((self.high_water + 1) as usize);
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
        Backend::Select
    }
}
