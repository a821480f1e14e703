//! Event batch shared by both backends
//!
//! A refill stores every translated event; `pop` hands them out in order.
//! `purge` drops not-yet-delivered events for an fd so a removal takes
//! effect immediately.

use super::Event;
use std::os::unix::io::RawFd;

pub(crate) struct Batch {
    events: Vec<Event>,
    next: usize,
}

impl Batch {
    pub(crate) fn new(events: Vec<Event>) -> Self {
        Self { events, next: 0 }
    }

    /// Start a new batch, reusing the allocation.
    pub(crate) fn reset(&mut self) {
        self.events.clear();
        self.next = 0;
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Events in the batch, delivered or not
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    /// Next undelivered event with `remaining` filled in
    pub(crate) fn pop(&mut self) -> Option<Event> {
        let mut event = *self.events.get(self.next)?;
        self.next += 1;
        event.remaining = self.events.len() - self.next;
        Some(event)
    }

    pub(crate) fn purge(&mut self, fd: RawFd) {
        let delivered = self.next;
        let mut idx = 0;
        self.events.retain(|e| {
            let keep = idx < delivered || e.fd != fd;
            idx += 1;
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serv_core::Ready;

    fn ev(fd: RawFd) -> Event {
        Event { fd, generation: 1, ready: Ready::READABLE, remaining: 0 }
    }

    fn batch_of(fds: &[RawFd]) -> Batch {
        let mut b = Batch::new(Vec::with_capacity(8));
        for &fd in fds {
            b.push(ev(fd));
        }
        b
    }

    #[test]
    fn test_pop_counts_down_remaining() {
        let mut b = batch_of(&[3, 4, 5]);
        assert_eq!(b.pop().map(|e| (e.fd, e.remaining)), Some((3, 2)));
        assert_eq!(b.pop().map(|e| (e.fd, e.remaining)), Some((4, 1)));
        assert_eq!(b.pop().map(|e| (e.fd, e.remaining)), Some((5, 0)));
        assert!(b.pop().is_none());
    }

    #[test]
    fn test_purge_only_touches_undelivered() {
        let mut b = batch_of(&[3, 4, 3, 5]);
        assert_eq!(b.pop().unwrap().fd, 3);

        b.purge(3);
        assert_eq!(b.pop().map(|e| (e.fd, e.remaining)), Some((4, 1)));
        assert_eq!(b.pop().map(|e| (e.fd, e.remaining)), Some((5, 0)));
        assert!(b.pop().is_none());
    }

    #[test]
    fn test_purge_current_tail() {
        let mut b = batch_of(&[7, 8]);
        b.pop();
        b.purge(8);
        assert!(b.pop().is_none());
    }

    #[test]
    fn test_reset() {
        let mut b = batch_of(&[1, 2]);
        b.pop();
        b.reset();
        assert!(b.pop().is_none());
        b.push(ev(9));
        assert_eq!(b.pop().unwrap().fd, 9);
    }
}
