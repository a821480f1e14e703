//! Connection registry
//!
//! An arena indexed directly by fd. Each slot carries a generation that is
//! bumped on every insert, so a `ConnId` (fd + generation) minted for one
//! occupant never matches the next occupant of a recycled fd number.
//!
//! The notifier stores the generation alongside each registration and hands
//! it back with every event; the dispatch loop drops events whose generation
//! disagrees with the slot.

use core::fmt;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// Identity of one connection: fd plus slot generation
///
/// Generation 0 is never issued to a connection; it marks internal fds
/// (listener, wake pipe) registered with the notifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    fd: RawFd,
    generation: u32,
}

impl ConnId {
    /// Generation used for fds that are not connections
    pub const INTERNAL_GENERATION: u32 = 0;

    #[inline]
    pub const fn new(fd: RawFd, generation: u32) -> Self {
        ConnId { fd, generation }
    }

    #[inline]
    pub const fn fd(self) -> RawFd {
        self.fd
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into the 64-bit token carried by notifier registrations
    #[inline]
    pub const fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | (self.fd as u32 as u64)
    }

    /// Inverse of `to_token`
    #[inline]
    pub const fn from_token(token: u64) -> Self {
        ConnId {
            fd: token as u32 as RawFd,
            generation: (token >> 32) as u32,
        }
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnId(fd={}, gen={})", self.fd, self.generation)
    }
}

/// State kept for one accepted socket
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnId,
    peer_addr: String,
    peer_port: u16,
    read_buf_size: usize,
    write_buf_size: usize,
    accepted_at: Instant,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.id.fd
    }

    /// Peer address in textual form (IPv4 dotted or IPv6)
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn read_buf_size(&self) -> usize {
        self.read_buf_size
    }

    pub fn write_buf_size(&self) -> usize {
        self.write_buf_size
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// fd -> Connection arena
#[derive(Default)]
pub struct Registry {
    slots: Vec<Slot>,
    live: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with slots preallocated for fds below `capacity`
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self { slots, live: 0 }
    }

    /// Record a new connection for `fd`
    ///
    /// Any previous occupant of the slot is dropped wholesale and the slot
    /// generation advances, so nothing from it is observable afterwards.
    /// Returns `None` for a negative fd.
    pub fn insert(
        &mut self,
        fd: RawFd,
        peer_addr: impl Into<String>,
        peer_port: u16,
        buf_sizes: (usize, usize),
    ) -> Option<ConnId> {
        let idx = usize::try_from(fd).ok()?;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, Slot::default);
        }

        let slot = &mut self.slots[idx];
        slot.generation = next_generation(slot.generation);
        let id = ConnId::new(fd, slot.generation);

        let previous = slot.conn.replace(Connection {
            id,
            peer_addr: peer_addr.into(),
            peer_port,
            read_buf_size: buf_sizes.0,
            write_buf_size: buf_sizes.1,
            accepted_at: Instant::now(),
        });
        if previous.is_none() {
            self.live += 1;
        }
        Some(id)
    }

    /// Connection currently occupying `fd`
    pub fn lookup(&self, fd: RawFd) -> Option<&Connection> {
        let idx = usize::try_from(fd).ok()?;
        self.slots.get(idx)?.conn.as_ref()
    }

    /// Connection for `id`, only if the slot still holds that generation
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.lookup(id.fd).filter(|c| c.id == id)
    }

    /// Whether `id` still names a live connection
    #[inline]
    pub fn is_live(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Current id for `fd`, if occupied
    pub fn id_of(&self, fd: RawFd) -> Option<ConnId> {
        self.lookup(fd).map(|c| c.id)
    }

    /// Clear the slot for `fd`, returning the departing connection
    ///
    /// The generation is kept so the next insert moves past it.
    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        let idx = usize::try_from(fd).ok()?;
        let conn = self.slots.get_mut(idx)?.conn.take();
        if conn.is_some() {
            self.live -= 1;
        }
        conn
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// fds of all live connections, ascending
    pub fn fds(&self) -> Vec<RawFd> {
        self.slots
            .iter()
            .filter_map(|s| s.conn.as_ref().map(|c| c.fd()))
            .collect()
    }
}

/// Skips `INTERNAL_GENERATION` on wrap.
#[inline]
fn next_generation(current: u32) -> u32 {
    match current.wrapping_add(1) {
        ConnId::INTERNAL_GENERATION => 1,
        g => g,
    }
}
