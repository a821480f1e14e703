//! Interest and readiness masks
//!
//! `Interest` is what a caller asks the notifier to watch (read and/or
//! write). `Ready` is what a single event reports; it is a composition of
//! {Readable, Writable, Hangup, ReadHangup, Error} and is never persisted.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Readiness interest for a registered fd
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);
    pub const BOTH: Interest = Interest(0b11);

    #[inline]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Interest with `other` removed
    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "Interest(R|W)"),
            (true, false) => write!(f, "Interest(R)"),
            (false, true) => write!(f, "Interest(W)"),
            (false, false) => write!(f, "Interest(-)"),
        }
    }
}

/// Readiness reported by one event
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);
    pub const READABLE: Ready = Ready(1 << 0);
    pub const WRITABLE: Ready = Ready(1 << 1);
    pub const HANGUP: Ready = Ready(1 << 2);
    pub const READ_HANGUP: Ready = Ready(1 << 3);
    pub const ERROR: Ready = Ready(1 << 4);

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    #[inline]
    pub fn is_hangup(self) -> bool {
        self.contains(Self::HANGUP)
    }

    #[inline]
    pub fn is_read_hangup(self) -> bool {
        self.contains(Self::READ_HANGUP)
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    /// Any of Error, Hangup or ReadHangup
    #[inline]
    pub fn is_terminal(self) -> bool {
        self.0 & (Self::HANGUP.0 | Self::READ_HANGUP.0 | Self::ERROR.0) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Ready, &str); 5] = [
            (Ready::READABLE, "R"),
            (Ready::WRITABLE, "W"),
            (Ready::HANGUP, "HUP"),
            (Ready::READ_HANGUP, "RDHUP"),
            (Ready::ERROR, "ERR"),
        ];

        write!(f, "Ready(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "-")?;
        }
        write!(f, ")")
    }
}
