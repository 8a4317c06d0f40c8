//! Readiness interest flags.
//!
//! | Flag | `poll(2)` | `polling` |
//! |------|-----------|-----------|
//! | READABLE | POLLIN | readable |
//! | WRITABLE | POLLOUT | writable |
//! | PRIORITY | POLLPRI | N/A |
//! | ERROR | POLLERR | folded into readable/writable |
//! | HUP | POLLHUP | folded into readable |

use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Interest in (or observed) readiness events.
///
/// ```ignore
/// let interest = Interest::READABLE | Interest::WRITABLE;
/// assert!(interest.is_readable());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Interest(u8);

impl Interest {
    /// Empty set.
    pub const NONE: Self = Self(0);
    /// Read readiness.
    pub const READABLE: Self = Self(1 << 0);
    /// Write readiness.
    pub const WRITABLE: Self = Self(1 << 1);
    /// Priority / out-of-band data.
    pub const PRIORITY: Self = Self(1 << 2);
    /// Error condition on the descriptor.
    pub const ERROR: Self = Self(1 << 3);
    /// Peer hung up.
    pub const HUP: Self = Self(1 << 4);

    /// Read and write.
    #[must_use]
    pub const fn both() -> Self {
        Self(Self::READABLE.0 | Self::WRITABLE.0)
    }

    /// Check if interest contains all flags in other.
    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if the set is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Check if readable is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        (self.0 & Self::READABLE.0) != 0
    }

    /// Check if writable is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        (self.0 & Self::WRITABLE.0) != 0
    }

    /// Check if priority is set.
    #[must_use]
    pub const fn is_priority(&self) -> bool {
        (self.0 & Self::PRIORITY.0) != 0
    }

    /// Check if error or hang-up is set.
    #[must_use]
    pub const fn is_hangup(&self) -> bool {
        (self.0 & (Self::ERROR.0 | Self::HUP.0)) != 0
    }

    /// Adds flags.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Removes flags.
    #[must_use]
    pub const fn remove(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Interest {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl std::fmt::Display for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if self.is_readable() {
            parts.push("READABLE");
        }
        if self.is_writable() {
            parts.push("WRITABLE");
        }
        if self.is_priority() {
            parts.push("PRIORITY");
        }
        if self.contains(Self::ERROR) {
            parts.push("ERROR");
        }
        if self.contains(Self::HUP) {
            parts.push("HUP");
        }
        if parts.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", parts.join(" | "))
        }
    }
}
