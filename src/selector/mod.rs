//! Readiness waiting shared by the dispatch loop and `communicate`.
//!
//! Two flavors with identical level-triggered semantics:
//!
//! - [`select`]: stateless three-list wait (read / write / exceptional).
//! - [`Selector`]: descriptors registered once with an [`Interest`] bitmask.

mod interest;
mod poller;
mod sys;

pub use interest::Interest;
pub use poller::Selector;
pub use sys::select;

use std::os::fd::RawFd;

/// Descriptors reported ready by [`select`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ready {
    /// Ready to read (or at EOF / in error).
    pub readable: Vec<RawFd>,
    /// Ready to write (or in error).
    pub writable: Vec<RawFd>,
    /// Exceptional condition pending.
    pub exceptional: Vec<RawFd>,
}

impl Ready {
    /// Returns true if nothing is ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty() && self.exceptional.is_empty()
    }
}
