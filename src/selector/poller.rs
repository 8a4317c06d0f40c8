//! Registration-based selector over the `polling` crate.
//!
//! `polling` delivers one-shot notifications. [`Selector::select`] re-arms
//! every registration before waiting, which gives the same level-triggered
//! behavior as [`select`](super::select) while keeping the interest set
//! in the kernel between calls.

// Allow unsafe code for BorrowedFd construction around the polling crate.
// Callers keep each descriptor open until it is unregistered.
#![allow(unsafe_code)]

use super::Interest;
use polling::{Event as PollEvent, Poller};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Registration {
    key: usize,
    interest: Interest,
}

/// Readiness selector with explicit per-descriptor interest.
pub struct Selector {
    poller: Poller,
    registrations: BTreeMap<RawFd, Registration>,
    events: Vec<PollEvent>,
}

impl Selector {
    /// Creates an empty selector.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            registrations: BTreeMap::new(),
            events: Vec::new(),
        })
    }

    fn to_poll_event(key: usize, interest: Interest) -> PollEvent {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => PollEvent::all(key),
            (true, false) => PollEvent::readable(key),
            (false, true) => PollEvent::writable(key),
            (false, false) => PollEvent::none(key),
        }
    }

    fn to_interest(event: &PollEvent) -> Interest {
        let mut interest = Interest::NONE;
        if event.readable {
            interest |= Interest::READABLE;
        }
        if event.writable {
            interest |= Interest::WRITABLE;
        }
        interest
    }

    /// Starts watching `fd`, reporting its events under `key`.
    pub fn register(&mut self, fd: RawFd, key: usize, interest: Interest) -> io::Result<()> {
        if self.registrations.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        // SAFETY: the caller keeps `fd` open until `unregister`; the borrow
        // only lives for this call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.add(&borrowed, Self::to_poll_event(key, interest))?;
        self.registrations.insert(fd, Registration { key, interest });
        Ok(())
    }

    /// Changes the interest for a registered descriptor.
    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let reg = self
            .registrations
            .get_mut(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor not registered"))?;
        reg.interest = interest;
        Ok(())
    }

    /// Stops watching `fd`. Unknown descriptors are ignored, as are kernel
    /// errors for descriptors that were already closed.
    pub fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registrations.remove(&fd).is_none() {
            return Ok(());
        }
        // SAFETY: see `register`.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.poller.delete(&borrowed) {
            Ok(()) => Ok(()),
            Err(err)
                if err.kind() == io::ErrorKind::NotFound
                    || err.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Current interest for `fd`, if registered.
    #[must_use]
    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.registrations.get(&fd).map(|reg| reg.interest)
    }

    /// Registered descriptors.
    pub fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.registrations.keys().copied()
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn rearm(&self, fd: RawFd, reg: Registration) -> io::Result<()> {
        let event = Self::to_poll_event(reg.key, reg.interest);
        // SAFETY: see `register`.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.poller.modify(&borrowed, event) {
            // The descriptor was closed and its number reused since the last
            // wait; the kernel dropped the old entry.
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.poller.add(&borrowed, event)
            }
            other => other,
        }
    }

    /// Waits for readiness and returns `(key, ready)` pairs.
    ///
    /// An interrupted wait returns an empty list.
    pub fn select(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(usize, Interest)>> {
        for (&fd, &reg) in &self.registrations {
            self.rearm(fd, reg)?;
        }
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }
        Ok(self
            .events
            .iter()
            .map(|event| (event.key, Self::to_interest(event)))
            .filter(|(_, ready)| !ready.is_empty())
            .collect())
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("registration_count", &self.registrations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn duplicate_registration_rejected() {
        init_test("duplicate_registration_rejected");
        let (a, _b) = UnixStream::pair().expect("pair");
        let mut selector = Selector::new().expect("selector");
        selector
            .register(a.as_raw_fd(), 7, Interest::READABLE)
            .expect("register");
        let err = selector
            .register(a.as_raw_fd(), 8, Interest::READABLE)
            .expect_err("duplicate");
        crate::assert_with_log!(
            err.kind() == io::ErrorKind::AlreadyExists,
            "already exists",
            io::ErrorKind::AlreadyExists,
            err.kind()
        );
        selector.unregister(a.as_raw_fd()).expect("unregister");
        selector.unregister(a.as_raw_fd()).expect("idempotent");
        crate::assert_with_log!(selector.is_empty(), "empty", true, selector.len());
        crate::test_complete!("duplicate_registration_rejected");
    }

    #[test]
    fn level_triggered_across_waits() {
        init_test("level_triggered_across_waits");
        let (mut a, b) = UnixStream::pair().expect("pair");
        let mut selector = Selector::new().expect("selector");
        selector
            .register(b.as_raw_fd(), 3, Interest::READABLE)
            .expect("register");
        a.write_all(b"ping").expect("write");

        // Data is never read, so the descriptor must stay ready.
        for round in 0..2 {
            let ready = selector
                .select(Some(Duration::from_millis(200)))
                .expect("select");
            crate::assert_with_log!(
                ready.len() == 1 && ready[0].0 == 3 && ready[0].1.is_readable(),
                "readable key",
                round,
                ready
            );
        }

        selector.modify(b.as_raw_fd(), Interest::NONE).expect("modify");
        let ready = selector
            .select(Some(Duration::from_millis(20)))
            .expect("select");
        crate::assert_with_log!(ready.is_empty(), "no interest", "[]", ready);
        crate::test_complete!("level_triggered_across_waits");
    }
}
