//! Descriptor → channel map.

use crate::channel::{Channel, ChannelError};
use crate::selector::Interest;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, warn};

/// A registry shared between loops (and with a [`ProcessContext`]).
///
/// Handlers reach the registry through [`ChannelCx::registry`]; locking
/// the shared handle from inside a callback deadlocks.
///
/// [`ProcessContext`]: crate::ProcessContext
/// [`ChannelCx::registry`]: crate::ChannelCx::registry
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Channels keyed by descriptor.
///
/// A channel is registered under exactly one descriptor. Removing or
/// closing an unknown descriptor is a no-op.
#[derive(Debug, Default)]
pub struct Registry {
    channels: BTreeMap<RawFd, Channel>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty registry behind a shared handle.
    #[must_use]
    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Registers `channel` under its descriptor.
    pub fn add(&mut self, channel: Channel) -> io::Result<RawFd> {
        let Some(fd) = channel.fd() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "channel has no handle attached",
            ));
        };
        if channel.core().is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "channel is closed",
            ));
        }
        if self.channels.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "descriptor already registered",
            ));
        }
        debug!(fd, kind = ?channel.kind(), "channel added");
        self.channels.insert(fd, channel);
        Ok(fd)
    }

    /// Unregisters the channel for `fd` without closing it.
    pub fn remove(&mut self, fd: RawFd) -> Option<Channel> {
        self.channels.remove(&fd)
    }

    /// Puts a dispatched channel back unless its callback closed it.
    pub(crate) fn restore(&mut self, channel: Channel) {
        if channel.core().is_closed() {
            debug!(fd = ?channel.fd(), "channel removed after close");
            return;
        }
        let Some(fd) = channel.fd() else {
            return;
        };
        if self.channels.contains_key(&fd) {
            warn!(fd, "descriptor re-registered during dispatch; dropping stale channel");
            return;
        }
        self.channels.insert(fd, channel);
    }

    /// Returns true if `fd` is registered.
    #[must_use]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    /// The channel registered for `fd`.
    #[must_use]
    pub fn get(&self, fd: RawFd) -> Option<&Channel> {
        self.channels.get(&fd)
    }

    /// Mutable access to the channel registered for `fd`.
    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Channel> {
        self.channels.get_mut(&fd)
    }

    /// Registered descriptors in ascending order.
    #[must_use]
    pub fn fds(&self) -> Vec<RawFd> {
        self.channels.keys().copied().collect()
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Unregisters and closes the channel for `fd`.
    ///
    /// Returns `false` if nothing was registered.
    pub fn close(&mut self, fd: RawFd) -> Result<bool, ChannelError> {
        match self.channels.remove(&fd) {
            Some(mut channel) => {
                channel.close()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Closes every channel and empties the registry.
    ///
    /// `EBADF` is always tolerated. With `ignore_all`, every close error is
    /// tolerated; otherwise the first one is returned after all channels
    /// have been closed.
    pub fn close_all(&mut self, ignore_all: bool) -> Result<(), ChannelError> {
        let mut first_error = None;
        for (fd, mut channel) in std::mem::take(&mut self.channels) {
            if let Err(err) = channel.close() {
                debug!(fd, error = %err, "close failed during close_all");
                if !ignore_all && first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// The three descriptor lists for a `select` style wait: readable,
    /// writable (never listening channels) and the union of both.
    pub(crate) fn partition(&self) -> (Vec<RawFd>, Vec<RawFd>, Vec<RawFd>) {
        let mut read = Vec::new();
        let mut write = Vec::new();
        let mut except = Vec::new();
        for (&fd, channel) in &self.channels {
            let is_r = channel.readable();
            let is_w = channel.writable();
            if is_r {
                read.push(fd);
            }
            if is_w {
                write.push(fd);
            }
            if is_r || is_w {
                except.push(fd);
            }
        }
        (read, write, except)
    }

    /// Interest bitmask per descriptor for registration-based waits.
    /// Channels with no interest are left out.
    pub(crate) fn interests(&self) -> BTreeMap<RawFd, Interest> {
        self.channels
            .iter()
            .filter_map(|(&fd, channel)| {
                let mut interest = Interest::NONE;
                if channel.readable() {
                    interest |= Interest::READABLE | Interest::PRIORITY;
                }
                if channel.writable() {
                    interest |= Interest::WRITABLE;
                }
                (!interest.is_empty()).then_some((fd, interest))
            })
            .collect()
    }
}
