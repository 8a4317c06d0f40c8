//! The dispatch loop.

use super::{Registry, SharedRegistry};
use crate::channel::{Channel, ChannelError, Event};
use crate::config::{DispatchConfig, SelectorBackend};
use crate::context::ProcessContext;
use crate::selector::{self, Selector};
use std::collections::BTreeSet;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::trace;

/// Single-threaded cooperative loop over a channel registry.
///
/// Each iteration asks the OS which registered channels are ready, then
/// delivers read, write and exceptional events in that order. A channel is
/// taken out of the registry while its callback runs and put back only if
/// it is still open; a descriptor that disappears before its turn is
/// skipped silently.
#[derive(Debug)]
pub struct DispatchLoop {
    registry: SharedRegistry,
    config: DispatchConfig,
    selector: Option<Selector>,
}

impl DispatchLoop {
    /// Creates a loop over the process-wide default registry.
    #[must_use]
    pub fn new() -> Self {
        Self::from_context(&ProcessContext::global())
    }

    /// Creates a loop over the registry owned by `context`.
    #[must_use]
    pub fn from_context(context: &ProcessContext) -> Self {
        Self::with_registry(context.channels(), context.config().dispatch.clone())
    }

    /// Creates a loop over an explicit registry.
    #[must_use]
    pub fn with_registry(registry: SharedRegistry, config: DispatchConfig) -> Self {
        Self {
            registry,
            config,
            selector: None,
        }
    }

    /// The registry this loop dispatches from.
    #[must_use]
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Loop settings.
    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Registers a channel.
    pub fn add(&self, channel: Channel) -> io::Result<RawFd> {
        self.registry.lock().add(channel)
    }

    /// Closes every registered channel; see [`Registry::close_all`].
    pub fn close_all(&self, ignore_all: bool) -> Result<(), ChannelError> {
        self.registry.lock().close_all(ignore_all)
    }

    /// Runs one iteration with three descriptor lists.
    ///
    /// With nothing to watch this sleeps for `timeout` and returns without
    /// touching the OS readiness primitive.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let (read, write, except) = self.registry.lock().partition();
        if read.is_empty() && write.is_empty() && except.is_empty() {
            if let Some(timeout) = timeout {
                std::thread::sleep(timeout);
            }
            return Ok(());
        }

        let ready = selector::select(&read, &write, &except, timeout)?;
        trace!(
            readable = ready.readable.len(),
            writable = ready.writable.len(),
            exceptional = ready.exceptional.len(),
            "poll ready"
        );

        let mut registry = self.registry.lock();
        for fd in ready.readable {
            dispatch_one(&mut registry, fd, Event::Read)?;
        }
        for fd in ready.writable {
            dispatch_one(&mut registry, fd, Event::Write)?;
        }
        for fd in ready.exceptional {
            dispatch_one(&mut registry, fd, Event::Exceptional)?;
        }
        Ok(())
    }

    /// Runs one iteration through a registration-based [`Selector`].
    ///
    /// Interest is resynchronized from the registry before every wait.
    /// Returns immediately when the registry is empty.
    pub fn poll2(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let wanted = {
            let registry = self.registry.lock();
            if registry.is_empty() {
                return Ok(());
            }
            registry.interests()
        };

        if self.selector.is_none() {
            self.selector = Some(Selector::new()?);
        }
        let Some(selector) = self.selector.as_mut() else {
            return Ok(());
        };

        let stale: BTreeSet<RawFd> = selector
            .fds()
            .filter(|fd| !wanted.contains_key(fd))
            .collect();
        for fd in stale {
            selector.unregister(fd)?;
        }
        for (&fd, &interest) in &wanted {
            if selector.interest(fd).is_some() {
                selector.modify(fd, interest)?;
            } else {
                selector.register(fd, fd as usize, interest)?;
            }
        }

        let events = selector.select(timeout)?;
        trace!(ready = events.len(), "poll2 ready");

        let mut registry = self.registry.lock();
        for (key, ready) in events {
            dispatch_one(&mut registry, key as RawFd, Event::Ready(ready))?;
        }
        Ok(())
    }

    /// Runs iterations with the configured backend until the registry is
    /// empty or `count` iterations have run.
    pub fn run(&mut self, timeout: Duration, count: Option<usize>) -> Result<(), ChannelError> {
        self.run_with(timeout, count, self.config.selector)
    }

    /// [`run`](Self::run) with the configured timeout.
    pub fn run_configured(&mut self, count: Option<usize>) -> Result<(), ChannelError> {
        self.run(self.config.timeout, count)
    }

    /// [`run`](Self::run) with an explicit backend.
    pub fn run_with(
        &mut self,
        timeout: Duration,
        count: Option<usize>,
        backend: SelectorBackend,
    ) -> Result<(), ChannelError> {
        let mut remaining = count;
        while !self.registry.lock().is_empty() && remaining != Some(0) {
            match backend {
                SelectorBackend::Select => self.poll(Some(timeout))?,
                SelectorBackend::Poll => self.poll2(Some(timeout))?,
            }
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
        }
        Ok(())
    }
}

impl Default for DispatchLoop {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch_one(registry: &mut Registry, fd: RawFd, event: Event) -> Result<(), ChannelError> {
    let Some(mut channel) = registry.remove(fd) else {
        return Ok(());
    };
    let result = channel.dispatch(registry, event);
    registry.restore(channel);
    result
}
