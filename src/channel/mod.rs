//! Channels: one OS handle plus the handler that reacts to its events.
//!
//! A [`Channel`] pairs a [`ChannelCore`] (the handle and its lifecycle
//! flags) with a boxed [`Handler`]. The dispatch loop routes readiness to a
//! channel through a fixed set of events:
//!
//! | Event | Listening | Connecting | Connected | Buffered |
//! |-------|-----------|------------|-----------|----------|
//! | read | accept → `on_accept` | finish connect, `on_read` | `on_read` | `on_read` |
//! | write | ignored | finish connect, `on_write` | `on_write` | flush one chunk |
//! | exceptional | `SO_ERROR` set → `on_close`, else `on_expt` | same | same | same |
//!
//! Failures inside a callback stay with the channel that raised them:
//! disconnect-class errors become `on_close`, anything else (including a
//! panic) is logged through `on_error` and the channel is closed. Only
//! [`ChannelError::ExitNow`] escapes the loop.

mod handler;
mod state;

pub use handler::{ChannelCx, Handler};
pub use state::{ChannelCore, ChannelIo};

pub(crate) use state::set_nonblocking;

use crate::dispatch::Registry;
use crate::error::{ErrorKind, IoErrorKind};
use crate::selector::Interest;
use socket2::{SockAddr, Socket};
use std::any::Any;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// Errors raised by channel operations and handler callbacks.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The peer went away.
    #[error("peer closed the connection")]
    PeerClosed,
    /// A read found nothing available; the loop ignores this.
    #[error("operation would block")]
    WouldBlock,
    /// The channel has no handle yet.
    #[error("channel has no handle attached")]
    NotAttached,
    /// A socket operation was attempted on a plain descriptor.
    #[error("operation requires a socket")]
    NotSocket,
    /// An OS error outside the disconnect class.
    #[error("I/O error: {0}")]
    Fatal(#[from] io::Error),
    /// Application-level handler failure.
    #[error("handler failed: {0}")]
    Handler(String),
    /// Stop the dispatch loop and propagate to its caller.
    #[error("dispatch loop exit requested")]
    ExitNow,
}

impl ChannelError {
    /// Creates a handler failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Returns true for disconnect-class failures.
    #[must_use]
    pub fn is_peer_closed(&self) -> bool {
        match self {
            Self::PeerClosed => true,
            Self::Fatal(err) => IoErrorKind::classify(err).is_peer_closed(),
            _ => false,
        }
    }

    /// Maps onto the shared error lattice.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            _ if self.is_peer_closed() => ErrorKind::PeerClosed,
            Self::WouldBlock | Self::Fatal(_) => ErrorKind::Io,
            Self::NotAttached | Self::NotSocket => ErrorKind::Usage,
            Self::Handler(_) => ErrorKind::HandlerFailed,
            Self::ExitNow => ErrorKind::ExitRequested,
            Self::PeerClosed => ErrorKind::PeerClosed,
        }
    }
}

/// The role a channel currently plays, derived from its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Accepting connections; never watched for writability.
    Listening,
    /// A non-blocking connect is in flight.
    Connecting,
    /// Plain connected (or unconnected datagram) channel.
    Connected,
    /// Output is queued and flushed on writability.
    Buffered,
}

/// Event delivered by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Read,
    Write,
    Exceptional,
    /// Combined readiness from a registration-based selector.
    Ready(Interest),
}

/// A handle registered with a dispatch loop.
pub struct Channel {
    core: ChannelCore,
    handler: Box<dyn Handler>,
}

impl Channel {
    /// Creates a channel with no handle; attach one with
    /// [`ChannelCore::create_socket`] or [`ChannelCore::set_socket`].
    pub fn new<H: Handler + 'static>(handler: H) -> Self {
        Self {
            core: ChannelCore::new(),
            handler: Box::new(handler),
        }
    }

    /// Wraps a socket (for example one returned by `accept`).
    pub fn from_socket<H: Handler + 'static>(
        sock: Socket,
        handler: H,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            core: ChannelCore::from_socket(sock)?,
            handler: Box::new(handler),
        })
    }

    /// Wraps a duplicate of a non-socket descriptor such as a pipe end.
    pub fn from_fd<H: Handler + 'static>(
        fd: BorrowedFd<'_>,
        handler: H,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            core: ChannelCore::from_fd(fd)?,
            handler: Box::new(handler),
        })
    }

    /// Turns this into a buffered channel flushing 64 KiB per write event.
    #[must_use]
    pub fn buffered(self) -> Self {
        let chunk = crate::config::DispatchConfig::default().send_chunk;
        self.buffered_with(chunk)
    }

    /// Turns this into a buffered channel flushing `send_chunk` bytes per
    /// write event.
    #[must_use]
    pub fn buffered_with(mut self, send_chunk: usize) -> Self {
        self.core.make_buffered(send_chunk);
        self
    }

    /// Begins a non-blocking connect; see [`ChannelCore::connect`].
    pub fn connect(&mut self, addr: &SockAddr) -> Result<(), ChannelError> {
        self.core.connect(addr)
    }

    /// Handle state.
    #[must_use]
    pub fn core(&self) -> &ChannelCore {
        &self.core
    }

    /// Mutable handle state.
    pub fn core_mut(&mut self) -> &mut ChannelCore {
        &mut self.core
    }

    /// Registration key.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.core.fd()
    }

    /// Current role.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        if self.core.is_accepting() {
            ChannelKind::Listening
        } else if self.core.is_connecting() && !self.core.is_connected() {
            ChannelKind::Connecting
        } else if self.core.is_buffered() {
            ChannelKind::Buffered
        } else {
            ChannelKind::Connected
        }
    }

    /// Should the loop watch for read readiness.
    #[must_use]
    pub fn readable(&self) -> bool {
        self.handler.readable(&self.core)
    }

    /// Should the loop watch for write readiness.
    #[must_use]
    pub fn writable(&self) -> bool {
        match self.kind() {
            ChannelKind::Listening => false,
            ChannelKind::Buffered => {
                self.handler.writable(&self.core)
                    && (!self.core.is_connected() || self.core.pending_output() > 0)
            }
            ChannelKind::Connecting | ChannelKind::Connected => self.handler.writable(&self.core),
        }
    }

    /// Closes the handle without running `on_close`.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        self.core.close()
    }

    /// Delivers `event`, isolating any failure to this channel.
    ///
    /// Returns an error only for [`ChannelError::ExitNow`].
    pub(crate) fn dispatch(
        &mut self,
        registry: &mut Registry,
        event: Event,
    ) -> Result<(), ChannelError> {
        let result = self.guarded(registry, |handler, cx| route(handler, cx, event));
        self.settle(registry, result)?;
        if self.core.take_hangup() && !self.core.is_closed() {
            let result = self.guarded(registry, |handler, cx| handler.on_close(cx));
            self.settle_close(result)?;
        }
        Ok(())
    }

    fn guarded<F>(&mut self, registry: &mut Registry, f: F) -> Result<(), ChannelError>
    where
        F: FnOnce(&mut dyn Handler, &mut ChannelCx<'_>) -> Result<(), ChannelError>,
    {
        let handler = self.handler.as_mut();
        let mut cx = ChannelCx::new(&mut self.core, registry);
        match panic::catch_unwind(AssertUnwindSafe(|| f(handler, &mut cx))) {
            Ok(result) => result,
            Err(payload) => Err(ChannelError::Handler(panic_message(payload.as_ref()))),
        }
    }

    fn settle(
        &mut self,
        registry: &mut Registry,
        result: Result<(), ChannelError>,
    ) -> Result<(), ChannelError> {
        match result {
            Ok(()) | Err(ChannelError::WouldBlock) => Ok(()),
            Err(ChannelError::ExitNow) => Err(ChannelError::ExitNow),
            Err(err) if err.is_peer_closed() => {
                if self.core.is_closed() {
                    return Ok(());
                }
                let result = self.guarded(registry, |handler, cx| handler.on_close(cx));
                self.settle_close(result)
            }
            Err(err) => {
                let result = self.guarded(registry, |handler, cx| handler.on_error(cx, &err));
                match result {
                    Ok(()) => {}
                    Err(ChannelError::ExitNow) => return Err(ChannelError::ExitNow),
                    Err(secondary) => {
                        error!(channel = %self.core, error = %secondary, "error handler failed");
                    }
                }
                self.force_close();
                Ok(())
            }
        }
    }

    fn settle_close(&mut self, result: Result<(), ChannelError>) -> Result<(), ChannelError> {
        match result {
            Ok(()) | Err(ChannelError::WouldBlock) => Ok(()),
            Err(ChannelError::ExitNow) => Err(ChannelError::ExitNow),
            Err(err) => {
                error!(channel = %self.core, error = %err, "close handler failed, closing channel");
                self.force_close();
                Ok(())
            }
        }
    }

    fn force_close(&mut self) {
        if self.core.is_closed() {
            return;
        }
        if let Err(err) = self.core.close() {
            error!(channel = %self.core, error = %err, "failed to close channel");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind())
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic with non-string payload".to_string()
    }
}

fn route(
    handler: &mut dyn Handler,
    cx: &mut ChannelCx<'_>,
    event: Event,
) -> Result<(), ChannelError> {
    match event {
        Event::Read => handle_read_event(handler, cx),
        Event::Write => handle_write_event(handler, cx),
        Event::Exceptional => handle_expt_event(handler, cx),
        Event::Ready(ready) => {
            if ready.is_readable() {
                handle_read_event(handler, cx)?;
            }
            if ready.is_writable() && !cx.is_closed() {
                handle_write_event(handler, cx)?;
            }
            if ready.is_priority() && !cx.is_closed() {
                handle_expt_event(handler, cx)?;
            }
            if ready.is_hangup() && !cx.is_closed() {
                handler.on_close(cx)?;
            }
            Ok(())
        }
    }
}

fn handle_read_event(
    handler: &mut dyn Handler,
    cx: &mut ChannelCx<'_>,
) -> Result<(), ChannelError> {
    if cx.accepting {
        if let Some((sock, addr)) = cx.accept()? {
            handler.on_accept(cx, sock, addr)?;
        }
        return Ok(());
    }
    if !cx.connected && cx.connecting {
        handle_connect_event(handler, cx)?;
    }
    handler.on_read(cx)
}

fn handle_connect_event(
    handler: &mut dyn Handler,
    cx: &mut ChannelCx<'_>,
) -> Result<(), ChannelError> {
    if let Some(err) = cx.take_error()? {
        return Err(err.into());
    }
    handler.on_connect(cx)?;
    cx.connected = true;
    cx.connecting = false;
    Ok(())
}

fn handle_write_event(
    handler: &mut dyn Handler,
    cx: &mut ChannelCx<'_>,
) -> Result<(), ChannelError> {
    if cx.accepting {
        return Ok(());
    }
    if !cx.connected && cx.connecting {
        handle_connect_event(handler, cx)?;
    }
    if cx.is_buffered() {
        cx.initiate_send()
    } else {
        handler.on_write(cx)
    }
}

fn handle_expt_event(
    handler: &mut dyn Handler,
    cx: &mut ChannelCx<'_>,
) -> Result<(), ChannelError> {
    if cx.take_error()?.is_some() {
        handler.on_close(cx)
    } else {
        handler.on_expt(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use socket2::{Domain, Type};
    use std::net::SocketAddr;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    struct Quiet;

    impl Handler for Quiet {}

    #[test]
    fn listening_channel_is_never_writable() {
        init_test("listening_channel_is_never_writable");
        let mut channel = Channel::new(Quiet);
        channel
            .core_mut()
            .create_socket(Domain::IPV4, Type::STREAM)
            .expect("socket");
        channel.core_mut().set_reuse_addr();
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
        channel.core_mut().bind(&addr.into()).expect("bind");
        channel.core_mut().listen(5).expect("listen");

        crate::assert_with_log!(
            channel.kind() == ChannelKind::Listening,
            "kind",
            ChannelKind::Listening,
            channel.kind()
        );
        crate::assert_with_log!(!channel.writable(), "not writable", false, channel.writable());
        crate::assert_with_log!(channel.readable(), "readable", true, channel.readable());
        let shown = channel.core().to_string();
        crate::assert_with_log!(
            shown.contains("listening") && shown.contains("127.0.0.1"),
            "display",
            "<channel listening 127.0.0.1:0 fd=N>",
            shown
        );
        channel.close().expect("close");
        channel.close().expect("second close is a no-op");
        crate::test_complete!("listening_channel_is_never_writable");
    }

    #[test]
    fn buffered_writable_only_with_pending_output() {
        init_test("buffered_writable_only_with_pending_output");
        let (a, _b) = std::os::unix::net::UnixStream::pair().expect("pair");
        let channel = Channel::from_socket(Socket::from(std::os::fd::OwnedFd::from(a)), Quiet)
            .expect("wrap")
            .buffered();
        crate::assert_with_log!(
            channel.kind() == ChannelKind::Buffered,
            "kind",
            ChannelKind::Buffered,
            channel.kind()
        );
        crate::assert_with_log!(
            !channel.writable(),
            "nothing queued",
            false,
            channel.writable()
        );
        crate::test_complete!("buffered_writable_only_with_pending_output");
    }

    #[test]
    fn error_kinds() {
        init_test("error_kinds");
        let reset = ChannelError::from(io::Error::from_raw_os_error(libc::ECONNRESET));
        crate::assert_with_log!(
            reset.kind() == ErrorKind::PeerClosed,
            "reset",
            ErrorKind::PeerClosed,
            reset.kind()
        );
        let handler = ChannelError::handler("boom");
        crate::assert_with_log!(
            handler.kind() == ErrorKind::HandlerFailed,
            "handler",
            ErrorKind::HandlerFailed,
            handler.kind()
        );
        crate::assert_with_log!(
            !ErrorKind::ExitRequested.recoverability().should_retry(),
            "exit permanent",
            false,
            ChannelError::ExitNow.kind().recoverability()
        );
        crate::test_complete!("error_kinds");
    }
}
