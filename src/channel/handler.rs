//! The capability interface every channel handler implements.

use super::{ChannelCore, ChannelError};
use crate::dispatch::Registry;
use socket2::{SockAddr, Socket};
use std::ops::{Deref, DerefMut};
use tracing::{error, warn};

/// Per-event view handed to handler callbacks.
///
/// Dereferences to the channel's [`ChannelCore`] and exposes the registry so
/// handlers can register new channels (accepted connections, for example).
/// The channel being dispatched is not in the registry while its callback
/// runs.
pub struct ChannelCx<'a> {
    core: &'a mut ChannelCore,
    registry: &'a mut Registry,
}

impl<'a> ChannelCx<'a> {
    pub(crate) fn new(core: &'a mut ChannelCore, registry: &'a mut Registry) -> Self {
        Self { core, registry }
    }

    /// The registry this channel is dispatched from.
    pub fn registry(&mut self) -> &mut Registry {
        &mut *self.registry
    }
}

impl Deref for ChannelCx<'_> {
    type Target = ChannelCore;

    fn deref(&self) -> &ChannelCore {
        &*self.core
    }
}

impl DerefMut for ChannelCx<'_> {
    fn deref_mut(&mut self) -> &mut ChannelCore {
        &mut *self.core
    }
}

/// Event callbacks for one channel.
///
/// Every method has a default. The defaults log unhandled events, close on
/// `on_close`, and log-then-close on `on_error`.
pub trait Handler: Send {
    /// Whether the loop should watch for read readiness.
    fn readable(&self, _core: &ChannelCore) -> bool {
        true
    }

    /// Whether the loop should watch for write readiness.
    ///
    /// Never consulted for listening channels.
    fn writable(&self, _core: &ChannelCore) -> bool {
        true
    }

    /// Data (or EOF) is available.
    fn on_read(&mut self, cx: &mut ChannelCx<'_>) -> Result<(), ChannelError> {
        warn!(channel = %**cx, "unhandled read event");
        Ok(())
    }

    /// The handle can take more output.
    fn on_write(&mut self, cx: &mut ChannelCx<'_>) -> Result<(), ChannelError> {
        warn!(channel = %**cx, "unhandled write event");
        Ok(())
    }

    /// A non-blocking connect completed.
    fn on_connect(&mut self, cx: &mut ChannelCx<'_>) -> Result<(), ChannelError> {
        warn!(channel = %**cx, "unhandled connect event");
        Ok(())
    }

    /// A listening channel accepted `sock` from `addr`.
    ///
    /// The default drops (closes) the connection.
    fn on_accept(
        &mut self,
        cx: &mut ChannelCx<'_>,
        sock: Socket,
        addr: SockAddr,
    ) -> Result<(), ChannelError> {
        drop(sock);
        warn!(channel = %**cx, peer = ?addr.as_socket(), "unhandled accepted event");
        Ok(())
    }

    /// Out-of-band data is pending.
    fn on_expt(&mut self, cx: &mut ChannelCx<'_>) -> Result<(), ChannelError> {
        warn!(channel = %**cx, "unhandled incoming priority event");
        Ok(())
    }

    /// The peer went away or the channel should shut down.
    fn on_close(&mut self, cx: &mut ChannelCx<'_>) -> Result<(), ChannelError> {
        warn!(channel = %**cx, "unhandled close event");
        cx.close()
    }

    /// A callback failed or panicked.
    fn on_error(&mut self, cx: &mut ChannelCx<'_>, err: &ChannelError) -> Result<(), ChannelError> {
        error!(channel = %**cx, error = %err, "uncaptured handler error, closing channel");
        self.on_close(cx)
    }
}
