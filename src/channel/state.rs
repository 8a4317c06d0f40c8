//! Handle state and non-blocking primitives for one channel.

use super::ChannelError;
use crate::buf::WriteCursor;
use crate::error::IoErrorKind;
use nix::errno::Errno;
use socket2::{Domain, SockAddr, Socket, Type};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use tracing::debug;

/// The OS handle behind a channel.
#[derive(Debug)]
pub enum ChannelIo {
    /// A socket.
    Socket(Socket),
    /// A private duplicate of a caller's descriptor (pipe, tty, ...).
    File(File),
}

impl ChannelIo {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Socket(sock) => (&*sock).read(buf),
            Self::File(file) => (&*file).read(buf),
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Socket(sock) => (&*sock).write(data),
            Self::File(file) => (&*file).write(data),
        }
    }

    /// Pending `SO_ERROR`. Plain descriptors always report none.
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Self::Socket(sock) => sock.take_error(),
            Self::File(_) => Ok(None),
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Socket(sock) => sock.as_raw_fd(),
            Self::File(file) => file.as_raw_fd(),
        }
    }

    fn into_raw_fd(self) -> RawFd {
        match self {
            Self::Socket(sock) => sock.into_raw_fd(),
            Self::File(file) => file.into_raw_fd(),
        }
    }
}

/// State shared by every channel kind: the handle, lifecycle flags, the
/// peer address and (for buffered channels) unsent output.
#[derive(Debug)]
pub struct ChannelCore {
    io: Option<ChannelIo>,
    fd: Option<RawFd>,
    pub(crate) accepting: bool,
    pub(crate) connecting: bool,
    pub(crate) connected: bool,
    pub(crate) closing: bool,
    closed: bool,
    addr: Option<SockAddr>,
    out: Option<WriteCursor>,
    send_chunk: usize,
    hangup: bool,
}

impl ChannelCore {
    pub(crate) fn new() -> Self {
        Self {
            io: None,
            fd: None,
            accepting: false,
            connecting: false,
            connected: false,
            closing: false,
            closed: false,
            addr: None,
            out: None,
            send_chunk: crate::config::DispatchConfig::default().send_chunk,
            hangup: false,
        }
    }

    /// Wraps an existing socket. The socket is switched to non-blocking
    /// mode; it counts as connected unless it has no peer yet.
    pub(crate) fn from_socket(sock: Socket) -> Result<Self, ChannelError> {
        sock.set_nonblocking(true)?;
        let mut core = Self::new();
        match sock.peer_addr() {
            Ok(addr) => {
                core.connected = true;
                core.addr = Some(addr);
            }
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::ENOTCONN) | Some(libc::EINVAL)
                ) => {}
            Err(err) => return Err(err.into()),
        }
        core.set_socket(sock);
        Ok(core)
    }

    /// Wraps a duplicate of `fd`. The caller keeps ownership of `fd`.
    pub(crate) fn from_fd(fd: BorrowedFd<'_>) -> Result<Self, ChannelError> {
        let owned: OwnedFd = fd.try_clone_to_owned()?;
        set_nonblocking(owned.as_raw_fd(), true)?;
        let mut core = Self::new();
        core.connected = true;
        core.set_file(File::from(owned));
        Ok(core)
    }

    /// Creates a non-blocking socket and attaches it.
    pub fn create_socket(&mut self, domain: Domain, ty: Type) -> Result<(), ChannelError> {
        let sock = Socket::new(domain, ty, None)?;
        sock.set_nonblocking(true)?;
        self.set_socket(sock);
        Ok(())
    }

    /// Attaches `sock` as this channel's handle.
    pub fn set_socket(&mut self, sock: Socket) {
        self.fd = Some(sock.as_raw_fd());
        self.io = Some(ChannelIo::Socket(sock));
        self.closed = false;
    }

    /// Attaches `file` as this channel's handle.
    pub fn set_file(&mut self, file: File) {
        self.fd = Some(file.as_raw_fd());
        self.io = Some(ChannelIo::File(file));
        self.closed = false;
    }

    fn io(&self) -> Result<&ChannelIo, ChannelError> {
        self.io.as_ref().ok_or(ChannelError::NotAttached)
    }

    fn socket(&self) -> Result<&Socket, ChannelError> {
        match self.io()? {
            ChannelIo::Socket(sock) => Ok(sock),
            ChannelIo::File(_) => Err(ChannelError::NotSocket),
        }
    }

    /// Descriptor this channel is registered under.
    #[must_use]
    pub fn fd(&self) -> Option<RawFd> {
        self.fd
    }

    /// Underlying handle, if attached.
    #[must_use]
    pub fn handle(&self) -> Option<&ChannelIo> {
        self.io.as_ref()
    }

    /// Peer (or bound) address.
    #[must_use]
    pub fn addr(&self) -> Option<&SockAddr> {
        self.addr.as_ref()
    }

    /// Listening for connections.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// A non-blocking connect is in flight.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Connected to a peer.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Marks the channel as winding down. Handlers use this to finish
    /// flushing output before closing.
    pub fn set_closing(&mut self) {
        self.closing = true;
    }

    /// Winding down.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// The handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Enables `SO_REUSEADDR`. Failures are ignored.
    pub fn set_reuse_addr(&mut self) {
        if let Ok(sock) = self.socket() {
            let _ = sock.set_reuse_address(true);
        }
    }

    /// Binds to `addr` and records it.
    pub fn bind(&mut self, addr: &SockAddr) -> Result<(), ChannelError> {
        self.addr = Some(addr.clone());
        self.socket()?.bind(addr)?;
        Ok(())
    }

    /// Starts listening; the channel becomes an accepting channel.
    pub fn listen(&mut self, backlog: i32) -> Result<(), ChannelError> {
        self.accepting = true;
        self.socket()?.listen(backlog)?;
        Ok(())
    }

    /// Bound local address of the socket.
    pub fn local_addr(&self) -> Result<SockAddr, ChannelError> {
        Ok(self.socket()?.local_addr()?)
    }

    /// Begins a non-blocking connect.
    ///
    /// The connect handshake is completed (and `on_connect` delivered) by
    /// the next read or write event, including when the kernel finished the
    /// connection synchronously.
    pub fn connect(&mut self, addr: &SockAddr) -> Result<(), ChannelError> {
        self.connected = false;
        self.connecting = true;
        match self.socket()?.connect(addr) {
            Ok(()) => {}
            Err(err) if connect_in_progress(&err) => {}
            Err(err) if err.raw_os_error() == Some(libc::EISCONN) => {}
            Err(err) => return Err(err.into()),
        }
        self.addr = Some(addr.clone());
        Ok(())
    }

    /// Accepts one pending connection.
    ///
    /// Returns `None` when nothing is pending or the connection was aborted
    /// before it could be accepted.
    pub fn accept(&mut self) -> Result<Option<(Socket, SockAddr)>, ChannelError> {
        match self.socket()?.accept() {
            Ok(pair) => Ok(Some(pair)),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || matches!(
                        err.raw_os_error(),
                        Some(libc::EAGAIN) | Some(libc::ECONNABORTED)
                    ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes as much of `data` as the handle accepts right now.
    ///
    /// Returns `0` when the write would block or the peer is gone; in the
    /// latter case the channel is flagged for a close event.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        match self.io()?.write(data) {
            Ok(n) => Ok(n),
            Err(err) => match IoErrorKind::classify(&err) {
                IoErrorKind::WouldBlock => Ok(0),
                IoErrorKind::PeerClosed => {
                    self.hangup = true;
                    Ok(0)
                }
                IoErrorKind::Fatal => Err(err.into()),
            },
        }
    }

    /// Reads up to `max` bytes.
    ///
    /// An empty result means the peer closed; the channel is flagged for a
    /// close event.
    pub fn recv(&mut self, max: usize) -> Result<Vec<u8>, ChannelError> {
        let mut buf = vec![0u8; max];
        let n = self.recv_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Reads into `buf`; `Ok(0)` means the peer closed.
    pub fn recv_into(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        match self.io()?.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.hangup = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) => match IoErrorKind::classify(&err) {
                IoErrorKind::WouldBlock => Err(ChannelError::WouldBlock),
                IoErrorKind::PeerClosed => {
                    self.hangup = true;
                    Ok(0)
                }
                IoErrorKind::Fatal => Err(err.into()),
            },
        }
    }

    /// Appends `data` to the output queue and pushes out what fits.
    ///
    /// Only meaningful for buffered channels; other channels send directly.
    pub fn queue_send(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        match self.out.as_mut() {
            Some(out) => out.extend(data),
            None => {
                self.send(data)?;
                return Ok(());
            }
        }
        self.initiate_send()
    }

    /// Sends at most one chunk of queued output.
    pub fn initiate_send(&mut self) -> Result<(), ChannelError> {
        let Some(out) = self.out.take() else {
            return Ok(());
        };
        let mut out = out;
        let limit = out.len().min(self.send_chunk);
        let result = if limit == 0 {
            Ok(0)
        } else {
            let chunk = out.remaining()[..limit].to_vec();
            self.send(&chunk)
        };
        if let Ok(sent) = &result {
            out.advance(*sent);
        }
        self.out = Some(out);
        result.map(|_| ())
    }

    /// Unsent bytes queued on a buffered channel.
    #[must_use]
    pub fn pending_output(&self) -> usize {
        self.out.as_ref().map_or(0, WriteCursor::len)
    }

    pub(crate) fn make_buffered(&mut self, send_chunk: usize) {
        self.send_chunk = send_chunk.max(1);
        if self.out.is_none() {
            self.out = Some(WriteCursor::new());
        }
    }

    pub(crate) fn is_buffered(&self) -> bool {
        self.out.is_some()
    }

    /// Pending socket error, as reported by `SO_ERROR`.
    pub fn take_error(&self) -> Result<Option<io::Error>, ChannelError> {
        Ok(self.io()?.take_error()?)
    }

    pub(crate) fn take_hangup(&mut self) -> bool {
        std::mem::take(&mut self.hangup)
    }

    /// Closes the handle. Closing twice is a no-op; `ENOTCONN` and `EBADF`
    /// from the OS are ignored.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        self.connected = false;
        self.accepting = false;
        self.connecting = false;
        self.closed = true;
        let Some(io) = self.io.take() else {
            return Ok(());
        };
        let fd = io.into_raw_fd();
        debug!(fd, "closing channel");
        match nix::unistd::close(fd) {
            Ok(()) | Err(Errno::ENOTCONN) | Err(Errno::EBADF) => Ok(()),
            Err(errno) => Err(io::Error::from(errno).into()),
        }
    }
}

impl std::fmt::Display for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<channel")?;
        if self.accepting && self.addr.is_some() {
            write!(f, " listening")?;
        } else if self.connected {
            write!(f, " connected")?;
        }
        if let Some(addr) = &self.addr {
            match addr.as_socket() {
                Some(sa) => write!(f, " {sa}")?,
                None => write!(f, " {addr:?}")?,
            }
        }
        match self.fd {
            Some(fd) => write!(f, " fd={fd}>"),
            None => write!(f, ">"),
        }
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || matches!(
            err.raw_os_error(),
            Some(libc::EINPROGRESS) | Some(libc::EALREADY)
        )
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags =
        nix::fcntl::OFlag::from_bits_retain(nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFL)?);
    let wanted = if nonblocking {
        flags | nix::fcntl::OFlag::O_NONBLOCK
    } else {
        flags.difference(nix::fcntl::OFlag::O_NONBLOCK)
    };
    if wanted != flags {
        nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_SETFL(wanted))?;
    }
    Ok(())
}
