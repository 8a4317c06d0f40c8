//! Error taxonomy shared by the dispatch loop and the process controller.
//!
//! Each subsystem has its own `thiserror` enum ([`ProcessError`],
//! [`ChannelError`], [`ConfigError`]); all of them map onto the same
//! [`ErrorKind`] so callers can branch on category and recoverability
//! without matching every variant.
//!
//! # Disconnect classification
//!
//! Socket and pipe errors are bucketed by [`IoErrorKind::classify`]:
//!
//! | errno | bucket |
//! |-------|--------|
//! | `EAGAIN` / `EWOULDBLOCK` | [`IoErrorKind::WouldBlock`] |
//! | `ECONNRESET`, `ENOTCONN`, `ESHUTDOWN`, `ECONNABORTED`, `EPIPE`, `EBADF` | [`IoErrorKind::PeerClosed`] |
//! | anything else | [`IoErrorKind::Fatal`] |
//!
//! `PeerClosed` never propagates out of channel send/recv paths; it becomes a
//! close event instead.
//!
//! [`ProcessError`]: crate::process::ProcessError
//! [`ChannelError`]: crate::channel::ChannelError
//! [`ConfigError`]: crate::config::ConfigError

use nix::errno::Errno;
use std::io;

/// Error codes that mean "the other side went away".
pub const DISCONNECTED: [Errno; 6] = [
    Errno::ECONNRESET,
    Errno::ENOTCONN,
    Errno::ESHUTDOWN,
    Errno::ECONNABORTED,
    Errno::EPIPE,
    Errno::EBADF,
];

/// Returns true if `errno` belongs to the disconnect class.
#[must_use]
pub fn is_disconnect(errno: i32) -> bool {
    DISCONNECTED.contains(&Errno::from_raw(errno))
}

/// Bucket an OS-level I/O failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoErrorKind {
    /// The operation would block; retry once the handle is ready again.
    WouldBlock,
    /// The peer disconnected; convert into a close event.
    PeerClosed,
    /// A real fault; propagate.
    Fatal,
}

impl IoErrorKind {
    /// Classifies an I/O error.
    #[must_use]
    pub fn classify(err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::WouldBlock {
            return Self::WouldBlock;
        }
        match err.raw_os_error() {
            Some(code) if Errno::from_raw(code) == Errno::EAGAIN => Self::WouldBlock,
            Some(code) if is_disconnect(code) => Self::PeerClosed,
            Some(_) => Self::Fatal,
            None => match err.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected => Self::PeerClosed,
                _ => Self::Fatal,
            },
        }
    }

    /// Returns true for the disconnect bucket.
    #[must_use]
    pub const fn is_peer_closed(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Spawn ===
    /// The executable (or working directory) does not exist.
    NotFound,
    /// The executable could not be run due to permissions.
    PermissionDenied,
    /// Any other OS failure while creating the child.
    SpawnFailed,

    // === Time ===
    /// A `wait`/`communicate` deadline elapsed.
    Timeout,

    // === Exit status ===
    /// A checked command returned a non-zero code.
    NonZeroExit,

    // === Channels ===
    /// The peer of a channel went away.
    PeerClosed,
    /// A channel handler failed.
    HandlerFailed,
    /// A handler asked the dispatch loop to stop.
    ExitRequested,

    // === Caller mistakes ===
    /// The API was used incorrectly; no OS resource was touched.
    Usage,
    /// Configuration could not be loaded or failed validation.
    ConfigError,
    /// Captured output could not be decoded as text.
    Decode,

    // === Internal / OS ===
    /// Internal consistency violation (bug).
    Internal,
    /// Any other I/O error.
    Io,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound | Self::PermissionDenied | Self::SpawnFailed => ErrorCategory::Spawn,
            Self::Timeout => ErrorCategory::Timeout,
            Self::NonZeroExit => ErrorCategory::Exit,
            Self::PeerClosed | Self::HandlerFailed | Self::ExitRequested => {
                ErrorCategory::Channel
            }
            Self::Usage | Self::ConfigError | Self::Decode => ErrorCategory::Usage,
            Self::Internal => ErrorCategory::Internal,
            Self::Io => ErrorCategory::Io,
        }
    }

    /// Returns the recoverability classification for this error kind.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::Timeout => Recoverability::Transient,
            Self::NotFound
            | Self::PermissionDenied
            | Self::Usage
            | Self::ConfigError
            | Self::Decode
            | Self::Internal
            | Self::PeerClosed
            | Self::ExitRequested => Recoverability::Permanent,
            Self::SpawnFailed | Self::NonZeroExit | Self::HandlerFailed | Self::Io => {
                Recoverability::Unknown
            }
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Child creation failures.
    Spawn,
    /// Deadline expiry.
    Timeout,
    /// Child exit status failures.
    Exit,
    /// Dispatch-loop channel failures.
    Channel,
    /// Caller mistakes.
    Usage,
    /// Bugs in this crate.
    Internal,
    /// Uncategorized OS failures.
    Io,
}

/// Classification of error recoverability for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recoverability {
    /// Temporary failure that may succeed on retry.
    Transient,
    /// Permanent failure that will not succeed on retry.
    Permanent,
    /// Depends on context.
    Unknown,
}

impl Recoverability {
    /// Returns true if this error is safe to retry.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns true if this error should never be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent)
    }
}

/// Human-readable description of an errno value.
#[must_use]
pub fn strerror(errno: i32) -> &'static str {
    Errno::from_raw(errno).desc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn disconnect_codes_classify_as_peer_closed() {
        init_test("disconnect_codes_classify_as_peer_closed");
        for errno in DISCONNECTED {
            let err = io::Error::from_raw_os_error(errno as i32);
            let kind = IoErrorKind::classify(&err);
            crate::assert_with_log!(
                kind == IoErrorKind::PeerClosed,
                "disconnect errno",
                IoErrorKind::PeerClosed,
                kind
            );
        }
        crate::test_complete!("disconnect_codes_classify_as_peer_closed");
    }

    #[test]
    fn would_block_and_fatal() {
        init_test("would_block_and_fatal");
        let eagain = io::Error::from_raw_os_error(libc::EAGAIN);
        let kind = IoErrorKind::classify(&eagain);
        crate::assert_with_log!(
            kind == IoErrorKind::WouldBlock,
            "eagain",
            IoErrorKind::WouldBlock,
            kind
        );

        let enospc = io::Error::from_raw_os_error(libc::ENOSPC);
        let kind = IoErrorKind::classify(&enospc);
        crate::assert_with_log!(kind == IoErrorKind::Fatal, "enospc", IoErrorKind::Fatal, kind);

        let synthetic = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        let kind = IoErrorKind::classify(&synthetic);
        crate::assert_with_log!(
            kind.is_peer_closed(),
            "synthetic broken pipe",
            IoErrorKind::PeerClosed,
            kind
        );
        crate::test_complete!("would_block_and_fatal");
    }

    #[test]
    fn kind_category_and_recoverability() {
        init_test("kind_category_and_recoverability");
        crate::assert_with_log!(
            ErrorKind::Timeout.recoverability().should_retry(),
            "timeout transient",
            true,
            ErrorKind::Timeout.recoverability()
        );
        crate::assert_with_log!(
            ErrorKind::Internal.recoverability().is_permanent(),
            "internal permanent",
            true,
            ErrorKind::Internal.recoverability()
        );
        crate::assert_with_log!(
            ErrorKind::NotFound.category() == ErrorCategory::Spawn,
            "not found is spawn",
            ErrorCategory::Spawn,
            ErrorKind::NotFound.category()
        );
        crate::test_complete!("kind_category_and_recoverability");
    }
}
