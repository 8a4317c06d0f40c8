//! Process controller errors.

use super::output::StreamData;
use crate::error::{ErrorKind, strerror};
use crate::signal::{self, InvalidSignal};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Error type for process operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The executable, or the working directory, does not exist.
    #[error("No such file or directory: {}", .path.display())]
    NotFound {
        /// Path that was attempted.
        path: PathBuf,
    },

    /// The executable exists but could not be run.
    #[error("Permission denied: {}", .path.display())]
    PermissionDenied {
        /// Path that was attempted.
        path: PathBuf,
    },

    /// Any other OS failure while creating the child.
    #[error("{message} (os error {errno}){}", path_suffix(.path))]
    Spawn {
        /// OS error number reported by the failing call.
        errno: i32,
        /// Human readable description of `errno`.
        message: String,
        /// Path involved, when there is one.
        path: Option<PathBuf>,
    },

    /// A deadline elapsed in `wait` or `communicate`.
    #[error(transparent)]
    Timeout(TimeoutExpired),

    /// A checked command exited with a non-zero code.
    #[error(transparent)]
    Called(CalledProcessError),

    /// The API was used incorrectly. Nothing was allocated.
    #[error("{0}")]
    Usage(String),

    /// Captured output was not valid text.
    #[error("cannot decode output: {0}")]
    Decode(String),

    /// Internal consistency violation.
    #[error("internal error: {0}")]
    Internal(String),
}

fn path_suffix(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(": {}", p.display()))
        .unwrap_or_default()
}

impl ProcessError {
    /// Builds the error for a failed exec or pre-exec step.
    ///
    /// `ENOENT` names `cwd` when the child never reached exec (so the
    /// missing file is the working directory), otherwise `executable`.
    pub(crate) fn from_exec_failure(
        errno: i32,
        reached_exec: bool,
        executable: PathBuf,
        cwd: Option<PathBuf>,
    ) -> Self {
        let path = match (reached_exec, cwd) {
            (false, Some(cwd)) => cwd,
            _ => executable,
        };
        match errno {
            libc::ENOENT => Self::NotFound { path },
            libc::EACCES => Self::PermissionDenied { path },
            _ => Self::Spawn {
                errno,
                message: strerror(errno).to_string(),
                path: Some(path),
            },
        }
    }

    /// OS error number behind this error, if any.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            Self::NotFound { .. } => Some(libc::ENOENT),
            Self::PermissionDenied { .. } => Some(libc::EACCES),
            Self::Spawn { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Shared classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Spawn { .. } => ErrorKind::SpawnFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Called(_) => ErrorKind::NonZeroExit,
            Self::Usage(_) => ErrorKind::Usage,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this is a deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<InvalidSignal> for ProcessError {
    fn from(err: InvalidSignal) -> Self {
        Self::Usage(err.to_string())
    }
}

impl From<TimeoutExpired> for ProcessError {
    fn from(err: TimeoutExpired) -> Self {
        Self::Timeout(err)
    }
}

impl From<CalledProcessError> for ProcessError {
    fn from(err: CalledProcessError) -> Self {
        Self::Called(err)
    }
}

/// A `wait` or `communicate` deadline elapsed.
///
/// The child keeps running. `stdout`/`stderr` hold whatever was captured
/// before the deadline; after [`Child::kill`](super::Child::kill) a second
/// `communicate` collects the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutExpired {
    /// Command line of the child.
    pub cmd: String,
    /// The timeout that elapsed.
    pub timeout: Duration,
    /// Partial stdout.
    pub stdout: Option<StreamData>,
    /// Partial stderr.
    pub stderr: Option<StreamData>,
}

impl fmt::Display for TimeoutExpired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Command '{}' timed out after {} seconds",
            self.cmd,
            self.timeout.as_secs_f64()
        )
    }
}

impl std::error::Error for TimeoutExpired {}

/// A checked command exited with a non-zero return code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalledProcessError {
    /// Return code; negative when the child died from a signal.
    pub returncode: i32,
    /// Command line of the child.
    pub cmd: String,
    /// Captured stdout, if it was piped.
    pub stdout: Option<StreamData>,
    /// Captured stderr, if it was piped.
    pub stderr: Option<StreamData>,
}

impl fmt::Display for CalledProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.returncode < 0 {
            write!(
                f,
                "Command '{}' died with {}.",
                self.cmd,
                signal::describe(-self.returncode)
            )
        } else {
            write!(
                f,
                "Command '{}' returned non-zero exit status {}.",
                self.cmd, self.returncode
            )
        }
    }
}

impl std::error::Error for CalledProcessError {}
