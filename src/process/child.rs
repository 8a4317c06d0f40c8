//! Handle to a spawned child process.

use super::communicate::Communication;
use super::error::{ProcessError, TimeoutExpired};
use super::output::DecodeErrors;
use super::stdio::{Buffering, ChildStderr, ChildStdin, ChildStdout};
use super::sys;
use crate::config::ProcessConfig;
use crate::context::ProcessContext;
use crate::signal::{self, SignalKind};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fmt;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle to a spawned child process.
///
/// This handle can be used to:
/// - Access stdin/stdout/stderr pipes
/// - Exchange data with [`communicate`](Self::communicate)
/// - Wait for the process to exit
/// - Send signals
///
/// The return code is set exactly once, when the child is reaped, and is
/// cached afterwards: repeated [`poll`](Self::poll) and [`wait`](Self::wait)
/// calls return it without touching the OS again.
///
/// # Drop Behavior
///
/// Dropping a `Child` whose return code is still unknown logs a warning and
/// hands the pid to the owning [`ProcessContext`], whose
/// [`cleanup`](ProcessContext::cleanup) reaps it later. Set
/// `kill_on_drop(true)` on the `Command` to kill it first.
pub struct Child {
    pid: i32,
    returncode: Option<i32>,
    pub(super) stdin: Option<ChildStdin>,
    pub(super) stdout: Option<ChildStdout>,
    pub(super) stderr: Option<ChildStderr>,
    args: Vec<String>,
    pub(super) cmd: String,
    pub(super) text: Option<DecodeErrors>,
    pub(super) comm: Communication,
    pub(super) config: ProcessConfig,
    context: Arc<ProcessContext>,
    kill_on_drop: bool,
}

/// What [`Child::new`] needs besides the pid.
pub(crate) struct ChildParts {
    pub streams: [Option<OwnedFd>; 3],
    pub buffering: Buffering,
    pub args: Vec<String>,
    pub cmd: String,
    pub text: Option<DecodeErrors>,
    pub context: Arc<ProcessContext>,
    pub kill_on_drop: bool,
}

impl Child {
    pub(crate) fn new(pid: i32, parts: ChildParts) -> Self {
        let [stdin, stdout, stderr] = parts.streams;
        let config = parts.context.config().process.clone();
        Self {
            pid,
            returncode: None,
            stdin: stdin.map(|fd| ChildStdin::new(fd, parts.buffering)),
            stdout: stdout.map(|fd| ChildStdout::new(fd, parts.buffering, parts.text)),
            stderr: stderr.map(|fd| ChildStderr::new(fd, parts.buffering, parts.text)),
            args: parts.args,
            cmd: parts.cmd,
            text: parts.text,
            comm: Communication::default(),
            config,
            context: parts.context,
            kill_on_drop: parts.kill_on_drop,
        }
    }

    /// Returns the process ID of the child.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.pid as u32
    }

    /// Returns the process ID as the OS reports it.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The argument vector the child was started with.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The cached return code, `None` until the child has been reaped.
    ///
    /// Negative values mean "terminated by signal `-code`".
    #[must_use]
    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    /// The cached return code as an [`ExitStatus`].
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.returncode.map(ExitStatus::from_returncode)
    }

    /// Takes ownership of the child's stdin handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Takes ownership of the child's stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Takes ownership of the child's stderr handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Borrows the stdin handle without taking it.
    pub fn stdin_mut(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    /// Borrows the stdout handle without taking it.
    pub fn stdout_mut(&mut self) -> Option<&mut ChildStdout> {
        self.stdout.as_mut()
    }

    /// Borrows the stderr handle without taking it.
    pub fn stderr_mut(&mut self) -> Option<&mut ChildStderr> {
        self.stderr.as_mut()
    }

    fn set_returncode(&mut self, code: i32) -> Result<i32, ProcessError> {
        if let Some(previous) = self.returncode {
            return Err(ProcessError::Internal(format!(
                "child {} reaped twice (had {previous}, got {code})",
                self.pid
            )));
        }
        debug!(pid = self.pid, returncode = code, "child reaped");
        self.returncode = Some(code);
        Ok(code)
    }

    /// Checks whether the child has exited, without blocking.
    ///
    /// A child the OS no longer knows about (`ECHILD`) counts as exited
    /// with code 0.
    ///
    /// # Errors
    ///
    /// Returns an error for unexpected `waitpid` failures or an
    /// undecodable status.
    pub fn poll(&mut self) -> Result<Option<i32>, ProcessError> {
        if let Some(code) = self.returncode {
            return Ok(Some(code));
        }
        match sys::waitpid(self.pid, true) {
            Ok(Some(status)) => {
                let code = sys::decode_wait_status(status)?;
                self.set_returncode(code).map(Some)
            }
            Ok(None) => Ok(None),
            Err(err) if err.raw_os_error() == Some(libc::ECHILD) => self.set_returncode(0).map(Some),
            Err(err) => Err(err.into()),
        }
    }

    /// Waits for the child to exit.
    ///
    /// With a timeout the child is polled on an exponential backoff
    /// (configured by [`BackoffConfig`](crate::config::BackoffConfig));
    /// without one this blocks in `waitpid`.
    ///
    /// # Errors
    ///
    /// [`ProcessError::Timeout`] if the deadline passes first. The child is
    /// left running.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut child = Command::new("sleep").arg("1").spawn()?;
    /// let code = child.wait(Some(Duration::from_secs(5)))?;
    /// assert_eq!(code, 0);
    /// ```
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<i32, ProcessError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.wait_until(deadline, timeout)
    }

    pub(super) fn wait_until(
        &mut self,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<i32, ProcessError> {
        if let Some(code) = self.returncode {
            return Ok(code);
        }
        let Some(deadline) = deadline else {
            return self.wait_blocking();
        };

        let backoff = self.config.wait_backoff;
        let mut delay = backoff.initial;
        loop {
            if let Some(code) = self.poll()? {
                return Ok(code);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timeout_error(timeout.unwrap_or_default()));
            }
            delay = backoff.next_delay(delay, remaining);
            std::thread::sleep(delay);
        }
    }

    fn wait_blocking(&mut self) -> Result<i32, ProcessError> {
        loop {
            match sys::waitpid(self.pid, false) {
                Ok(Some(status)) => {
                    let code = sys::decode_wait_status(status)?;
                    return self.set_returncode(code);
                }
                Ok(None) => continue,
                Err(err) if err.raw_os_error() == Some(libc::ECHILD) => {
                    return self.set_returncode(0);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(super) fn timeout_error(&self, timeout: Duration) -> ProcessError {
        ProcessError::Timeout(TimeoutExpired {
            cmd: self.cmd.clone(),
            timeout,
            stdout: None,
            stderr: None,
        })
    }

    /// Sends `signal` to the child.
    ///
    /// Does nothing once the child has been reaped.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses the signal.
    pub fn send_signal(&mut self, signal: SignalKind) -> Result<(), ProcessError> {
        self.send_signal_raw(signal.as_raw_value())
    }

    /// Sends a signal by number. `0` only checks that the child exists.
    ///
    /// # Errors
    ///
    /// A negative or unknown number is a usage error; otherwise as
    /// [`send_signal`](Self::send_signal).
    pub fn send_signal_raw(&mut self, signo: i32) -> Result<(), ProcessError> {
        signal::check_signo(signo)?;
        let sig = match signo {
            0 => None,
            n => Some(Signal::try_from(n).map_err(|_| {
                ProcessError::Usage(format!("unsupported signal number {n}"))
            })?),
        };
        if self.returncode.is_some() {
            return Ok(());
        }
        match kill(Pid::from_raw(self.pid), sig) {
            Ok(()) => {
                debug!(pid = self.pid, signo, "signal sent");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(pid = self.pid, signo, "signal target already gone");
                Ok(())
            }
            Err(errno) => Err(io::Error::from(errno).into()),
        }
    }

    /// Sends SIGTERM.
    ///
    /// # Errors
    ///
    /// As [`send_signal`](Self::send_signal).
    pub fn terminate(&mut self) -> Result<(), ProcessError> {
        self.send_signal(SignalKind::terminate())
    }

    /// Sends SIGKILL.
    ///
    /// This does not wait for the process to exit. Call `wait()` after
    /// to clean up the zombie process.
    ///
    /// # Errors
    ///
    /// As [`send_signal`](Self::send_signal).
    pub fn kill(&mut self) -> Result<(), ProcessError> {
        self.send_signal(SignalKind::kill())
    }

    /// Closes every pipe end and waits for the child.
    ///
    /// A broken pipe while flushing stdin is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing stdin or waiting fails.
    pub fn finish(&mut self) -> Result<i32, ProcessError> {
        self.stdout = None;
        self.stderr = None;
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(err) = stdin.flush() {
                if err.kind() != io::ErrorKind::BrokenPipe {
                    return Err(err.into());
                }
            }
        }
        self.wait(None)
    }
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Child")
            .field("pid", &self.pid)
            .field("returncode", &self.returncode)
            .field("cmd", &self.cmd)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if self.returncode.is_some() {
            return;
        }
        if self.kill_on_drop {
            let _ = self.kill();
        } else {
            warn!(pid = self.pid, "subprocess {} is still running", self.pid);
        }
        match self.poll() {
            Ok(Some(_)) => {}
            Ok(None) => self.context.adopt(self.pid),
            Err(err) => debug!(pid = self.pid, error = %err, "poll during drop failed"),
        }
    }
}

/// Exit status of a process.
///
/// Contains the exit code or signal information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitStatus {
    /// Splits a return code into exit code or signal.
    #[must_use]
    pub fn from_returncode(returncode: i32) -> Self {
        if returncode < 0 {
            Self {
                code: None,
                signal: Some(-returncode),
            }
        } else {
            Self {
                code: Some(returncode),
                signal: None,
            }
        }
    }

    /// Returns `true` if the process exited successfully.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns the exit code of the process, if available.
    ///
    /// Returns `None` if the process was terminated by a signal.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.code
    }

    /// Returns the signal that terminated the process, if any.
    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// The combined return code: exit code, or negated signal.
    #[must_use]
    pub fn returncode(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => -sig,
            (None, None) => 0,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code: {code}"),
            (None, Some(sig)) => write!(f, "signal: {sig} ({})", signal::describe(sig)),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}
