//! Bidirectional exchange with a child over its pipes.
//!
//! The general path multiplexes the (up to three) pipe ends with a
//! [`Selector`]: stdin is fed in chunks of at most `pipe_buf` bytes while
//! stdout and stderr are drained in `read_chunk` pieces, so a child that
//! echoes large input never deadlocks against a full pipe.
//!
//! State survives a timeout. Unwritten input, captured output, and the
//! streams still open stay on the [`Child`], and a later call (typically
//! after [`Child::kill`]) resumes where the previous one stopped.

use super::child::Child;
use super::error::{ProcessError, TimeoutExpired};
use super::output::{Communicated, StreamData, finish_stream};
use super::stdio::{ChildStderr, ChildStdout};
use crate::buf::WriteCursor;
use crate::channel::set_nonblocking;
use crate::selector::{Interest, Selector};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};
use tracing::trace;

const STDIN_KEY: usize = 0;
const STDOUT_KEY: usize = 1;
const STDERR_KEY: usize = 2;

/// Progress of `communicate`, kept across calls.
#[derive(Debug, Default)]
pub(crate) struct Communication {
    started: bool,
    input: Option<WriteCursor>,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
}

impl Communication {
    fn partial(&self) -> (Option<StreamData>, Option<StreamData>) {
        (
            self.stdout.clone().map(StreamData::Bytes),
            self.stderr.clone().map(StreamData::Bytes),
        )
    }
}

/// Broken pipe and `EINVAL` on the child's stdin mean it stopped reading.
fn tolerate_closed_stdin(err: io::Error) -> Result<(), ProcessError> {
    if err.kind() == io::ErrorKind::BrokenPipe || err.raw_os_error() == Some(libc::EINVAL) {
        return Ok(());
    }
    Err(err.into())
}

impl Child {
    /// Sends `input` to the child, reads stdout and stderr to EOF, then
    /// waits for the child to exit.
    ///
    /// Only streams configured as pipes take part; the others come back as
    /// `None`. In text mode the output is decoded and line endings are
    /// normalized.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::Timeout`] when `timeout` elapses. The error
    ///   carries the output captured so far, and the child keeps running.
    ///   Kill it and call `communicate` again to collect the rest.
    /// - [`ProcessError::Usage`] when `input` is given after a previous
    ///   call already started the exchange.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut child = Command::new("cat")
    ///     .stdin(Stdio::piped())
    ///     .stdout(Stdio::piped())
    ///     .spawn()?;
    /// let out = child.communicate(Some(b"ping"), None)?;
    /// assert_eq!(out.stdout.unwrap().as_bytes(), b"ping");
    /// ```
    pub fn communicate(
        &mut self,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<Communicated, ProcessError> {
        let has_input = input.is_some_and(|data| !data.is_empty());
        if self.comm.started && has_input {
            return Err(ProcessError::Usage(
                "cannot send input after starting communication".into(),
            ));
        }

        let piped = [
            self.stdin.is_some(),
            self.stdout.is_some(),
            self.stderr.is_some(),
        ]
        .into_iter()
        .filter(|&open| open)
        .count();

        if timeout.is_none() && !self.comm.started && piped <= 1 {
            let result = self.communicate_single(input);
            self.comm.started = true;
            return result;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let exchanged = self.exchange(input, deadline, timeout);
        self.comm.started = true;
        let restored = self.restore_blocking();
        exchanged?;
        restored?;

        if let Err(err) = self.wait_until(deadline, timeout) {
            return Err(match err {
                ProcessError::Timeout(mut expired) => {
                    (expired.stdout, expired.stderr) = self.comm.partial();
                    ProcessError::Timeout(expired)
                }
                other => other,
            });
        }

        let stdout = self
            .comm
            .stdout
            .take()
            .map(|data| finish_stream(data, self.text))
            .transpose()?;
        let stderr = self
            .comm
            .stderr
            .take()
            .map(|data| finish_stream(data, self.text))
            .transpose()?;
        Ok(Communicated { stdout, stderr })
    }

    /// At most one pipe and no deadline: plain blocking I/O.
    fn communicate_single(&mut self, input: Option<&[u8]>) -> Result<Communicated, ProcessError> {
        let mut out = Communicated::default();
        if let Some(mut stdin) = self.stdin.take() {
            if let Some(data) = input {
                if let Err(err) = stdin.write_all(data).and_then(|()| stdin.flush()) {
                    tolerate_closed_stdin(err)?;
                }
            }
        } else if let Some(mut stdout) = self.stdout.take() {
            let mut data = Vec::new();
            stdout.read_to_end(&mut data)?;
            out.stdout = Some(finish_stream(data, self.text)?);
        } else if let Some(mut stderr) = self.stderr.take() {
            let mut data = Vec::new();
            stderr.read_to_end(&mut data)?;
            out.stderr = Some(finish_stream(data, self.text)?);
        }
        self.wait(None)?;
        Ok(out)
    }

    fn exchange(
        &mut self,
        input: Option<&[u8]>,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<(), ProcessError> {
        if !self.comm.started {
            self.begin(input)?;
        }

        let mut selector = Selector::new()?;
        if let Some(stdin) = &self.stdin {
            if self.comm.input.as_ref().is_some_and(|cursor| !cursor.is_empty()) {
                set_nonblocking(stdin.as_raw_fd(), true)?;
                selector.register(stdin.as_raw_fd(), STDIN_KEY, Interest::WRITABLE)?;
            } else {
                self.stdin = None;
            }
        }
        if let Some(stdout) = &self.stdout {
            set_nonblocking(stdout.as_raw_fd(), true)?;
            selector.register(stdout.as_raw_fd(), STDOUT_KEY, Interest::READABLE)?;
        }
        if let Some(stderr) = &self.stderr {
            set_nonblocking(stderr.as_raw_fd(), true)?;
            selector.register(stderr.as_raw_fd(), STDERR_KEY, Interest::READABLE)?;
        }

        let mut chunk = vec![0u8; self.config.read_chunk];
        while !selector.is_empty() {
            let remaining = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(self.partial_timeout(timeout));
                    }
                    Some(left)
                }
                None => None,
            };

            let ready = selector.select(remaining)?;
            if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                return Err(self.partial_timeout(timeout));
            }

            for (key, _) in ready {
                match key {
                    STDIN_KEY => self.feed_stdin(&mut selector)?,
                    STDOUT_KEY | STDERR_KEY => self.drain(key, &mut selector, &mut chunk)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// First call only: flush what the caller buffered, stash the input,
    /// collect anything already read ahead.
    fn begin(&mut self, input: Option<&[u8]>) -> Result<(), ProcessError> {
        if let Some(stdin) = self.stdin.as_mut() {
            if let Err(err) = stdin.flush() {
                tolerate_closed_stdin(err)?;
            }
            let data = input.unwrap_or_default();
            if data.is_empty() {
                self.stdin = None;
            } else {
                self.comm.input = Some(WriteCursor::from_vec(data.to_vec()));
            }
        }
        self.comm.stdout = self.stdout.as_mut().map(ChildStdout::take_buffered);
        self.comm.stderr = self.stderr.as_mut().map(ChildStderr::take_buffered);
        Ok(())
    }

    fn feed_stdin(&mut self, selector: &mut Selector) -> Result<(), ProcessError> {
        let pid = self.pid();
        let (Some(stdin), Some(cursor)) = (self.stdin.as_ref(), self.comm.input.as_mut()) else {
            return Ok(());
        };
        let fd = stdin.as_raw_fd();
        let pending = cursor.remaining();
        let len = pending.len().min(self.config.pipe_buf);
        let mut file = stdin.get_ref();

        let done = match file.write(&pending[..len]) {
            Ok(written) => {
                cursor.advance(written);
                trace!(pid, written, left = cursor.len(), "stdin chunk");
                cursor.is_empty()
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => false,
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => true,
            Err(err) => return Err(err.into()),
        };
        if done {
            selector.unregister(fd)?;
            self.stdin = None;
        }
        Ok(())
    }

    fn drain(
        &mut self,
        key: usize,
        selector: &mut Selector,
        chunk: &mut [u8],
    ) -> Result<(), ProcessError> {
        let file = if key == STDOUT_KEY {
            self.stdout.as_ref().map(ChildStdout::get_ref)
        } else {
            self.stderr.as_ref().map(ChildStderr::get_ref)
        };
        let Some(mut file) = file else {
            return Ok(());
        };
        let fd = file.as_raw_fd();

        match file.read(chunk) {
            Ok(0) => {
                selector.unregister(fd)?;
                if key == STDOUT_KEY {
                    self.stdout = None;
                } else {
                    self.stderr = None;
                }
            }
            Ok(n) => {
                let sink = if key == STDOUT_KEY {
                    &mut self.comm.stdout
                } else {
                    &mut self.comm.stderr
                };
                sink.get_or_insert_with(Vec::new)
                    .extend_from_slice(&chunk[..n]);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Puts the pipe ends still open back into blocking mode, so direct
    /// reads after an interrupted exchange block instead of failing.
    fn restore_blocking(&self) -> io::Result<()> {
        let open = [
            self.stdin.as_ref().map(AsRawFd::as_raw_fd),
            self.stdout.as_ref().map(AsRawFd::as_raw_fd),
            self.stderr.as_ref().map(AsRawFd::as_raw_fd),
        ];
        for fd in open.into_iter().flatten() {
            set_nonblocking(fd, false)?;
        }
        Ok(())
    }

    fn partial_timeout(&self, timeout: Option<Duration>) -> ProcessError {
        let (stdout, stderr) = self.comm.partial();
        ProcessError::Timeout(TimeoutExpired {
            cmd: self.cmd.clone(),
            timeout: timeout.unwrap_or_default(),
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::context::ProcessContext;
    use crate::process::{Command, DecodeErrors, ProcessError, Stdio};
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn echoes_more_than_a_pipe_buffer() {
        init_test("echoes_more_than_a_pipe_buffer");
        let context = ProcessContext::new();
        let input: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut child = Command::new("cat")
            .stdin(Stdio::Pipe)
            .stdout(Stdio::Pipe)
            .context(Arc::clone(&context))
            .spawn()
            .expect("spawn");
        let out = child
            .communicate(Some(&input), Some(Duration::from_secs(30)))
            .expect("communicate");
        let stdout = out.stdout.expect("stdout piped");
        crate::assert_with_log!(
            stdout.as_bytes() == input.as_slice(),
            "echoed",
            input.len(),
            stdout.len()
        );
        crate::assert_with_log!(out.stderr.is_none(), "stderr not piped", "None", out.stderr);
        crate::assert_with_log!(
            child.returncode() == Some(0),
            "exit",
            Some(0),
            child.returncode()
        );
        crate::test_complete!("echoes_more_than_a_pipe_buffer");
    }

    #[test]
    fn separate_stdout_and_stderr() {
        init_test("separate_stdout_and_stderr");
        let context = ProcessContext::new();
        let mut child = Command::new("sh")
            .args(["-c", "printf out; printf err >&2; exit 3"])
            .stdout(Stdio::Pipe)
            .stderr(Stdio::Pipe)
            .context(Arc::clone(&context))
            .spawn()
            .expect("spawn");
        let out = child.communicate(None, None).expect("communicate");
        let stdout = out.stdout.expect("stdout");
        let stderr = out.stderr.expect("stderr");
        crate::assert_with_log!(stdout.as_bytes() == b"out", "stdout", "out", stdout);
        crate::assert_with_log!(stderr.as_bytes() == b"err", "stderr", "err", stderr);
        crate::assert_with_log!(
            child.returncode() == Some(3),
            "exit",
            Some(3),
            child.returncode()
        );
        crate::test_complete!("separate_stdout_and_stderr");
    }

    #[test]
    fn timeout_keeps_partial_output_and_resumes() {
        init_test("timeout_keeps_partial_output_and_resumes");
        let context = ProcessContext::new();
        let mut child = Command::new("sh")
            .args(["-c", "printf early; exec sleep 10"])
            .stdout(Stdio::Pipe)
            .stderr(Stdio::Pipe)
            .context(Arc::clone(&context))
            .spawn()
            .expect("spawn");

        let started = Instant::now();
        let result = child.communicate(None, Some(Duration::from_millis(500)));
        let Err(ProcessError::Timeout(expired)) = result else {
            panic!("expected timeout, got {result:?}");
        };
        crate::assert_with_log!(
            started.elapsed() < Duration::from_secs(5),
            "returned near deadline",
            "< 5s",
            started.elapsed()
        );
        let partial = expired.stdout.clone().unwrap_or_default();
        crate::assert_with_log!(
            partial.as_bytes() == b"early",
            "partial capture",
            "early",
            partial
        );

        child.kill().expect("kill");
        let rest = child.communicate(None, None).expect("second communicate");
        let stdout = rest.stdout.expect("stdout");
        crate::assert_with_log!(
            stdout.as_bytes() == b"early",
            "output collected after kill",
            "early",
            stdout
        );
        crate::assert_with_log!(
            child.returncode() == Some(-libc::SIGKILL),
            "killed",
            Some(-libc::SIGKILL),
            child.returncode()
        );
        crate::test_complete!("timeout_keeps_partial_output_and_resumes");
    }

    #[test]
    fn pipes_block_again_after_timeout() {
        init_test("pipes_block_again_after_timeout");
        let context = ProcessContext::new();
        let mut child = Command::new("sh")
            .args(["-c", "printf first; sleep 1; printf second"])
            .stdout(Stdio::Pipe)
            .stderr(Stdio::Pipe)
            .context(Arc::clone(&context))
            .spawn()
            .expect("spawn");
        let result = child.communicate(None, Some(Duration::from_millis(200)));
        crate::assert_with_log!(
            matches!(result, Err(ProcessError::Timeout(_))),
            "timed out",
            "Timeout",
            result
        );

        let mut stdout = child.stdout().expect("stdout still open");
        let flags = nix::fcntl::fcntl(stdout.as_raw_fd(), nix::fcntl::FcntlArg::F_GETFL)
            .map(nix::fcntl::OFlag::from_bits_retain)
            .expect("getfl");
        crate::assert_with_log!(
            !flags.contains(nix::fcntl::OFlag::O_NONBLOCK),
            "blocking mode restored",
            "no O_NONBLOCK",
            flags
        );

        let mut rest = Vec::new();
        stdout.read_to_end(&mut rest).expect("blocking read to EOF");
        crate::assert_with_log!(
            rest.ends_with(b"second"),
            "remaining output",
            "ends with second",
            rest
        );
        child.wait(None).expect("wait");
        crate::test_complete!("pipes_block_again_after_timeout");
    }

    #[test]
    fn new_input_after_start_is_rejected() {
        init_test("new_input_after_start_is_rejected");
        let context = ProcessContext::new();
        let mut child = Command::new("cat")
            .stdin(Stdio::Pipe)
            .stdout(Stdio::Pipe)
            .context(Arc::clone(&context))
            .spawn()
            .expect("spawn");
        child.communicate(Some(b"x"), None).expect("first");
        let second = child.communicate(Some(b"y"), None);
        crate::assert_with_log!(
            matches!(second, Err(ProcessError::Usage(_))),
            "usage error",
            "Usage",
            second
        );
        crate::test_complete!("new_input_after_start_is_rejected");
    }

    #[test]
    fn text_mode_decodes_single_pipe() {
        init_test("text_mode_decodes_single_pipe");
        let context = ProcessContext::new();
        let mut child = Command::new("printf")
            .arg("a\\r\\nb\\rc")
            .stdout(Stdio::Pipe)
            .text(true)
            .errors(DecodeErrors::Strict)
            .context(Arc::clone(&context))
            .spawn()
            .expect("spawn");
        let out = child.communicate(None, None).expect("communicate");
        let text = out.stdout.expect("stdout");
        crate::assert_with_log!(
            text.as_text() == Some("a\nb\nc"),
            "normalized text",
            "a\nb\nc",
            text
        );
        crate::test_complete!("text_mode_decodes_single_pipe");
    }
}
