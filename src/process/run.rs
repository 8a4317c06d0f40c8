//! One-shot helpers on top of [`Command`] and [`Child`].

use super::command::Command;
use super::error::{CalledProcessError, ProcessError};
use super::output::{DecodeErrors, StreamData};
use super::stdio::Stdio;
use std::time::Duration;
use tracing::debug;

/// A finished child, as returned by [`Command::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedProcess {
    /// Argument vector the child ran with.
    pub args: Vec<String>,
    /// Return code; negative when the child died from a signal.
    pub returncode: i32,
    /// Captured stdout, if it was piped.
    pub stdout: Option<StreamData>,
    /// Captured stderr, if it was piped.
    pub stderr: Option<StreamData>,
    cmd: String,
}

impl CompletedProcess {
    /// Fails with [`ProcessError::Called`] if the return code is non-zero.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn check_returncode(&self) -> Result<(), ProcessError> {
        if self.returncode == 0 {
            return Ok(());
        }
        Err(CalledProcessError {
            returncode: self.returncode,
            cmd: self.cmd.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
        .into())
    }
}

impl Command {
    /// Runs the command to completion, feeding `input` and capturing
    /// whatever streams are piped.
    ///
    /// On timeout the child is killed, its remaining output collected, and
    /// the timeout returned carrying that output. With `check`, a non-zero
    /// return code becomes [`ProcessError::Called`].
    ///
    /// # Errors
    ///
    /// `input` together with an explicit stdin is a usage error. Otherwise
    /// spawn, I/O, timeout, and (with `check`) exit-status errors.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let done = Command::new("tr")
    ///     .args(["a-z", "A-Z"])
    ///     .stdout(Stdio::piped())
    ///     .run(Some(b"shout"), None, true)?;
    /// assert_eq!(done.stdout.unwrap().as_bytes(), b"SHOUT");
    /// ```
    pub fn run(
        &mut self,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
        check: bool,
    ) -> Result<CompletedProcess, ProcessError> {
        let mut cmd = self.clone();
        if input.is_some() {
            if self.stdin_is_set() {
                return Err(ProcessError::Usage(
                    "stdin and input arguments may not both be used".into(),
                ));
            }
            cmd.stdin(Stdio::Pipe);
        }

        let mut child = cmd.spawn()?;
        let output = match child.communicate(input, timeout) {
            Ok(output) => output,
            Err(ProcessError::Timeout(mut expired)) => {
                debug!(pid = child.pid(), "run timed out, killing child");
                child.kill()?;
                let rest = child.communicate(None, None)?;
                expired.stdout = rest.stdout;
                expired.stderr = rest.stderr;
                return Err(ProcessError::Timeout(expired));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait(None);
                return Err(err);
            }
        };
        let returncode = child.finish()?;

        let completed = CompletedProcess {
            args: child.args().to_vec(),
            returncode,
            stdout: output.stdout,
            stderr: output.stderr,
            cmd: cmd.display(),
        };
        if check {
            completed.check_returncode()?;
        }
        Ok(completed)
    }

    /// Runs the command and returns its return code.
    ///
    /// If waiting fails (including on timeout) the child is killed and
    /// reaped before the error is returned.
    ///
    /// # Errors
    ///
    /// Spawn and wait errors.
    pub fn call(&mut self, timeout: Option<Duration>) -> Result<i32, ProcessError> {
        let mut child = self.spawn()?;
        match child.wait(timeout) {
            Ok(code) => {
                child.finish()?;
                Ok(code)
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait(None);
                Err(err)
            }
        }
    }

    /// Like [`call`](Self::call), but a non-zero return code is an error.
    ///
    /// # Errors
    ///
    /// [`ProcessError::Called`] for a non-zero code, otherwise as `call`.
    pub fn check_call(&mut self, timeout: Option<Duration>) -> Result<(), ProcessError> {
        let returncode = self.call(timeout)?;
        if returncode != 0 {
            return Err(CalledProcessError {
                returncode,
                cmd: self.display(),
                stdout: None,
                stderr: None,
            }
            .into());
        }
        Ok(())
    }

    /// Runs the command with stdout piped and returns what it printed.
    ///
    /// # Errors
    ///
    /// An explicitly configured stdout is a usage error. A non-zero return
    /// code is [`ProcessError::Called`] carrying the output.
    pub fn check_output(
        &mut self,
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<StreamData, ProcessError> {
        if self.stdout_is_set() {
            return Err(ProcessError::Usage(
                "stdout argument not allowed, it will be overridden".into(),
            ));
        }
        let mut cmd = self.clone();
        cmd.stdout(Stdio::Pipe);
        let completed = cmd.run(input, timeout, true)?;
        Ok(completed.stdout.unwrap_or_default())
    }
}

/// Runs `cmd` through the shell and returns `(returncode, output)`.
///
/// stdout and stderr are merged and decoded as text (invalid UTF-8 is
/// replaced); one trailing newline is removed.
///
/// # Errors
///
/// Spawn and I/O errors. A non-zero exit is not an error here.
///
/// # Example
///
/// ```ignore
/// let (code, out) = getstatusoutput("ls /nonexistent")?;
/// assert_ne!(code, 0);
/// ```
pub fn getstatusoutput(cmd: &str) -> Result<(i32, String), ProcessError> {
    let result = Command::new(cmd)
        .shell(true)
        .text(true)
        .errors(DecodeErrors::Replace)
        .stderr(Stdio::MergeStdout)
        .check_output(None, None);
    let (status, data) = match result {
        Ok(data) => (0, data),
        Err(ProcessError::Called(err)) => (err.returncode, err.stdout.unwrap_or_default()),
        Err(err) => return Err(err),
    };
    let mut text = data.into_string_lossy();
    if text.ends_with('\n') {
        text.pop();
    }
    Ok((status, text))
}

/// Output of `cmd` run through the shell, as [`getstatusoutput`] returns it.
///
/// # Errors
///
/// As [`getstatusoutput`].
pub fn getoutput(cmd: &str) -> Result<String, ProcessError> {
    getstatusoutput(cmd).map(|(_, output)| output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessContext;
    use std::sync::Arc;
    use std::time::Instant;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn run_with_input_and_check() {
        init_test("run_with_input_and_check");
        let context = ProcessContext::new();
        let done = Command::new("tr")
            .args(["a-z", "A-Z"])
            .stdout(Stdio::Pipe)
            .context(Arc::clone(&context))
            .run(Some(b"shout"), Some(Duration::from_secs(10)), true)
            .expect("run");
        let stdout = done.stdout.clone().expect("stdout");
        crate::assert_with_log!(stdout.as_bytes() == b"SHOUT", "upper", "SHOUT", stdout);
        crate::assert_with_log!(done.returncode == 0, "code", 0, done.returncode);
        crate::assert_with_log!(
            done.args == vec!["tr".to_string(), "a-z".into(), "A-Z".into()],
            "args",
            "[tr, a-z, A-Z]",
            done.args
        );
        crate::test_complete!("run_with_input_and_check");
    }

    #[test]
    fn run_rejects_input_with_explicit_stdin() {
        init_test("run_rejects_input_with_explicit_stdin");
        let result = Command::new("cat")
            .stdin(Stdio::Null)
            .context(ProcessContext::new())
            .run(Some(b"x"), None, false);
        crate::assert_with_log!(
            matches!(result, Err(ProcessError::Usage(_))),
            "usage",
            "Usage",
            result
        );
        crate::test_complete!("run_rejects_input_with_explicit_stdin");
    }

    #[test]
    fn run_timeout_kills_and_collects() {
        init_test("run_timeout_kills_and_collects");
        let started = Instant::now();
        let result = Command::new("printf start; exec sleep 10")
            .shell(true)
            .stdout(Stdio::Pipe)
            .context(ProcessContext::new())
            .run(None, Some(Duration::from_millis(300)), false);
        let Err(ProcessError::Timeout(expired)) = result else {
            panic!("expected timeout, got {result:?}");
        };
        crate::assert_with_log!(
            started.elapsed() < Duration::from_secs(5),
            "killed promptly",
            "< 5s",
            started.elapsed()
        );
        let stdout = expired.stdout.clone().unwrap_or_default();
        crate::assert_with_log!(stdout.as_bytes() == b"start", "collected", "start", stdout);
        crate::test_complete!("run_timeout_kills_and_collects");
    }

    #[test]
    fn check_call_and_check_output() {
        init_test("check_call_and_check_output");
        let context = ProcessContext::new();
        let failed = Command::new("exit 4")
            .shell(true)
            .context(Arc::clone(&context))
            .check_call(None);
        let Err(ProcessError::Called(err)) = failed else {
            panic!("expected CalledProcessError, got {failed:?}");
        };
        crate::assert_with_log!(err.returncode == 4, "code", 4, err.returncode);
        crate::assert_with_log!(
            err.to_string() == "Command 'exit 4' returned non-zero exit status 4.",
            "message",
            "Command 'exit 4' returned non-zero exit status 4.",
            err.to_string()
        );

        let code = Command::new("true")
            .context(Arc::clone(&context))
            .call(Some(Duration::from_secs(10)))
            .expect("call");
        crate::assert_with_log!(code == 0, "call code", 0, code);

        let out = Command::new("echo")
            .arg("hi")
            .context(Arc::clone(&context))
            .check_output(None, None)
            .expect("check_output");
        crate::assert_with_log!(out.as_bytes() == b"hi\n", "output", "hi\n", out);

        let rejected = Command::new("echo")
            .stdout(Stdio::Null)
            .context(Arc::clone(&context))
            .check_output(None, None);
        crate::assert_with_log!(
            matches!(rejected, Err(ProcessError::Usage(_))),
            "explicit stdout rejected",
            "Usage",
            rejected
        );
        crate::test_complete!("check_call_and_check_output");
    }

    #[test]
    fn getstatusoutput_merges_and_strips() {
        init_test("getstatusoutput_merges_and_strips");
        let (status, output) =
            getstatusoutput("echo out; echo err 1>&2; exit 3").expect("getstatusoutput");
        crate::assert_with_log!(status == 3, "status", 3, status);
        crate::assert_with_log!(output == "out\nerr", "merged", "out\nerr", output);

        let plain = getoutput("printf 'a\\n\\n'").expect("getoutput");
        crate::assert_with_log!(plain == "a\n", "one newline stripped", "a\n", plain);
        crate::test_complete!("getstatusoutput_merges_and_strips");
    }
}
