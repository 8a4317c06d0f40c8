//! Builder for child processes.

use super::child::{Child, ChildParts};
use super::error::ProcessError;
use super::output::DecodeErrors;
use super::stdio::{Buffering, Plumbing, Stdio};
use super::sys::{self, SpawnRequest};
use crate::cmdline;
use crate::config::SpawnBackend;
use crate::context::ProcessContext;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const SHELL: &str = "/bin/sh";

/// A process builder, providing fine-grained control over how a new
/// process should be spawned.
///
/// # Example
///
/// ```ignore
/// use procmux::process::{Command, Stdio};
///
/// let mut child = Command::new("ls")
///     .arg("-la")
///     .stdout(Stdio::piped())
///     .spawn()?;
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    executable: Option<PathBuf>,
    shell: bool,
    env: BTreeMap<OsString, Option<OsString>>,
    env_clear: bool,
    current_dir: Option<PathBuf>,
    stdin: Option<Stdio>,
    stdout: Option<Stdio>,
    stderr: Option<Stdio>,
    close_fds: bool,
    pass_fds: Vec<RawFd>,
    restore_signals: bool,
    start_new_session: bool,
    buffering: Buffering,
    text: bool,
    errors: DecodeErrors,
    kill_on_drop: bool,
    backend: Option<SpawnBackend>,
    context: Option<Arc<ProcessContext>>,
}

impl Command {
    /// Creates a new command for the given program.
    ///
    /// A bare name is looked up on the child's `PATH`; a name containing a
    /// `/` is used as a path.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let cmd = Command::new("ls");
    /// ```
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            executable: None,
            shell: false,
            env: BTreeMap::new(),
            env_clear: false,
            current_dir: None,
            stdin: None,
            stdout: None,
            stderr: None,
            close_fds: true,
            pass_fds: Vec::new(),
            restore_signals: true,
            start_new_session: false,
            buffering: Buffering::Default,
            text: false,
            errors: DecodeErrors::Strict,
            kill_on_drop: false,
            backend: None,
            context: None,
        }
    }

    /// Adds an argument to pass to the program.
    ///
    /// # Example
    ///
    /// ```ignore
    /// Command::new("echo")
    ///     .arg("hello")
    ///     .arg("world");
    /// ```
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Adds multiple arguments to pass to the program.
    ///
    /// # Example
    ///
    /// ```ignore
    /// Command::new("echo")
    ///     .args(["hello", "world"]);
    /// ```
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    /// Runs the program through `/bin/sh -c`.
    ///
    /// The program string becomes the script; extra arguments become the
    /// script's `$0`, `$1`, ...
    ///
    /// # Example
    ///
    /// ```ignore
    /// Command::new("echo $HOME | wc -c")
    ///     .shell(true);
    /// ```
    pub fn shell(&mut self, shell: bool) -> &mut Self {
        self.shell = shell;
        self
    }

    /// Executes `path` instead of looking up `argv[0]`.
    ///
    /// The child still sees the original `argv[0]`; in shell mode this
    /// replaces `/bin/sh`.
    pub fn executable<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.executable = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets an environment variable for the child process.
    ///
    /// # Example
    ///
    /// ```ignore
    /// Command::new("printenv")
    ///     .env("MY_VAR", "my_value");
    /// ```
    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env.insert(
            key.as_ref().to_os_string(),
            Some(val.as_ref().to_os_string()),
        );
        self
    }

    /// Sets multiple environment variables for the child process.
    ///
    /// # Example
    ///
    /// ```ignore
    /// Command::new("env")
    ///     .envs([("VAR1", "val1"), ("VAR2", "val2")]);
    /// ```
    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, val) in vars {
            self.env(key, val);
        }
        self
    }

    /// Removes an environment variable from the child process.
    pub fn env_remove<K: AsRef<OsStr>>(&mut self, key: K) -> &mut Self {
        self.env.insert(key.as_ref().to_os_string(), None);
        self
    }

    /// Clears the entire environment for the child process.
    ///
    /// Variables set before this call are discarded as well; only those set
    /// with `env()` afterwards will be present.
    ///
    /// # Example
    ///
    /// ```ignore
    /// Command::new("env")
    ///     .env_clear()
    ///     .env("PATH", "/usr/bin");
    /// ```
    pub fn env_clear(&mut self) -> &mut Self {
        self.env_clear = true;
        self.env.clear();
        self
    }

    /// Sets the working directory for the child process.
    pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Configures stdin for the child process.
    ///
    /// # Example
    ///
    /// ```ignore
    /// Command::new("cat")
    ///     .stdin(Stdio::piped());
    /// ```
    pub fn stdin(&mut self, cfg: Stdio) -> &mut Self {
        self.stdin = Some(cfg);
        self
    }

    /// Configures stdout for the child process.
    pub fn stdout(&mut self, cfg: Stdio) -> &mut Self {
        self.stdout = Some(cfg);
        self
    }

    /// Configures stderr for the child process.
    ///
    /// # Example
    ///
    /// ```ignore
    /// Command::new("make")
    ///     .stdout(Stdio::piped())
    ///     .stderr(Stdio::merge_stdout());
    /// ```
    pub fn stderr(&mut self, cfg: Stdio) -> &mut Self {
        self.stderr = Some(cfg);
        self
    }

    /// Closes every descriptor above 2 in the child, except `pass_fds`.
    ///
    /// Default: `true`
    pub fn close_fds(&mut self, close: bool) -> &mut Self {
        self.close_fds = close;
        self
    }

    /// Keeps these descriptors open (and inheritable) in the child.
    ///
    /// A non-empty list forces `close_fds`.
    pub fn pass_fds<I: IntoIterator<Item = RawFd>>(&mut self, fds: I) -> &mut Self {
        self.pass_fds.extend(fds);
        self
    }

    /// Puts the child in a new session (`setsid`).
    pub fn start_new_session(&mut self, start: bool) -> &mut Self {
        self.start_new_session = start;
        self
    }

    /// Resets SIGPIPE and SIGXFSZ to their default dispositions in the
    /// child. Rust programs ignore SIGPIPE, and ignored signals survive
    /// exec.
    ///
    /// Default: `true`
    pub fn restore_signals(&mut self, restore: bool) -> &mut Self {
        self.restore_signals = restore;
        self
    }

    /// Buffering of the parent's pipe ends.
    pub fn bufsize(&mut self, buffering: Buffering) -> &mut Self {
        self.buffering = buffering;
        self
    }

    /// Decodes captured output as UTF-8 and normalizes line endings.
    pub fn text(&mut self, text: bool) -> &mut Self {
        self.text = text;
        self
    }

    /// How text mode treats invalid UTF-8. Implies nothing unless
    /// [`text`](Self::text) is set.
    pub fn errors(&mut self, errors: DecodeErrors) -> &mut Self {
        self.errors = errors;
        self
    }

    /// Configures whether to kill the process when the `Child` is dropped.
    ///
    /// Default: `false`
    ///
    /// # Example
    ///
    /// ```ignore
    /// let child = Command::new("sleep")
    ///     .arg("100")
    ///     .kill_on_drop(true)
    ///     .spawn()?;
    ///
    /// // If we drop `child` here, the sleep process will be killed
    /// ```
    pub fn kill_on_drop(&mut self, kill: bool) -> &mut Self {
        self.kill_on_drop = kill;
        self
    }

    /// Overrides the configured spawn backend for this command.
    pub fn backend(&mut self, backend: SpawnBackend) -> &mut Self {
        self.backend = Some(backend);
        self
    }

    /// Uses `context` instead of [`ProcessContext::global`].
    pub fn context(&mut self, context: Arc<ProcessContext>) -> &mut Self {
        self.context = Some(context);
        self
    }

    pub(super) fn stdin_is_set(&self) -> bool {
        self.stdin.is_some()
    }

    pub(super) fn stdout_is_set(&self) -> bool {
        self.stdout.is_some()
    }

    /// Argument vector the child will see.
    fn argv(&self) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 3);
        if self.shell {
            argv.push(OsString::from(SHELL));
            argv.push(OsString::from("-c"));
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Human readable command line, used in error messages.
    pub fn display(&self) -> String {
        if self.shell {
            let mut line = self.program.to_string_lossy().into_owned();
            for arg in &self.args {
                line.push(' ');
                line.push_str(&arg.to_string_lossy());
            }
            return line;
        }
        let words: Vec<String> = std::iter::once(&self.program)
            .chain(&self.args)
            .map(|word| word.to_string_lossy().into_owned())
            .collect();
        cmdline::join_posix(&words)
    }

    /// Final environment, or `None` to inherit the parent's unchanged.
    fn resolved_env(&self) -> Result<Option<Vec<(OsString, OsString)>>, ProcessError> {
        for key in self.env.keys() {
            if key.is_empty() || key.as_bytes().contains(&b'=') {
                return Err(ProcessError::Usage(format!(
                    "illegal environment variable name {key:?}"
                )));
            }
        }
        if !self.env_clear && self.env.is_empty() {
            return Ok(None);
        }
        let mut merged: BTreeMap<OsString, OsString> = if self.env_clear {
            BTreeMap::new()
        } else {
            std::env::vars_os().collect()
        };
        for (key, val) in &self.env {
            match val {
                Some(val) => {
                    merged.insert(key.clone(), val.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(Some(merged.into_iter().collect()))
    }

    /// Spawns the command as a child process.
    ///
    /// Adopted children of the context are swept first. Every descriptor
    /// allocated along the way is closed again if any step fails.
    ///
    /// # Errors
    ///
    /// - [`ProcessError::NotFound`] / [`ProcessError::PermissionDenied`]
    ///   name the executable (or the working directory, if that was the
    ///   missing piece).
    /// - [`ProcessError::Spawn`] for other OS failures, with the errno.
    /// - [`ProcessError::Usage`] for malformed requests, before anything is
    ///   allocated.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut child = Command::new("ls")
    ///     .stdout(Stdio::piped())
    ///     .spawn()?;
    ///
    /// let code = child.wait(None)?;
    /// ```
    pub fn spawn(&mut self) -> Result<Child, ProcessError> {
        let context = self.context.clone().unwrap_or_else(ProcessContext::global);
        let config = &context.config().process;

        let argv = self.argv();
        let executable = match &self.executable {
            Some(path) => path.clone(),
            None => PathBuf::from(&argv[0]),
        };
        let env = self.resolved_env()?;
        let cmd = self.display();

        let mut close_fds = self.close_fds;
        if !self.pass_fds.is_empty() && !close_fds {
            context.warn_once("pass_fds", "pass_fds overriding close_fds.");
            close_fds = true;
        }

        let mut request = SpawnRequest::new(
            &argv,
            &executable,
            env.as_deref(),
            self.current_dir.as_deref(),
            close_fds,
            &self.pass_fds,
            self.restore_signals,
            self.start_new_session,
            config.errpipe_limit,
        )?;

        context.cleanup();
        let plumbing = Plumbing::build(
            self.stdin.clone().unwrap_or_default(),
            self.stdout.clone().unwrap_or_default(),
            self.stderr.clone().unwrap_or_default(),
        )?;
        request.targets = plumbing.targets();

        let backend = self.backend.unwrap_or(config.spawn_backend);
        let pid = sys::spawner(backend).spawn(&request)?;
        debug!(pid, cmd = %cmd, ?backend, "spawned child");

        Ok(Child::new(
            pid,
            ChildParts {
                streams: plumbing.into_parent(),
                buffering: self.buffering,
                args: argv
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect(),
                cmd,
                text: self.text.then_some(self.errors),
                context,
                kill_on_drop: self.kill_on_drop,
            },
        ))
    }
}
