//! Child process management.
//!
//! [`Command`] describes a child (program, arguments, environment, working
//! directory, per-stream redirection) and spawns it into a [`Child`]. The
//! child handle owns the parent's pipe ends, reaps the process exactly once,
//! and offers [`Child::communicate`] for deadlock-free, deadline-aware
//! exchange with all three streams.
//!
//! # Example
//!
//! ```ignore
//! use procmux::process::{Command, Stdio};
//! use std::time::Duration;
//!
//! let mut child = Command::new("sort")
//!     .stdin(Stdio::piped())
//!     .stdout(Stdio::piped())
//!     .spawn()?;
//! let out = child.communicate(Some(b"b\na\n"), Some(Duration::from_secs(5)))?;
//! assert_eq!(out.stdout.unwrap().as_bytes(), b"a\nb\n");
//! ```
//!
//! # Return codes
//!
//! A normal exit yields the exit status; death by signal `N` yields `-N`.
//! [`ExitStatus`] splits the two back apart.
//!
//! # Descriptor hygiene
//!
//! Every pipe and duplicate created for a spawn is owned until the child
//! is running, so a failure at any step closes all of them. Child-side ends
//! are closed in the parent right after the spawn. With `close_fds` (the
//! default) the child sees only fds 0-2 and the `pass_fds` list.
//!
//! # Unreaped children
//!
//! A [`Child`] dropped before its return code is known is handed to its
//! [`ProcessContext`](crate::ProcessContext), which reaps it on the next
//! [`cleanup`](crate::ProcessContext::cleanup); every spawn runs one first.

mod child;
mod command;
mod communicate;
mod error;
mod output;
mod run;
mod stdio;
mod sys;

pub use child::{Child, ExitStatus};
pub use command::Command;
pub use error::{CalledProcessError, ProcessError, TimeoutExpired};
pub use output::{Communicated, DecodeErrors, StreamData};
pub use run::{CompletedProcess, getoutput, getstatusoutput};
pub use stdio::{Buffering, ChildStderr, ChildStdin, ChildStdout, Stdio};
