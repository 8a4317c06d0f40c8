//! Child process control and cooperative socket dispatch.
//!
//! `procmux` provides two components built on the same readiness layer:
//!
//! - [`process`]: spawn a child with per-stream redirection, talk to it with
//!   [`Child::communicate`](process::Child::communicate) (bidirectional,
//!   deadlock-free, deadline aware), reap it exactly once, deliver signals.
//! - [`dispatch`]: a single-threaded loop over a registry of [`Channel`]s,
//!   routing read/write/accept/connect/close events to per-channel
//!   [`Handler`]s while isolating handler failures to the channel that
//!   raised them.
//!
//! Both sit on [`selector`], which offers the three-list `select` style wait
//! and a bitmask registration [`Selector`](selector::Selector).
//!
//! # Example
//!
//! ```ignore
//! use procmux::process::{Command, Stdio};
//! use std::time::Duration;
//!
//! let mut child = Command::new("tr")
//!     .args(["a-z", "A-Z"])
//!     .stdin(Stdio::piped())
//!     .stdout(Stdio::piped())
//!     .spawn()?;
//!
//! let out = child.communicate(Some(b"hello"), Some(Duration::from_secs(5)))?;
//! assert_eq!(out.stdout.unwrap().as_bytes(), b"HELLO");
//! assert_eq!(child.returncode(), Some(0));
//! ```
//!
//! # Process-wide state
//!
//! The default channel registry and the list of not-yet-reaped children
//! live in a [`ProcessContext`]. [`ProcessContext::global`] is used when
//! nothing else is injected; tests build isolated contexts with
//! [`ProcessContext::new`].

#![cfg(unix)]

pub mod buf;
pub mod channel;
pub mod cmdline;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod process;
pub mod selector;
pub mod signal;

#[cfg(test)]
pub(crate) mod test_utils;

pub use channel::{Channel, ChannelCore, ChannelCx, ChannelError, ChannelKind, Handler};
pub use config::{ConfigLoader, MuxConfig};
pub use context::ProcessContext;
pub use dispatch::{DispatchLoop, Registry, SharedRegistry};
pub use error::{ErrorKind, IoErrorKind};
pub use process::{Child, Command, CompletedProcess, ExitStatus, ProcessError, Stdio};
pub use signal::SignalKind;
