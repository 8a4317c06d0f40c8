//! Process-wide state: the default channel registry, children that were
//! dropped before being reaped, and de-duplicated warnings.
//!
//! [`ProcessContext::global`] is created lazily on first use and lives for
//! the rest of the process. Tests and embedders build isolated contexts
//! with [`ProcessContext::new`] and pass them to
//! [`Command::context`](crate::Command::context) and
//! [`DispatchLoop::from_context`](crate::DispatchLoop::from_context).

use crate::config::{ConfigLoader, MuxConfig};
use crate::dispatch::{Registry, SharedRegistry};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

static GLOBAL: OnceLock<Arc<ProcessContext>> = OnceLock::new();

/// Shared registries with explicit init and teardown.
#[derive(Debug)]
pub struct ProcessContext {
    channels: SharedRegistry,
    active: Mutex<Vec<Pid>>,
    warned: Mutex<HashSet<String>>,
    config: MuxConfig,
}

impl ProcessContext {
    /// Creates an isolated context with default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(MuxConfig::default())
    }

    /// Creates an isolated context.
    #[must_use]
    pub fn with_config(config: MuxConfig) -> Arc<Self> {
        Arc::new(Self {
            channels: Registry::shared(),
            active: Mutex::new(Vec::new()),
            warned: Mutex::new(HashSet::new()),
            config,
        })
    }

    /// The process-wide context.
    ///
    /// Configuration comes from `PROCMUX_*` environment variables; invalid
    /// values fall back to defaults with a warning.
    pub fn global() -> Arc<Self> {
        GLOBAL
            .get_or_init(|| {
                let config = ConfigLoader::new().load().unwrap_or_else(|err| {
                    warn!(error = %err, "invalid procmux configuration, using defaults");
                    MuxConfig::default()
                });
                Self::with_config(config)
            })
            .clone()
    }

    /// Configuration this context was built with.
    #[must_use]
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Handle to the default channel registry.
    #[must_use]
    pub fn channels(&self) -> SharedRegistry {
        Arc::clone(&self.channels)
    }

    /// Takes responsibility for reaping `pid` later.
    pub fn adopt(&self, pid: i32) {
        debug!(pid, "child adopted for deferred reaping");
        self.active.lock().push(Pid::from_raw(pid));
    }

    /// Reaps adopted children that have exited. Returns how many left the
    /// list.
    ///
    /// A child that cannot be waited for at all (already reaped elsewhere,
    /// or not ours) is dropped from the list as well.
    pub fn cleanup(&self) -> usize {
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|&pid| match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                debug!(pid = pid.as_raw(), ?status, "reaped adopted child");
                false
            }
            Err(Errno::EINTR) => true,
            Err(errno) => {
                debug!(pid = pid.as_raw(), %errno, "dropping unwaitable child");
                false
            }
        });
        before - active.len()
    }

    /// Number of adopted children not yet reaped.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Process ids of adopted children not yet reaped.
    #[must_use]
    pub fn active_pids(&self) -> Vec<i32> {
        self.active.lock().iter().map(|pid| pid.as_raw()).collect()
    }

    /// Logs `message` at warn level the first time `key` is seen.
    ///
    /// Returns true if the warning was emitted.
    pub fn warn_once(&self, key: &str, message: &str) -> bool {
        let fresh = self.warned.lock().insert(key.to_string());
        if fresh {
            warn!(key, "{message}");
        }
        fresh
    }

    /// Closes every registered channel (tolerating all errors) and sweeps
    /// adopted children.
    ///
    /// Must not be called from inside a channel callback.
    pub fn teardown(&self) {
        if let Err(err) = self.channels.lock().close_all(true) {
            warn!(error = %err, "close_all failed during teardown");
        }
        let reaped = self.cleanup();
        debug!(reaped, remaining = self.active_count(), "context torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::time::{Duration, Instant};

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn warn_once_deduplicates() {
        init_test("warn_once_deduplicates");
        let cx = ProcessContext::new();
        let first = cx.warn_once("pass_fds", "pass_fds overriding close_fds");
        let second = cx.warn_once("pass_fds", "pass_fds overriding close_fds");
        crate::assert_with_log!(first && !second, "once", (true, false), (first, second));
        crate::test_complete!("warn_once_deduplicates");
    }

    #[test]
    fn cleanup_reaps_adopted_children() {
        init_test("cleanup_reaps_adopted_children");
        let cx = ProcessContext::new();
        let child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = child.id() as i32;
        drop(child);
        cx.adopt(pid);
        crate::assert_with_log!(cx.active_count() == 1, "adopted", 1usize, cx.active_count());

        let deadline = Instant::now() + Duration::from_secs(10);
        while cx.active_count() > 0 && Instant::now() < deadline {
            cx.cleanup();
            std::thread::sleep(Duration::from_millis(10));
        }
        crate::assert_with_log!(cx.active_count() == 0, "reaped", 0usize, cx.active_count());

        // Unknown pids are dropped rather than retried forever.
        cx.adopt(i32::MAX);
        let dropped = cx.cleanup();
        crate::assert_with_log!(dropped == 1, "unwaitable dropped", 1usize, dropped);
        crate::test_complete!("cleanup_reaps_adopted_children");
    }
}
