//! Tuning knobs for the dispatch loop and the process controller.
//!
//! This module provides:
//! - [`MuxConfig`] with sensible defaults
//! - Profiles ([`ConfigProfile`]) for common deployments
//! - Validation of guardrail invariants
//! - Layered loading (profile + env + overrides) through [`ConfigLoader`]
//!
//! Environment keys all start with `PROCMUX_`.

use crate::error::ErrorKind;
use std::collections::BTreeMap;
use std::time::Duration;

/// Platform pipe buffer size used to bound single writes to a child's stdin.
#[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple"))]
pub const DEFAULT_PIPE_BUF: usize = libc::PIPE_BUF;

/// Platform pipe buffer size used to bound single writes to a child's stdin.
#[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
pub const DEFAULT_PIPE_BUF: usize = 512;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxConfig {
    /// Dispatch-loop settings.
    pub dispatch: DispatchConfig,
    /// Process controller settings.
    pub process: ProcessConfig,
}

impl MuxConfig {
    /// Validates the configuration for basic sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.send_chunk == 0 {
            return Err(ConfigError::ZeroSize("dispatch.send_chunk"));
        }
        if self.dispatch.recv_size == 0 {
            return Err(ConfigError::ZeroSize("dispatch.recv_size"));
        }
        if self.process.pipe_buf == 0 {
            return Err(ConfigError::ZeroSize("process.pipe_buf"));
        }
        if self.process.read_chunk == 0 {
            return Err(ConfigError::ZeroSize("process.read_chunk"));
        }
        if self.process.errpipe_limit == 0 {
            return Err(ConfigError::ZeroSize("process.errpipe_limit"));
        }
        self.process.wait_backoff.validate()
    }
}

/// Which readiness primitive the dispatch loop uses by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectorBackend {
    /// Three parallel descriptor lists per iteration (`select` style).
    #[default]
    Select,
    /// Persistent bitmask registration (`poll` style).
    Poll,
}

/// How children are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnBackend {
    /// Direct `fork` + `execve` with an error pipe.
    #[default]
    ForkExec,
    /// `std::process::Command` with a pre-exec hook.
    Std,
}

/// Dispatch-loop configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Per-iteration readiness timeout used by [`DispatchLoop::run`](crate::DispatchLoop::run).
    pub timeout: Duration,
    /// Readiness primitive.
    pub selector: SelectorBackend,
    /// Largest slice a buffered channel hands to a single send.
    pub send_chunk: usize,
    /// Default read size for handlers that do not choose one.
    pub recv_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            selector: SelectorBackend::Select,
            send_chunk: 65_536,
            recv_size: 8_192,
        }
    }
}

/// Exponential backoff used by timed `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first doubling.
    pub initial: Duration,
    /// Upper bound on a single sleep.
    pub max: Duration,
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max.is_zero() {
            return Err(ConfigError::ZeroSize("process.wait_backoff.max"));
        }
        if self.initial > self.max {
            return Err(ConfigError::InvalidBackoff {
                initial: self.initial,
                max: self.max,
            });
        }
        Ok(())
    }

    /// Next sleep interval: double the previous one, bounded by `max` and
    /// by what is left of the deadline.
    #[must_use]
    pub fn next_delay(&self, previous: Duration, remaining: Duration) -> Duration {
        previous.saturating_mul(2).min(self.max).min(remaining)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_micros(500),
            max: Duration::from_millis(50),
        }
    }
}

/// Process controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Largest single write to a child's stdin during `communicate`.
    pub pipe_buf: usize,
    /// Read size for draining stdout/stderr during `communicate`.
    pub read_chunk: usize,
    /// Polling schedule for timed `wait`.
    pub wait_backoff: BackoffConfig,
    /// Child creation backend.
    pub spawn_backend: SpawnBackend,
    /// Maximum bytes read from the exec error pipe.
    pub errpipe_limit: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            pipe_buf: DEFAULT_PIPE_BUF,
            read_chunk: 32_768,
            wait_backoff: BackoffConfig::default(),
            spawn_backend: SpawnBackend::ForkExec,
            errpipe_limit: 50_000,
        }
    }
}

/// Preset configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigProfile {
    /// Library defaults.
    #[default]
    Default,
    /// Short loop timeouts for tests.
    Testing,
}

impl ConfigProfile {
    /// Builds the configuration for this profile.
    #[must_use]
    pub fn to_config(self) -> MuxConfig {
        match self {
            Self::Default => MuxConfig::default(),
            Self::Testing => MuxConfig {
                dispatch: DispatchConfig {
                    timeout: Duration::from_millis(50),
                    ..DispatchConfig::default()
                },
                process: ProcessConfig::default(),
            },
        }
    }
}

/// Configuration loader with layered sources.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    profile: ConfigProfile,
    use_env: bool,
    overrides: BTreeMap<String, String>,
}

impl ConfigLoader {
    /// Creates a loader using the default profile and the environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            profile: ConfigProfile::Default,
            use_env: true,
            overrides: BTreeMap::new(),
        }
    }

    /// Sets the base profile.
    #[must_use]
    pub fn profile(mut self, profile: ConfigProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Skips `PROCMUX_*` environment variables.
    #[must_use]
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Adds a programmatic override (highest precedence).
    #[must_use]
    pub fn override_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Loads configuration with precedence:
    /// 1. Profile defaults (lowest)
    /// 2. Environment variables
    /// 3. Programmatic overrides (highest)
    pub fn load(&self) -> Result<MuxConfig, ConfigError> {
        let mut config = self.profile.to_config();
        if self.use_env {
            let env: BTreeMap<String, String> = std::env::vars()
                .filter(|(key, _)| key.starts_with("PROCMUX_"))
                .collect();
            apply_overrides(&mut config, &env)?;
        }
        apply_overrides(&mut config, &self.overrides)?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    Parse {
        /// Offending key.
        key: String,
        /// Offending value.
        value: String,
    },
    /// Unknown override key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// A size or duration that must be positive was zero.
    #[error("{0} must be > 0")]
    ZeroSize(&'static str),
    /// Backoff start exceeds its cap.
    #[error("wait backoff initial {initial:?} exceeds max {max:?}")]
    InvalidBackoff {
        /// Initial delay.
        initial: Duration,
        /// Cap.
        max: Duration,
    },
}

impl ConfigError {
    /// Shared classification; always [`ErrorKind::ConfigError`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigError
    }
}

fn apply_overrides(
    config: &mut MuxConfig,
    overrides: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    for (key, value) in overrides {
        apply_override(config, key, value)?;
    }
    Ok(())
}

fn apply_override(config: &mut MuxConfig, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "PROCMUX_DISPATCH_TIMEOUT_MS" => {
            config.dispatch.timeout = Duration::from_millis(parse_u64(value, key)?);
        }
        "PROCMUX_DISPATCH_SELECTOR" => {
            config.dispatch.selector = match value.to_ascii_lowercase().as_str() {
                "select" => SelectorBackend::Select,
                "poll" => SelectorBackend::Poll,
                _ => return Err(parse_error(key, value)),
            };
        }
        "PROCMUX_DISPATCH_SEND_CHUNK" => config.dispatch.send_chunk = parse_usize(value, key)?,
        "PROCMUX_DISPATCH_RECV_SIZE" => config.dispatch.recv_size = parse_usize(value, key)?,
        "PROCMUX_PIPE_BUF" => config.process.pipe_buf = parse_usize(value, key)?,
        "PROCMUX_READ_CHUNK" => config.process.read_chunk = parse_usize(value, key)?,
        "PROCMUX_WAIT_BACKOFF_INITIAL_US" => {
            config.process.wait_backoff.initial = Duration::from_micros(parse_u64(value, key)?);
        }
        "PROCMUX_WAIT_BACKOFF_MAX_MS" => {
            config.process.wait_backoff.max = Duration::from_millis(parse_u64(value, key)?);
        }
        "PROCMUX_SPAWN_BACKEND" => {
            config.process.spawn_backend = match value.to_ascii_lowercase().as_str() {
                "fork-exec" | "fork_exec" | "forkexec" => SpawnBackend::ForkExec,
                "std" => SpawnBackend::Std,
                _ => return Err(parse_error(key, value)),
            };
        }
        "PROCMUX_ERRPIPE_LIMIT" => config.process.errpipe_limit = parse_usize(value, key)?,
        _ => return Err(ConfigError::UnknownKey(key.to_string())),
    }
    Ok(())
}

fn parse_error(key: &str, value: &str) -> ConfigError {
    ConfigError::Parse {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_u64(value: &str, key: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| parse_error(key, value))
}

fn parse_usize(value: &str, key: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| parse_error(key, value))
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
    fn defaults_validate() {
        init_test("defaults_validate");
        let config = MuxConfig::default();
        crate::assert_with_log!(
            config.validate().is_ok(),
            "defaults valid",
            true,
            config.validate().is_ok()
        );
        crate::assert_with_log!(
            config.process.wait_backoff.max == Duration::from_millis(50),
            "backoff cap",
            Duration::from_millis(50),
            config.process.wait_backoff.max
        );
        crate::test_complete!("defaults_validate");
    }

    #[test]
    fn overrides_apply_over_profile() {
        init_test("overrides_apply_over_profile");
        let config = ConfigLoader::new()
            .without_env()
            .profile(ConfigProfile::Testing)
            .override_value("PROCMUX_DISPATCH_SELECTOR", "poll")
            .override_value("PROCMUX_READ_CHUNK", "1024")
            .override_value("PROCMUX_SPAWN_BACKEND", "std")
            .load()
            .expect("load");
        crate::assert_with_log!(
            config.dispatch.selector == SelectorBackend::Poll,
            "selector",
            SelectorBackend::Poll,
            config.dispatch.selector
        );
        crate::assert_with_log!(
            config.dispatch.timeout == Duration::from_millis(50),
            "testing profile timeout",
            Duration::from_millis(50),
            config.dispatch.timeout
        );
        crate::assert_with_log!(
            config.process.read_chunk == 1024,
            "read chunk",
            1024usize,
            config.process.read_chunk
        );
        crate::assert_with_log!(
            config.process.spawn_backend == SpawnBackend::Std,
            "spawn backend",
            SpawnBackend::Std,
            config.process.spawn_backend
        );
        crate::test_complete!("overrides_apply_over_profile");
    }

    #[test]
    fn invalid_values_rejected() {
        init_test("invalid_values_rejected");
        let zero = ConfigLoader::new()
            .without_env()
            .override_value("PROCMUX_PIPE_BUF", "0")
            .load();
        crate::assert_with_log!(
            matches!(zero, Err(ConfigError::ZeroSize("process.pipe_buf"))),
            "zero pipe buf",
            "ZeroSize",
            format!("{zero:?}")
        );

        let unknown = ConfigLoader::new()
            .without_env()
            .override_value("PROCMUX_NOPE", "1")
            .load();
        crate::assert_with_log!(
            matches!(unknown, Err(ConfigError::UnknownKey(_))),
            "unknown key",
            "UnknownKey",
            format!("{unknown:?}")
        );
        let kind = unknown.map(|_| ()).map_err(|err| err.kind());
        crate::assert_with_log!(
            kind == Err(ErrorKind::ConfigError),
            "config error kind",
            ErrorKind::ConfigError,
            kind
        );

        let backoff = ConfigLoader::new()
            .without_env()
            .override_value("PROCMUX_WAIT_BACKOFF_INITIAL_US", "900000")
            .override_value("PROCMUX_WAIT_BACKOFF_MAX_MS", "10")
            .load();
        crate::assert_with_log!(
            matches!(backoff, Err(ConfigError::InvalidBackoff { .. })),
            "backoff order",
            "InvalidBackoff",
            format!("{backoff:?}")
        );
        crate::test_complete!("invalid_values_rejected");
    }

    #[test]
    fn backoff_is_bounded() {
        init_test("backoff_is_bounded");
        let backoff = BackoffConfig::default();
        let mut delay = backoff.initial;
        for _ in 0..20 {
            delay = backoff.next_delay(delay, Duration::from_secs(10));
        }
        crate::assert_with_log!(delay == backoff.max, "capped", backoff.max, delay);
        let short = backoff.next_delay(delay, Duration::from_millis(3));
        crate::assert_with_log!(
            short == Duration::from_millis(3),
            "bounded by remaining",
            Duration::from_millis(3),
            short
        );
        crate::test_complete!("backoff_is_bounded");
    }
}
