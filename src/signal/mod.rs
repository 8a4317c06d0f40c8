//! Signal identifiers and naming.
//!
//! - [`SignalKind`]: logical signals a child can be sent
//! - [`describe`]: `SIGxxx` name for an arbitrary signal number, used when
//!   formatting negative return codes
//! - [`check_signo`]: rejects signal numbers that cannot be delivered

mod kind;

pub use kind::SignalKind;

use nix::sys::signal::Signal;

/// Returns the conventional name for `signo`, or `"unknown signal N"`.
#[must_use]
pub fn describe(signo: i32) -> String {
    match Signal::try_from(signo) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("unknown signal {signo}"),
    }
}

/// Validates a raw signal number before any OS call is made.
///
/// Negative numbers are a caller mistake; `0` only checks that the process exists and is
/// accepted.
pub fn check_signo(signo: i32) -> Result<(), InvalidSignal> {
    if signo < 0 {
        return Err(InvalidSignal(signo));
    }
    Ok(())
}

/// A signal number that can never be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid signal number {0}")]
pub struct InvalidSignal(pub i32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_known_and_unknown() {
        crate::test_utils::init_test_logging();
        crate::test_phase!("describe_known_and_unknown");
        let term = describe(libc::SIGTERM);
        crate::assert_with_log!(term == "SIGTERM", "known", "SIGTERM", term);
        let odd = describe(1000);
        crate::assert_with_log!(
            odd == "unknown signal 1000",
            "unknown",
            "unknown signal 1000",
            odd
        );
        let neg = check_signo(-9);
        crate::assert_with_log!(neg == Err(InvalidSignal(-9)), "negative", "Err", neg);
        crate::test_complete!("describe_known_and_unknown");
    }
}
