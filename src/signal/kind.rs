//! Logical signal identifiers.
//!
//! Maps the names callers use (`terminate`, `kill`, ...) onto platform
//! signal numbers.

/// Signals that can be delivered to a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SignalKind {
    /// SIGINT - Interrupt from keyboard (Ctrl+C).
    Interrupt,
    /// SIGTERM - Polite termination request.
    Terminate,
    /// SIGKILL - Forceful stop; cannot be caught.
    Kill,
    /// SIGHUP - Hangup detected on controlling terminal.
    Hangup,
    /// SIGQUIT - Quit from keyboard.
    Quit,
    /// SIGUSR1 - User-defined signal 1.
    User1,
    /// SIGUSR2 - User-defined signal 2.
    User2,
    /// SIGSTOP - Suspend execution; cannot be caught.
    Stop,
    /// SIGCONT - Resume a stopped process.
    Continue,
    /// SIGPIPE - Broken pipe.
    Pipe,
    /// SIGALRM - Timer signal.
    Alarm,
    /// SIGCHLD - Child stopped or terminated.
    Child,
}

impl SignalKind {
    const ALL: [Self; 12] = [
        Self::Interrupt,
        Self::Terminate,
        Self::Kill,
        Self::Hangup,
        Self::Quit,
        Self::User1,
        Self::User2,
        Self::Stop,
        Self::Continue,
        Self::Pipe,
        Self::Alarm,
        Self::Child,
    ];

    /// Creates a `SignalKind` for SIGTERM.
    #[must_use]
    pub const fn terminate() -> Self {
        Self::Terminate
    }

    /// Creates a `SignalKind` for SIGKILL.
    #[must_use]
    pub const fn kill() -> Self {
        Self::Kill
    }

    /// Creates a `SignalKind` for SIGINT.
    #[must_use]
    pub const fn interrupt() -> Self {
        Self::Interrupt
    }

    /// Returns the platform signal number.
    #[must_use]
    pub const fn as_raw_value(&self) -> i32 {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hangup => libc::SIGHUP,
            Self::Quit => libc::SIGQUIT,
            Self::User1 => libc::SIGUSR1,
            Self::User2 => libc::SIGUSR2,
            Self::Stop => libc::SIGSTOP,
            Self::Continue => libc::SIGCONT,
            Self::Pipe => libc::SIGPIPE,
            Self::Alarm => libc::SIGALRM,
            Self::Child => libc::SIGCHLD,
        }
    }

    /// Looks up the logical signal for a platform number.
    #[must_use]
    pub fn from_raw(signo: i32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_raw_value() == signo)
    }

    /// Returns the name of the signal.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
            Self::User1 => "SIGUSR1",
            Self::User2 => "SIGUSR2",
            Self::Stop => "SIGSTOP",
            Self::Continue => "SIGCONT",
            Self::Pipe => "SIGPIPE",
            Self::Alarm => "SIGALRM",
            Self::Child => "SIGCHLD",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl From<SignalKind> for i32 {
    fn from(kind: SignalKind) -> Self {
        kind.as_raw_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn raw_values_match_libc() {
        init_test("raw_values_match_libc");
        let kill = SignalKind::Kill.as_raw_value();
        crate::assert_with_log!(kill == libc::SIGKILL, "kill", libc::SIGKILL, kill);
        let term = SignalKind::terminate().as_raw_value();
        crate::assert_with_log!(term == libc::SIGTERM, "terminate", libc::SIGTERM, term);
        let cont = SignalKind::Continue.as_raw_value();
        crate::assert_with_log!(cont == libc::SIGCONT, "continue", libc::SIGCONT, cont);
        crate::test_complete!("raw_values_match_libc");
    }

    #[test]
    fn from_raw_inverts_as_raw_value() {
        init_test("from_raw_inverts_as_raw_value");
        for kind in SignalKind::ALL {
            let back = SignalKind::from_raw(kind.as_raw_value());
            crate::assert_with_log!(back == Some(kind), "round trip", Some(kind), back);
        }
        let unknown = SignalKind::from_raw(0);
        crate::assert_with_log!(unknown.is_none(), "signal 0", None::<SignalKind>, unknown);
        crate::test_complete!("from_raw_inverts_as_raw_value");
    }

    #[test]
    fn display_uses_name() {
        init_test("display_uses_name");
        let shown = format!("{}", SignalKind::Kill);
        crate::assert_with_log!(shown == "SIGKILL", "display", "SIGKILL", shown);
        crate::test_complete!("display_uses_name");
    }
}
