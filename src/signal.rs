//! Signal kinds used by the child terminator.
//!
//! Only the three signals the escalation chain sends are represented.

/// Unix signal kinds sent during child termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// SIGTERM - polite termination request.
    Terminate,
    /// SIGPIPE - fallback for targets that block or ignore SIGTERM.
    Pipe,
    /// SIGKILL - last resort, cannot be caught.
    Kill,
}

impl SignalKind {
    /// Creates a `SignalKind` for SIGTERM.
    #[must_use]
    pub const fn terminate() -> Self {
        Self::Terminate
    }

    /// Creates a `SignalKind` for SIGPIPE.
    #[must_use]
    pub const fn pipe() -> Self {
        Self::Pipe
    }

    /// Creates a `SignalKind` for SIGKILL.
    #[must_use]
    pub const fn kill() -> Self {
        Self::Kill
    }

    /// Returns the platform signal number.
    #[must_use]
    pub const fn as_raw_value(&self) -> i32 {
        match self {
            Self::Terminate => libc::SIGTERM,
            Self::Pipe => libc::SIGPIPE,
            Self::Kill => libc::SIGKILL,
        }
    }

    /// Returns the name of the signal.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Pipe => "SIGPIPE",
            Self::Kill => "SIGKILL",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
