//! Dispatcher boundary.
//!
//! The event dispatcher is an external collaborator: this crate hands it the
//! parent-side pipe descriptors and expects readiness callbacks in return.
//! Everything the spawner needs from it is behind the [`Dispatcher`] trait,
//! which keeps the launch and unwind paths testable against the
//! deterministic [`LabDispatcher`] and runnable against the epoll/kqueue
//! backed [`PollDispatcher`].
//!
//! Registration is two-phase, mirroring how handle-based dispatchers work:
//! a connection handle is first allocated from a bounded pool
//! ([`Dispatcher::alloc_handle`]), then inserted into the descriptor table
//! and armed ([`Dispatcher::attach`]). The two phases fail differently and
//! unwind differently, which is exactly why they are kept apart.

mod lab;
mod poll;

pub use lab::{LabDispatcher, LabFailure};
pub use poll::{DispatchEvent, PollDispatcher};

use crate::error::Result;
use std::io;
use std::os::unix::io::RawFd;

/// Identifier for a handle registered with a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

/// Poll direction for a registered descriptor.
///
/// A compact bitflag newtype: combine with `|`, query with
/// [`Interest::is_readable`] / [`Interest::is_writable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(u8);

impl Interest {
    /// No readiness requested.
    pub const NONE: Self = Self(0);
    /// Readable readiness.
    pub const READABLE: Self = Self(0b01);
    /// Writable readiness.
    pub const WRITABLE: Self = Self(0b10);

    /// Returns true if readable readiness is requested.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable readiness is requested.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if `other` is a subset of this interest.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no readiness is requested.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "readable|writable"),
            (true, false) => write!(f, "readable"),
            (false, true) => write!(f, "writable"),
            (false, false) => write!(f, "none"),
        }
    }
}

/// The seam between the spawner and the event dispatcher.
///
/// Implementations must uphold two contracts the unwind path depends on:
/// allocation and attachment are separate failure points, and
/// [`detach`](Self::detach) never touches the descriptor itself, so callers
/// can order "detach, then close" without racing the dispatcher.
pub trait Dispatcher: Send + Sync {
    /// Allocates a connection handle for `fd` from the bounded pool.
    ///
    /// Fails with [`SpawnError::HandlePoolExhausted`] when the pool is
    /// empty and [`SpawnError::DispatcherFull`] when the descriptor table
    /// has no capacity left for another attachment.
    ///
    /// [`SpawnError::HandlePoolExhausted`]: crate::SpawnError::HandlePoolExhausted
    /// [`SpawnError::DispatcherFull`]: crate::SpawnError::DispatcherFull
    fn alloc_handle(&self, fd: RawFd) -> Result<Token>;

    /// Inserts an allocated handle into the descriptor table and arms it.
    fn attach(&self, token: Token, interest: Interest) -> Result<()>;

    /// Changes the poll direction of an attached handle.
    fn set_interest(&self, token: Token, interest: Interest) -> Result<()>;

    /// Removes an attached handle from the descriptor table.
    ///
    /// Must be called strictly before the underlying descriptor is closed.
    fn detach(&self, token: Token) -> io::Result<()>;

    /// Returns an allocated handle to the pool. Detaches first if the
    /// handle is still attached.
    fn free_handle(&self, token: Token) -> io::Result<()>;

    /// Number of handles currently attached to the descriptor table.
    fn attached(&self) -> usize;

    /// Number of handles currently allocated from the pool.
    fn allocated(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn interest_flag_combinations() {
        init_test("interest_flag_combinations");
        let both = Interest::READABLE | Interest::WRITABLE;
        crate::assert_with_log!(both.is_readable(), "readable", true, both.is_readable());
        crate::assert_with_log!(both.is_writable(), "writable", true, both.is_writable());
        crate::assert_with_log!(
            both.contains(Interest::READABLE),
            "contains readable",
            true,
            both.contains(Interest::READABLE)
        );
        crate::assert_with_log!(
            !Interest::READABLE.contains(Interest::WRITABLE),
            "readable lacks writable",
            false,
            Interest::READABLE.contains(Interest::WRITABLE)
        );
        crate::assert_with_log!(
            Interest::NONE.is_none(),
            "none",
            true,
            Interest::NONE.is_none()
        );
        crate::test_complete!("interest_flag_combinations");
    }

    #[test]
    fn interest_display() {
        init_test("interest_display");
        let both = format!("{}", Interest::READABLE | Interest::WRITABLE);
        crate::assert_with_log!(
            both == "readable|writable",
            "both",
            "readable|writable",
            both
        );
        let none = format!("{}", Interest::NONE);
        crate::assert_with_log!(none == "none", "none", "none", none);
        crate::test_complete!("interest_display");
    }

    #[test]
    fn interest_or_assign() {
        init_test("interest_or_assign");
        let mut interest = Interest::NONE;
        interest |= Interest::WRITABLE;
        crate::assert_with_log!(
            interest == Interest::WRITABLE,
            "writable",
            Interest::WRITABLE,
            interest
        );
        crate::test_complete!("interest_or_assign");
    }

    #[test]
    fn token_display() {
        init_test("token_display");
        let token = format!("{}", Token(7));
        crate::assert_with_log!(token == "Token(7)", "token", "Token(7)", token);
        crate::test_complete!("token_display");
    }
}
