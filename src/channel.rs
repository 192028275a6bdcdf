//! Channel model for the three redirected standard streams.
//!
//! The parent and child keep opposite ends of each pipe, and stdin points
//! the other way from stdout/stderr. All of that asymmetry is encoded once
//! here: the pipe-pair slot kept by each side and the initial poll
//! direction both derive from [`ChannelKind`], so the launcher and teardown
//! paths never index a pipe pair by hand.

use crate::dispatch::{Interest, Token};
use crate::sys;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// One of the child's three redirected standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// The child's standard input. The parent writes, the child reads.
    Stdin,
    /// The child's standard output. The parent reads, the child writes.
    Stdout,
    /// The child's standard error. The parent reads, the child writes.
    Stderr,
}

impl ChannelKind {
    /// All channels, in standard fd order.
    pub const ALL: [ChannelKind; 3] = [Self::Stdin, Self::Stdout, Self::Stderr];

    /// The standard fd number for this channel (0, 1 or 2).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    /// Inverse of [`index`](Self::index).
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    /// Pipe-pair slot (0 = read end, 1 = write end) the parent keeps.
    ///
    /// The parent writes into the child's stdin and reads from the other
    /// two.
    #[must_use]
    pub const fn parent_end(self) -> usize {
        match self {
            Self::Stdin => 1,
            Self::Stdout | Self::Stderr => 0,
        }
    }

    /// Pipe-pair slot the child receives on its standard fd.
    #[must_use]
    pub const fn child_end(self) -> usize {
        1 - self.parent_end()
    }

    /// Poll direction the parent-side descriptor is armed with at launch.
    #[must_use]
    pub const fn initial_interest(self) -> Interest {
        match self {
            Self::Stdin => Interest::WRITABLE,
            Self::Stdout | Self::Stderr => Interest::READABLE,
        }
    }

    /// The channel's conventional name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Dispatcher-facing handle for one channel of a spawned child.
///
/// Owns nothing: the descriptor belongs to the spawn record's pipe matrix
/// and the token to the dispatcher. The handle is dropped when the channel
/// is detached.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    kind: ChannelKind,
    fd: RawFd,
    token: Token,
    protocol: Arc<str>,
    parent: Option<Token>,
}

impl ChannelHandle {
    pub(crate) fn new(
        kind: ChannelKind,
        fd: RawFd,
        token: Token,
        protocol: Arc<str>,
        parent: Option<Token>,
    ) -> Self {
        Self {
            kind,
            fd,
            token,
            protocol,
            parent,
        }
    }

    /// Which standard stream this handle serves.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Parent-side raw descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Dispatcher token for this channel.
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Name of the protocol handling this channel's events.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Advisory link to the connection that initiated the spawn.
    #[must_use]
    pub fn parent(&self) -> Option<Token> {
        self.parent
    }

    /// Non-blocking read from the channel (stdout/stderr).
    ///
    /// `Ok(0)` means the child closed its end.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        sys::read_fd(self.fd, buf)
    }

    /// Non-blocking write to the channel (stdin).
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        sys::write_fd(self.fd, buf)
    }
}
