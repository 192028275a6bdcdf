//! Pipe-pair allocation for the three redirected streams.
//!
//! `StdioPipes` holds the 3x2 matrix of raw descriptors. Every slot is
//! independently either open or the `-1` sentinel, and every close resets
//! its slot, so a teardown layer can run over partially populated state
//! without ever double-closing a descriptor.

use crate::channel::ChannelKind;
use crate::sys;
use std::io;
use std::os::unix::io::RawFd;

/// The three pipe pairs backing a spawned child's standard streams.
///
/// Indexed `[channel][end]` with end 0 = read, end 1 = write.
#[derive(Debug)]
pub struct StdioPipes {
    fds: [[RawFd; 2]; 3],
}

impl StdioPipes {
    /// Creates all three OS pipe pairs, or none.
    ///
    /// If the k-th pipe fails, the k-1 pairs already created are closed
    /// before the error is returned.
    pub fn open() -> io::Result<Self> {
        Self::open_with(sys::pipe)
    }

    pub(crate) fn open_with(
        mut make_pipe: impl FnMut() -> io::Result<(RawFd, RawFd)>,
    ) -> io::Result<Self> {
        let mut fds = [[sys::INVALID_FD; 2]; 3];
        for n in 0..3 {
            match make_pipe() {
                Ok((read_end, write_end)) => {
                    fds[n] = [read_end, write_end];
                }
                Err(err) => {
                    for pair in fds.iter_mut().take(n) {
                        sys::close_fd(&mut pair[0]);
                        sys::close_fd(&mut pair[1]);
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { fds })
    }

    /// A matrix with every slot unset. Used for records whose pipes have
    /// already been handed off or torn down.
    pub(crate) fn unset() -> Self {
        Self {
            fds: [[sys::INVALID_FD; 2]; 3],
        }
    }

    /// The descriptor the parent keeps for `kind`.
    #[must_use]
    pub fn parent_fd(&self, kind: ChannelKind) -> RawFd {
        self.fds[kind.index()][kind.parent_end()]
    }

    /// The descriptor the child will receive for `kind`.
    #[must_use]
    pub fn child_fd(&self, kind: ChannelKind) -> RawFd {
        self.fds[kind.index()][kind.child_end()]
    }

    /// Closes the parent-kept end of `kind`. Safe to call repeatedly.
    pub fn close_parent_end(&mut self, kind: ChannelKind) {
        sys::close_fd(&mut self.fds[kind.index()][kind.parent_end()]);
    }

    /// Closes the child-side end of `kind`. Safe to call repeatedly.
    pub fn close_child_end(&mut self, kind: ChannelKind) {
        sys::close_fd(&mut self.fds[kind.index()][kind.child_end()]);
    }

    /// Closes every still-open descriptor in the matrix.
    pub fn close_all(&mut self) {
        for pair in &mut self.fds {
            sys::close_fd(&mut pair[0]);
            sys::close_fd(&mut pair[1]);
        }
    }

    /// Number of slots currently holding an open descriptor.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.fds
            .iter()
            .flatten()
            .filter(|fd| **fd != sys::INVALID_FD)
            .count()
    }

    pub(crate) fn raw(&self) -> &[[RawFd; 2]; 3] {
        &self.fds
    }
}

impl Drop for StdioPipes {
    fn drop(&mut self) {
        self.close_all();
    }
}
