//! Deterministic in-memory dispatcher for tests.
//!
//! `LabDispatcher` models the two resources a real dispatcher can run out
//! of (the connection-handle pool and the descriptor table) and lets tests
//! inject a failure at the N-th allocation, attachment, or poll-direction
//! change. It also counts detach/free calls that named an unknown handle,
//! which is how the leak tests prove the unwind path never double-releases.

use super::{Dispatcher, Interest, Token};
use crate::error::{Result, SpawnError};
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::os::unix::io::RawFd;

/// Which resource the injected failure should mimic running out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabFailure {
    /// The connection-handle pool is exhausted.
    HandlePool,
    /// The descriptor table is full.
    TableFull,
    /// An OS-level error (reported with the given errno).
    Os(i32),
}

#[derive(Debug)]
struct LabHandle {
    fd: RawFd,
    interest: Interest,
    attached: bool,
}

#[derive(Debug, Default)]
struct LabState {
    pool: Slab<LabHandle>,
    pool_limit: usize,
    table_limit: usize,
    alloc_calls: usize,
    attach_calls: usize,
    interest_calls: usize,
    fail_alloc_at: Option<(usize, LabFailure)>,
    fail_attach_at: Option<usize>,
    fail_interest_at: Option<usize>,
    detach_misses: usize,
    free_misses: usize,
}

/// In-memory [`Dispatcher`] with injectable failures.
#[derive(Debug)]
pub struct LabDispatcher {
    state: Mutex<LabState>,
}

impl Default for LabDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LabDispatcher {
    /// Creates a dispatcher with room for 64 handles and 64 table entries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LabState {
                pool_limit: 64,
                table_limit: 64,
                ..LabState::default()
            }),
        }
    }

    /// Caps the connection-handle pool at `limit` handles.
    #[must_use]
    pub fn with_pool_limit(self, limit: usize) -> Self {
        self.state.lock().pool_limit = limit;
        self
    }

    /// Caps the descriptor table at `limit` attached entries.
    #[must_use]
    pub fn with_table_limit(self, limit: usize) -> Self {
        self.state.lock().table_limit = limit;
        self
    }

    /// Makes the `n`-th call to `alloc_handle` (1-based) fail as `failure`.
    pub fn fail_alloc_at(&self, n: usize, failure: LabFailure) {
        self.state.lock().fail_alloc_at = Some((n, failure));
    }

    /// Makes the `n`-th call to `attach` (1-based) fail with an OS error.
    pub fn fail_attach_at(&self, n: usize) {
        self.state.lock().fail_attach_at = Some(n);
    }

    /// Makes the `n`-th call to `set_interest` (1-based) fail.
    pub fn fail_set_interest_at(&self, n: usize) {
        self.state.lock().fail_interest_at = Some(n);
    }

    /// Number of detach calls that named an unknown or unattached handle.
    #[must_use]
    pub fn detach_misses(&self) -> usize {
        self.state.lock().detach_misses
    }

    /// Number of free calls that named an unknown handle.
    #[must_use]
    pub fn free_misses(&self) -> usize {
        self.state.lock().free_misses
    }

    /// Current poll direction of an allocated handle.
    #[must_use]
    pub fn interest_of(&self, token: Token) -> Option<Interest> {
        self.state.lock().pool.get(token.0).map(|h| h.interest)
    }

    /// Descriptor backing an allocated handle.
    #[must_use]
    pub fn fd_of(&self, token: Token) -> Option<RawFd> {
        self.state.lock().pool.get(token.0).map(|h| h.fd)
    }
}

impl LabState {
    fn attached_count(&self) -> usize {
        self.pool.iter().filter(|(_, h)| h.attached).count()
    }
}

impl Dispatcher for LabDispatcher {
    fn alloc_handle(&self, fd: RawFd) -> Result<Token> {
        let mut state = self.state.lock();
        state.alloc_calls += 1;
        if let Some((n, failure)) = state.fail_alloc_at {
            if state.alloc_calls == n {
                return Err(match failure {
                    LabFailure::HandlePool => SpawnError::HandlePoolExhausted,
                    LabFailure::TableFull => SpawnError::DispatcherFull,
                    LabFailure::Os(errno) => {
                        SpawnError::Register(io::Error::from_raw_os_error(errno))
                    }
                });
            }
        }
        if state.pool.len() >= state.pool_limit {
            return Err(SpawnError::HandlePoolExhausted);
        }
        if state.attached_count() >= state.table_limit {
            return Err(SpawnError::DispatcherFull);
        }
        let key = state.pool.insert(LabHandle {
            fd,
            interest: Interest::NONE,
            attached: false,
        });
        Ok(Token(key))
    }

    fn attach(&self, token: Token, interest: Interest) -> Result<()> {
        let mut state = self.state.lock();
        state.attach_calls += 1;
        if state.fail_attach_at == Some(state.attach_calls) {
            return Err(SpawnError::Register(io::Error::from_raw_os_error(
                libc::ENOSPC,
            )));
        }
        if state.attached_count() >= state.table_limit {
            return Err(SpawnError::DispatcherFull);
        }
        match state.pool.get_mut(token.0) {
            Some(handle) => {
                handle.attached = true;
                handle.interest = interest;
                Ok(())
            }
            None => Err(SpawnError::Register(io::Error::new(
                io::ErrorKind::NotFound,
                "unknown handle",
            ))),
        }
    }

    fn set_interest(&self, token: Token, interest: Interest) -> Result<()> {
        let mut state = self.state.lock();
        state.interest_calls += 1;
        if state.fail_interest_at == Some(state.interest_calls) {
            return Err(SpawnError::PollDirection(io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }
        match state.pool.get_mut(token.0) {
            Some(handle) if handle.attached => {
                handle.interest = interest;
                Ok(())
            }
            _ => Err(SpawnError::PollDirection(io::Error::new(
                io::ErrorKind::NotFound,
                "handle not attached",
            ))),
        }
    }

    fn detach(&self, token: Token) -> io::Result<()> {
        let mut state = self.state.lock();
        match state.pool.get_mut(token.0) {
            Some(handle) if handle.attached => {
                handle.attached = false;
                handle.interest = Interest::NONE;
                Ok(())
            }
            _ => {
                state.detach_misses += 1;
                Err(io::Error::new(io::ErrorKind::NotFound, "handle not attached"))
            }
        }
    }

    fn free_handle(&self, token: Token) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.pool.contains(token.0) {
            state.pool.remove(token.0);
            Ok(())
        } else {
            state.free_misses += 1;
            Err(io::Error::new(io::ErrorKind::NotFound, "unknown handle"))
        }
    }

    fn attached(&self) -> usize {
        self.state.lock().attached_count()
    }

    fn allocated(&self) -> usize {
        self.state.lock().pool.len()
    }
}
