#![allow(unsafe_code)]
//! epoll/kqueue-backed dispatcher.
//!
//! A thin descriptor table over the `polling` crate so live children can be
//! driven through a genuine event loop. Sources are registered in oneshot
//! mode (the `polling` default): after an event fires, the caller re-arms
//! the handle with [`Dispatcher::set_interest`].
//!
//! The `unsafe` here is confined to `Poller::add`, which takes a raw fd the
//! caller must keep open until deletion; the slab entry owns that contract.

use super::{Dispatcher, Interest, Token};
use crate::error::{Result, SpawnError};
use parking_lot::Mutex;
use polling::{Event, Events, Poller};
use slab::Slab;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// One readiness event delivered by [`PollDispatcher::wait`].
#[derive(Debug, Clone, Copy)]
pub struct DispatchEvent {
    /// Handle the event belongs to.
    pub token: Token,
    /// Readable readiness.
    pub readable: bool,
    /// Writable readiness.
    pub writable: bool,
}

#[derive(Debug)]
struct PollHandle {
    fd: RawFd,
    attached: bool,
}

struct PollState {
    handles: Slab<PollHandle>,
    capacity: usize,
}

/// [`Dispatcher`] backed by the OS poller.
pub struct PollDispatcher {
    poller: Poller,
    state: Mutex<PollState>,
}

fn to_event(key: usize, interest: Interest) -> Event {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => Event::all(key),
        (true, false) => Event::readable(key),
        (false, true) => Event::writable(key),
        (false, false) => Event::none(key),
    }
}

impl PollDispatcher {
    /// Creates a dispatcher with the default table capacity (1024 entries).
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(1024)
    }

    /// Creates a dispatcher whose table holds at most `capacity` handles.
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            state: Mutex::new(PollState {
                handles: Slab::new(),
                capacity,
            }),
        })
    }

    /// Blocks until readiness or `timeout`, appending events to `out`.
    ///
    /// Returns the number of events delivered in this call.
    pub fn wait(
        &self,
        out: &mut Vec<DispatchEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut events = Events::new();
        self.poller.wait(&mut events, timeout)?;
        let mut delivered = 0;
        for event in events.iter() {
            out.push(DispatchEvent {
                token: Token(event.key),
                readable: event.readable,
                writable: event.writable,
            });
            delivered += 1;
        }
        Ok(delivered)
    }
}

impl Dispatcher for PollDispatcher {
    fn alloc_handle(&self, fd: RawFd) -> Result<Token> {
        let mut state = self.state.lock();
        if state.handles.len() >= state.capacity {
            return Err(SpawnError::DispatcherFull);
        }
        let key = state.handles.insert(PollHandle { fd, attached: false });
        Ok(Token(key))
    }

    fn attach(&self, token: Token, interest: Interest) -> Result<()> {
        let mut state = self.state.lock();
        let handle = state.handles.get_mut(token.0).ok_or_else(|| {
            SpawnError::Register(io::Error::new(io::ErrorKind::NotFound, "unknown handle"))
        })?;
        // Caller guarantees the fd outlives the attachment.
        unsafe {
            self.poller
                .add(handle.fd, to_event(token.0, interest))
                .map_err(SpawnError::Register)?;
        }
        handle.attached = true;
        Ok(())
    }

    fn set_interest(&self, token: Token, interest: Interest) -> Result<()> {
        let state = self.state.lock();
        let handle = state.handles.get(token.0).filter(|h| h.attached).ok_or_else(|| {
            SpawnError::PollDirection(io::Error::new(
                io::ErrorKind::NotFound,
                "handle not attached",
            ))
        })?;
        let fd = unsafe { BorrowedFd::borrow_raw(handle.fd) };
        self.poller
            .modify(fd, to_event(token.0, interest))
            .map_err(SpawnError::PollDirection)
    }

    fn detach(&self, token: Token) -> io::Result<()> {
        let mut state = self.state.lock();
        let handle = state
            .handles
            .get_mut(token.0)
            .filter(|h| h.attached)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "handle not attached"))?;
        let fd = unsafe { BorrowedFd::borrow_raw(handle.fd) };
        self.poller.delete(fd)?;
        handle.attached = false;
        Ok(())
    }

    fn free_handle(&self, token: Token) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.handles.contains(token.0) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown handle"));
        }
        let handle = state.handles.remove(token.0);
        if handle.attached {
            let fd = unsafe { BorrowedFd::borrow_raw(handle.fd) };
            let _ = self.poller.delete(fd);
        }
        Ok(())
    }

    fn attached(&self) -> usize {
        self.state.lock().handles.iter().filter(|(_, h)| h.attached).count()
    }

    fn allocated(&self) -> usize {
        self.state.lock().handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn readable_event_after_write() {
        init_test("readable_event_after_write");
        let _fd_guard = crate::test_utils::fd_serial();
        let dispatcher = PollDispatcher::new().expect("poller");
        let (mut r, mut w) = sys::pipe().expect("pipe");
        sys::set_nonblocking(r).expect("nonblock");

        let token = dispatcher.alloc_handle(r).expect("alloc");
        dispatcher.attach(token, Interest::READABLE).expect("attach");

        sys::write_fd(w, b"x").expect("write");
        let mut events = Vec::new();
        let n = dispatcher
            .wait(&mut events, Some(Duration::from_secs(2)))
            .expect("wait");
        crate::assert_with_log!(n == 1, "one event", 1usize, n);
        crate::assert_with_log!(
            events[0].token == token,
            "token",
            token,
            events[0].token
        );
        crate::assert_with_log!(events[0].readable, "readable", true, events[0].readable);

        dispatcher.detach(token).expect("detach");
        dispatcher.free_handle(token).expect("free");
        crate::assert_with_log!(
            dispatcher.allocated() == 0,
            "empty",
            0usize,
            dispatcher.allocated()
        );
        sys::close_fd(&mut r);
        sys::close_fd(&mut w);
        crate::test_complete!("readable_event_after_write");
    }

    #[test]
    fn capacity_limit_reports_table_full() {
        init_test("capacity_limit_reports_table_full");
        let _fd_guard = crate::test_utils::fd_serial();
        let dispatcher = PollDispatcher::with_capacity(1).expect("poller");
        let (mut r, mut w) = sys::pipe().expect("pipe");
        let _token = dispatcher.alloc_handle(r).expect("first");
        let err = dispatcher.alloc_handle(w).expect_err("full");
        crate::assert_with_log!(
            matches!(err, SpawnError::DispatcherFull),
            "variant",
            "DispatcherFull",
            err
        );
        sys::close_fd(&mut r);
        sys::close_fd(&mut w);
        crate::test_complete!("capacity_limit_reports_table_full");
    }

    #[test]
    fn free_of_attached_handle_deletes_source() {
        init_test("free_of_attached_handle_deletes_source");
        let _fd_guard = crate::test_utils::fd_serial();
        let dispatcher = PollDispatcher::new().expect("poller");
        let (mut r, mut w) = sys::pipe().expect("pipe");
        let token = dispatcher.alloc_handle(r).expect("alloc");
        dispatcher.attach(token, Interest::READABLE).expect("attach");
        dispatcher.free_handle(token).expect("free");
        crate::assert_with_log!(
            dispatcher.attached() == 0,
            "detached",
            0usize,
            dispatcher.attached()
        );
        sys::close_fd(&mut r);
        sys::close_fd(&mut w);
        crate::test_complete!("free_of_attached_handle_deletes_source");
    }
}
