//! Child-process spawning with stdin/stdout/stderr piped into an
//! event-driven I/O dispatcher.
//!
//! A spawned child's three standard streams are redirected through pipes
//! whose parent-side ends become first-class pollable sources in an
//! existing dispatcher. The crate owns the child's full lifecycle: launch,
//! optional timeout-armed termination, escalating kill, zombie reaping,
//! and deterministic release of every OS resource on every exit path,
//! including partial failures in the middle of setup.
//!
//! # Architecture
//!
//! - [`spawn::spawn_piped`] runs the setup sequence and returns a shared
//!   [`spawn::PipedSpawn`] record; any failure unwinds in layers (detach
//!   from the dispatcher, release handles, close descriptors) so nothing
//!   leaks.
//! - [`terminate::terminate`] escalates SIGTERM (group, then direct),
//!   SIGPIPE and SIGKILL, reaps, and always concludes with no child
//!   tracked.
//! - The external collaborators sit behind traits:
//!   [`dispatch::Dispatcher`] (with the deterministic
//!   [`dispatch::LabDispatcher`] and the epoll/kqueue backed
//!   [`dispatch::PollDispatcher`]) and [`timer::TimerScheduler`] (with
//!   [`timer::LabTimers`]).
//!
//! # Example
//!
//! ```no_run
//! use pipespawn::{
//!     destroy, spawn_piped, OsProcessOps, PollDispatcher, Protocol,
//!     ProtocolRegistry, SpawnContext, SpawnOptions, SpawnSet,
//! };
//! use pipespawn::{terminate, LabTimers};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Arc::new(PollDispatcher::new()?);
//! let mut protocols = ProtocolRegistry::new();
//! protocols.register(Protocol::new("raw-pipe"));
//! let ctx = SpawnContext::new(
//!     dispatcher.clone(),
//!     Arc::new(protocols),
//!     Arc::new(LabTimers::new()),
//! );
//!
//! let owner = Arc::new(SpawnSet::new());
//! let record = spawn_piped(
//!     &ctx,
//!     Some(&owner),
//!     &SpawnOptions::new("/bin/echo").arg("hello"),
//! )?;
//!
//! // ... drive the dispatcher, read the child's stdout ...
//!
//! terminate(&mut record.lock(), &OsProcessOps);
//! destroy(&ctx, &record);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod channel;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod pipes;
pub mod protocol;
pub mod registry;
pub mod signal;
pub mod spawn;
mod sys;
pub mod terminate;
pub mod test_logging;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod timer;

pub use channel::{ChannelHandle, ChannelKind};
pub use context::SpawnContext;
pub use dispatch::{
    DispatchEvent, Dispatcher, Interest, LabDispatcher, LabFailure, PollDispatcher, Token,
};
pub use error::{Result, SpawnError};
pub use pipes::StdioPipes;
pub use protocol::{Protocol, ProtocolRegistry};
pub use registry::{SpawnKey, SpawnSet};
pub use signal::SignalKind;
pub use spawn::{destroy, spawn_piped, PipedSpawn, SpawnOptions, SpawnState, TimeoutHandler};
pub use terminate::{
    terminate, timeout_kill, OsProcessOps, ProcessOps, ReapedChild, TerminateOutcome,
    TerminateState,
};
pub use timer::{LabTimers, TimeoutCallback, TimerKey, TimerScheduler};
