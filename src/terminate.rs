//! Escalating termination and reaping of a spawned child.
//!
//! The terminator is an explicit state machine. A child that already
//! exited is reaped without receiving any signal. Otherwise the whole
//! process group gets SIGTERM, and each harsher step runs only if the
//! previous *send* failed: direct SIGTERM, then SIGPIPE (for targets that
//! block or ignore SIGTERM), then SIGKILL. A bounded non-blocking reap
//! loop then drains the group, and the record always concludes with
//! pid = -1. Termination never fails: send errors are logged and the
//! machine moves on.

use crate::signal::SignalKind;
use crate::spawn::{PipedSpawn, TimeoutHandler};
use crate::sys;
use std::io;
use std::sync::Arc;
use tracing::{debug, info};

/// Upper bound on consecutive non-blocking reaps per target. The drain
/// stops early as soon as nothing is waiting.
const REAP_DRAIN_LIMIT: usize = 256;

/// States the terminator traverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateState {
    /// A live child was tracked on entry.
    Alive,
    /// The child had already exited and was reaped without any signal.
    ReapedClean,
    /// SIGTERM was sent to the child's process group.
    SigtermSent,
    /// The group send failed; SIGTERM was sent to the pid directly.
    SigtermDirect,
    /// The direct send failed; SIGPIPE was sent.
    SigpipeSent,
    /// The SIGPIPE send failed; SIGKILL was sent.
    SigkillSent,
    /// Terminal state: the record no longer tracks a child.
    Reaped,
}

/// What one termination request did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateOutcome {
    /// Whether a live child was tracked on entry. False makes the whole
    /// request a no-op.
    pub had_child: bool,
    /// States traversed, in order. Each escalation state records that the
    /// corresponding signal send was attempted.
    pub trace: Vec<TerminateState>,
}

impl TerminateOutcome {
    fn no_child() -> Self {
        Self {
            had_child: false,
            trace: Vec::new(),
        }
    }

    /// True if the child was reaped without receiving any signal.
    #[must_use]
    pub fn reaped_clean(&self) -> bool {
        self.trace.contains(&TerminateState::ReapedClean)
    }
}

/// A reaped child and its raw wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapedChild {
    /// Pid of the reaped process.
    pub pid: libc::pid_t,
    /// Raw status as reported by waitpid.
    pub status: i32,
}

/// Process-control seam so the escalation machine is testable without a
/// live child.
pub trait ProcessOps: Send + Sync {
    /// Sends `signal` to `target` (a pid, or a negated pgid for a group).
    fn send_signal(&self, target: libc::pid_t, signal: SignalKind) -> io::Result<()>;

    /// Non-blocking reap of `target`. `Ok(None)` means nothing waiting.
    fn try_reap(&self, target: libc::pid_t) -> io::Result<Option<ReapedChild>>;
}

/// The libc-backed [`ProcessOps`].
pub struct OsProcessOps;

impl ProcessOps for OsProcessOps {
    fn send_signal(&self, target: libc::pid_t, signal: SignalKind) -> io::Result<()> {
        sys::send_signal(target, signal.as_raw_value())
    }

    fn try_reap(&self, target: libc::pid_t) -> io::Result<Option<ReapedChild>> {
        Ok(sys::try_reap(target)?.map(|(pid, status)| ReapedChild { pid, status }))
    }
}

/// Terminates and reaps the record's child.
///
/// Always succeeds; on return the record tracks no child (pid = -1).
/// Calling it again is a no-op.
pub fn terminate(rec: &mut PipedSpawn, ops: &dyn ProcessOps) -> TerminateOutcome {
    let pid = rec.pid();
    if pid <= 0 {
        return TerminateOutcome::no_child();
    }
    let mut trace = vec![TerminateState::Alive];

    // A child that is already gone gets no signal at all.
    if let Ok(Some(reaped)) = ops.try_reap(pid) {
        debug!(pid = reaped.pid, status = reaped.status, "child already exited");
        trace.push(TerminateState::ReapedClean);
        trace.push(TerminateState::Reaped);
        rec.mark_reaped(true);
        return TerminateOutcome {
            had_child: true,
            trace,
        };
    }

    escalate(pid, ops, &mut trace);
    drain(pid, ops);

    trace.push(TerminateState::Reaped);
    rec.mark_reaped(false);
    TerminateOutcome {
        had_child: true,
        trace,
    }
}

/// Sends the escalation chain. Each harsher signal is attempted only when
/// the previous send itself failed; whether the child honors a delivered
/// signal is the reap loop's problem.
fn escalate(pid: libc::pid_t, ops: &dyn ProcessOps, trace: &mut Vec<TerminateState>) {
    trace.push(TerminateState::SigtermSent);
    let group_err = match ops.send_signal(-pid, SignalKind::Terminate) {
        Ok(()) => return,
        Err(err) => err,
    };
    debug!(pid, error = %group_err, "group SIGTERM failed, retargeting pid");

    trace.push(TerminateState::SigtermDirect);
    let direct_err = match ops.send_signal(pid, SignalKind::Terminate) {
        Ok(()) => return,
        Err(err) => err,
    };
    debug!(pid, error = %direct_err, "direct SIGTERM failed, trying SIGPIPE");

    trace.push(TerminateState::SigpipeSent);
    let pipe_err = match ops.send_signal(pid, SignalKind::Pipe) {
        Ok(()) => return,
        Err(err) => err,
    };
    debug!(pid, error = %pipe_err, "SIGPIPE failed, trying SIGKILL");

    trace.push(TerminateState::SigkillSent);
    if let Err(err) = ops.send_signal(pid, SignalKind::Kill) {
        // Nothing left to try; the reap loop may still collect a zombie.
        info!(pid, error = %err, "SIGKILL failed");
    }
}

/// Drains the process group and the direct pid without blocking.
fn drain(pid: libc::pid_t, ops: &dyn ProcessOps) {
    for _ in 0..REAP_DRAIN_LIMIT {
        let reaped = match ops.try_reap(-pid) {
            Ok(Some(reaped)) => Some(reaped),
            _ => match ops.try_reap(pid) {
                Ok(Some(reaped)) => Some(reaped),
                _ => None,
            },
        };
        match reaped {
            Some(child) => {
                debug!(pid = child.pid, status = child.status, "reaped child");
            }
            None => break,
        }
    }
}

/// The standard timeout handler: terminates the child when the armed
/// timeout fires. The record keeps its channels; the caller still drains
/// them and destroys the record.
#[must_use]
pub fn timeout_kill() -> TimeoutHandler {
    Arc::new(|record| {
        let mut rec = record.lock();
        let outcome = terminate(&mut rec, &OsProcessOps);
        if outcome.had_child {
            info!(trace = ?outcome.trace, "timeout terminated child");
        }
    })
}
