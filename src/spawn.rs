//! Launching a child process with piped stdio.
//!
//! [`spawn_piped`] owns the whole setup sequence: resolve the protocol,
//! open the three pipe pairs, allocate and attach a dispatcher handle per
//! channel, arm the initial poll directions, fork, exec in the child, and
//! finalize bookkeeping in the parent. Setup can fail at any step; the
//! teardown runs in three ordered layers (detach from the dispatcher,
//! release handles, close descriptors) over whatever was acquired so far,
//! so no partial failure ever leaks a descriptor or a dispatcher entry.

use crate::channel::{ChannelHandle, ChannelKind};
use crate::context::SpawnContext;
use crate::dispatch::{Dispatcher, Interest, Token};
use crate::error::{Result, SpawnError};
use crate::pipes::StdioPipes;
use crate::registry::{SpawnKey, SpawnSet};
use crate::sys;
use crate::timer::TimerKey;
use parking_lot::Mutex;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handler invoked when a spawn's timeout expires.
///
/// Receives the spawn record and is expected to drive termination; see
/// [`timeout_kill`](crate::terminate::timeout_kill) for the standard one.
pub type TimeoutHandler = Arc<dyn Fn(&Arc<Mutex<PipedSpawn>>) + Send + Sync>;

/// Configuration for one piped spawn.
pub struct SpawnOptions {
    exec: Vec<String>,
    env: Vec<String>,
    protocol: Option<String>,
    timeout: Option<(Duration, TimeoutHandler)>,
    group_leader: bool,
    working_dir: Option<PathBuf>,
    parent: Option<Token>,
}

impl SpawnOptions {
    /// Starts building options for running `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            exec: vec![program.into()],
            env: Vec::new(),
            protocol: None,
            timeout: None,
            group_leader: false,
            working_dir: None,
            parent: None,
        }
    }

    /// Appends one argument to the exec array.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.exec.push(arg.into());
        self
    }

    /// Appends several arguments to the exec array.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds a NAME=VALUE pair to the child's environment.
    ///
    /// Setting any pair replaces the inherited environment entirely; an
    /// empty env means the child inherits the parent's.
    #[must_use]
    pub fn env(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env
            .push(format!("{}={}", name.as_ref(), value.as_ref()));
        self
    }

    /// Selects the protocol handling this spawn's channel events. Without
    /// it the registry's default protocol is used.
    #[must_use]
    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.protocol = Some(name.into());
        self
    }

    /// Arms a one-shot timeout; `handler` runs when it expires.
    #[must_use]
    pub fn timeout(mut self, after: Duration, handler: TimeoutHandler) -> Self {
        self.timeout = Some((after, handler));
        self
    }

    /// Makes the child the leader of a new process group, so termination
    /// can signal the whole group.
    #[must_use]
    pub fn group_leader(mut self, yes: bool) -> Self {
        self.group_leader = yes;
        self
    }

    /// Working directory for the child. Default: inherit the parent's.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Advisory link to the connection that requested the spawn.
    #[must_use]
    pub fn parent(mut self, token: Token) -> Self {
        self.parent = Some(token);
        self
    }
}

/// Lifecycle of a launched spawn record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnState {
    /// Child running, channels armed.
    Launched,
    /// The armed timeout fired and drove termination.
    TimedOut,
    /// Terminated by an explicit kill request.
    Killed,
    /// Child exited on its own and was reaped.
    Exited,
    /// All resources released; the record is inert.
    Destroyed,
}

/// Record of one launched child and its channel resources.
///
/// Created only by [`spawn_piped`]; a failed launch never yields a record.
#[derive(Debug)]
pub struct PipedSpawn {
    pid: libc::pid_t,
    pipes: StdioPipes,
    channels: [Option<ChannelHandle>; 3],
    group_leader: bool,
    protocol: Arc<str>,
    registry_key: Option<SpawnKey>,
    owner: Option<Weak<SpawnSet>>,
    timer_key: Option<TimerKey>,
    state: SpawnState,
}

impl PipedSpawn {
    /// The child's pid. `-1` once the child has been reaped.
    #[must_use]
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Returns true while a live (unreaped) child is tracked.
    #[must_use]
    pub fn has_child(&self) -> bool {
        self.pid > 0
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SpawnState {
        self.state
    }

    /// Whether the child leads its own process group.
    #[must_use]
    pub fn group_leader(&self) -> bool {
        self.group_leader
    }

    /// Name of the protocol handling this spawn's channels.
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The channel handle for `kind`, while the channel is open.
    #[must_use]
    pub fn channel(&self, kind: ChannelKind) -> Option<&ChannelHandle> {
        self.channels[kind.index()].as_ref()
    }

    /// Shorthand for [`channel`](Self::channel)`(ChannelKind::Stdin)`.
    #[must_use]
    pub fn stdin(&self) -> Option<&ChannelHandle> {
        self.channel(ChannelKind::Stdin)
    }

    /// Shorthand for [`channel`](Self::channel)`(ChannelKind::Stdout)`.
    #[must_use]
    pub fn stdout(&self) -> Option<&ChannelHandle> {
        self.channel(ChannelKind::Stdout)
    }

    /// Shorthand for [`channel`](Self::channel)`(ChannelKind::Stderr)`.
    #[must_use]
    pub fn stderr(&self) -> Option<&ChannelHandle> {
        self.channel(ChannelKind::Stderr)
    }

    /// Closes one channel early: detaches it from the dispatcher, releases
    /// the handle and closes the parent-side descriptor.
    ///
    /// Closing stdin is how the parent signals end-of-input to the child.
    pub fn close_channel(&mut self, dispatcher: &dyn Dispatcher, kind: ChannelKind) {
        if let Some(handle) = self.channels[kind.index()].take() {
            if let Err(err) = dispatcher.detach(handle.token()) {
                debug!(channel = %kind, error = %err, "detach on channel close failed");
            }
            if let Err(err) = dispatcher.free_handle(handle.token()) {
                debug!(channel = %kind, error = %err, "free on channel close failed");
            }
        }
        self.pipes.close_parent_end(kind);
    }

    pub(crate) fn mark_reaped(&mut self, clean: bool) {
        self.pid = -1;
        if self.state == SpawnState::Launched {
            self.state = if clean {
                SpawnState::Exited
            } else {
                SpawnState::Killed
            };
        }
    }

    pub(crate) fn mark_timed_out(&mut self) {
        self.state = SpawnState::TimedOut;
    }

    #[cfg(test)]
    pub(crate) fn detached(pid: libc::pid_t) -> Self {
        Self {
            pid,
            pipes: StdioPipes::unset(),
            channels: [None, None, None],
            group_leader: false,
            protocol: Arc::from("raw-pipe"),
            registry_key: None,
            owner: None,
            timer_key: None,
            state: SpawnState::Launched,
        }
    }
}

struct LaunchSetup {
    dispatcher: Arc<dyn Dispatcher>,
    pipes: StdioPipes,
    channels: [Option<ChannelHandle>; 3],
    attached: usize,
}

impl LaunchSetup {
    fn allocate_channel(
        &mut self,
        kind: ChannelKind,
        protocol: &Arc<str>,
        parent: Option<Token>,
    ) -> Result<()> {
        let fd = self.pipes.parent_fd(kind);
        sys::set_nonblocking(fd).map_err(SpawnError::NonBlocking)?;
        // Close-on-exec now, not after fork: a child forked concurrently on
        // another thread must not carry this end across its exec.
        if let Err(err) = sys::set_cloexec(fd) {
            debug!(channel = %kind, error = %err, "close-on-exec not applied");
        }
        let token = self.dispatcher.alloc_handle(fd)?;
        debug!(channel = %kind, fd, token = %token, "allocated channel handle");
        self.channels[kind.index()] =
            Some(ChannelHandle::new(kind, fd, token, protocol.clone(), parent));
        Ok(())
    }

    fn attach_channel(&mut self, kind: ChannelKind) -> Result<()> {
        if let Some(handle) = &self.channels[kind.index()] {
            self.dispatcher.attach(handle.token(), Interest::NONE)?;
            self.attached += 1;
        }
        Ok(())
    }

    fn arm_channel(&self, kind: ChannelKind) -> Result<()> {
        if let Some(handle) = &self.channels[kind.index()] {
            self.dispatcher
                .set_interest(handle.token(), kind.initial_interest())?;
        }
        Ok(())
    }

    /// Layered teardown over whatever this setup has acquired so far.
    /// Tolerates any partially populated state and never double-releases.
    fn unwind(&mut self) {
        // Attached handles leave the descriptor table first; the
        // dispatcher must never observe a closed descriptor. Channels
        // attach in array order, so the first `attached` populated slots
        // are exactly the attached ones.
        let mut remaining = self.attached;
        for slot in &self.channels {
            if remaining == 0 {
                break;
            }
            if let Some(handle) = slot {
                if let Err(err) = self.dispatcher.detach(handle.token()) {
                    debug!(token = %handle.token(), error = %err, "detach during unwind failed");
                }
                remaining -= 1;
            }
        }
        self.attached = 0;
        // Every allocated handle goes back to the pool.
        for slot in &mut self.channels {
            if let Some(handle) = slot.take() {
                if let Err(err) = self.dispatcher.free_handle(handle.token()) {
                    debug!(token = %handle.token(), error = %err, "free during unwind failed");
                }
            }
        }
        // Descriptors last.
        self.pipes.close_all();
    }
}

/// Spawns `opts.exec` with stdin/stdout/stderr piped through the context's
/// dispatcher.
///
/// On success the child is running, its three parent-side pipe ends are
/// non-blocking, close-on-exec, attached to the dispatcher and armed with
/// their initial poll directions (stdin writable, stdout/stderr readable),
/// and the record is a member of `owner` if one was given. On failure
/// every resource acquired before the failing step has been released and
/// no child is left running; a failed launch never returns a record.
pub fn spawn_piped(
    ctx: &SpawnContext,
    owner: Option<&Arc<SpawnSet>>,
    opts: &SpawnOptions,
) -> Result<Arc<Mutex<PipedSpawn>>> {
    // Pure configuration work first, so these failures unwind nothing.
    let protocol: Arc<str> = ctx
        .protocols()
        .resolve(opts.protocol.as_deref())?
        .name()
        .into();
    if opts.exec.is_empty() {
        return Err(SpawnError::InvalidExec("exec array is empty".into()));
    }
    // argv/envp become C vectors now; the child side of the fork must not
    // allocate.
    let argv = sys::ExecVectors::new(&opts.exec)
        .map_err(|e| SpawnError::InvalidExec(e.to_string()))?;
    let envp = match opts.env.is_empty() {
        true => None,
        false => Some(
            sys::ExecVectors::new(&opts.env)
                .map_err(|e| SpawnError::InvalidExec(e.to_string()))?,
        ),
    };
    let workdir = match &opts.working_dir {
        Some(path) => Some(
            CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                SpawnError::InvalidExec("working directory contains NUL".into())
            })?,
        ),
        None => None,
    };

    let mut setup = LaunchSetup {
        dispatcher: ctx.dispatcher().clone(),
        pipes: StdioPipes::open().map_err(SpawnError::PipeCreate)?,
        channels: [None, None, None],
        attached: 0,
    };

    for kind in ChannelKind::ALL {
        if let Err(err) = setup.allocate_channel(kind, &protocol, opts.parent) {
            warn!(channel = %kind, error = %err, "channel allocation failed");
            setup.unwind();
            return Err(err);
        }
    }
    for kind in ChannelKind::ALL {
        if let Err(err) = setup.attach_channel(kind) {
            warn!(channel = %kind, error = %err, "channel attach failed");
            setup.unwind();
            return Err(err);
        }
    }
    for kind in ChannelKind::ALL {
        if let Err(err) = setup.arm_channel(kind) {
            warn!(channel = %kind, error = %err, "setting poll direction failed");
            setup.unwind();
            return Err(err);
        }
    }

    let pid = match sys::fork() {
        Ok(pid) => pid,
        Err(err) => {
            warn!(error = %err, "fork failed");
            setup.unwind();
            return Err(SpawnError::ForkFailed(err));
        }
    };
    if pid == 0 {
        // Child. Wires fds 0/1/2 and execs; never returns into this crate.
        sys::child_after_fork(
            setup.pipes.raw(),
            &argv,
            envp.as_ref(),
            workdir.as_ref(),
            opts.group_leader,
        );
    }

    // Parent: drop the child's ends.
    for kind in ChannelKind::ALL {
        setup.pipes.close_child_end(kind);
    }
    info!(pid, protocol = %protocol, "spawned piped child");

    let LaunchSetup {
        pipes, channels, ..
    } = setup;
    let record = Arc::new(Mutex::new(PipedSpawn {
        pid,
        pipes,
        channels,
        group_leader: opts.group_leader,
        protocol,
        registry_key: None,
        owner: None,
        timer_key: None,
        state: SpawnState::Launched,
    }));

    if let Some(owner) = owner {
        let key = owner.add(record.clone());
        let mut rec = record.lock();
        rec.registry_key = Some(key);
        rec.owner = Some(Arc::downgrade(owner));
    }
    if let Some((after, handler)) = &opts.timeout {
        let weak = Arc::downgrade(&record);
        let handler = handler.clone();
        let key = ctx.timers().schedule(
            *after,
            Box::new(move || {
                if let Some(record) = weak.upgrade() {
                    record.lock().mark_timed_out();
                    handler(&record);
                }
            }),
        );
        record.lock().timer_key = Some(key);
    }
    Ok(record)
}

/// Releases every resource a spawn record still holds.
///
/// Detaches and frees the remaining channel handles, closes the remaining
/// parent-side descriptors, cancels the armed timeout and removes the
/// record from its owning registry. Calling it again is a no-op; the child
/// process itself is not touched (see
/// [`terminate`](crate::terminate::terminate)).
pub fn destroy(ctx: &SpawnContext, record: &Arc<Mutex<PipedSpawn>>) {
    let mut rec = record.lock();
    if rec.state == SpawnState::Destroyed {
        return;
    }
    for kind in ChannelKind::ALL {
        rec.close_channel(ctx.dispatcher().as_ref(), kind);
    }
    rec.pipes.close_all();
    if let Some(key) = rec.timer_key.take() {
        ctx.timers().cancel(key);
    }
    let owner = rec.owner.take().and_then(|weak| weak.upgrade());
    if let (Some(owner), Some(key)) = (owner, rec.registry_key.take()) {
        owner.remove(key);
    }
    debug!(pid = rec.pid, "spawn record destroyed");
    rec.state = SpawnState::Destroyed;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LabDispatcher;
    use crate::protocol::{Protocol, ProtocolRegistry};
    use crate::terminate::{terminate, OsProcessOps};
    use crate::timer::LabTimers;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn lab_context(dispatcher: Arc<LabDispatcher>) -> SpawnContext {
        let mut protocols = ProtocolRegistry::new();
        protocols.register(Protocol::new("raw-pipe"));
        SpawnContext::new(dispatcher, Arc::new(protocols), Arc::new(LabTimers::new()))
    }

    #[test]
    fn builder_collects_exec_and_env() {
        init_test("builder_collects_exec_and_env");
        let opts = SpawnOptions::new("sh")
            .arg("-c")
            .arg("true")
            .env("LANG", "C")
            .group_leader(true)
            .working_dir("/tmp");
        crate::assert_with_log!(
            opts.exec == vec!["sh", "-c", "true"],
            "exec",
            vec!["sh", "-c", "true"],
            opts.exec
        );
        crate::assert_with_log!(
            opts.env == vec!["LANG=C"],
            "env",
            vec!["LANG=C"],
            opts.env
        );
        crate::assert_with_log!(opts.group_leader, "group leader", true, opts.group_leader);
        crate::test_complete!("builder_collects_exec_and_env");
    }

    #[test]
    fn launch_arms_initial_directions() {
        init_test("launch_arms_initial_directions");
        let _fd_guard = crate::test_utils::fd_serial();
        let dispatcher = Arc::new(LabDispatcher::new());
        let ctx = lab_context(dispatcher.clone());
        let record = spawn_piped(&ctx, None, &SpawnOptions::new("/bin/true"))
            .expect("spawn");
        {
            let rec = record.lock();
            crate::assert_with_log!(rec.has_child(), "child pid", true, rec.has_child());
            crate::assert_with_log!(
                rec.state() == SpawnState::Launched,
                "state",
                SpawnState::Launched,
                rec.state()
            );
            for kind in ChannelKind::ALL {
                let handle = rec.channel(kind).expect("channel");
                let interest = dispatcher.interest_of(handle.token());
                crate::assert_with_log!(
                    interest == Some(kind.initial_interest()),
                    "direction",
                    Some(kind.initial_interest()),
                    interest
                );
            }
        }
        crate::assert_with_log!(
            dispatcher.attached() == 3,
            "three attached",
            3usize,
            dispatcher.attached()
        );
        {
            let mut rec = record.lock();
            terminate(&mut rec, &OsProcessOps);
        }
        destroy(&ctx, &record);
        crate::assert_with_log!(
            dispatcher.allocated() == 0,
            "all released",
            0usize,
            dispatcher.allocated()
        );
        crate::test_complete!("launch_arms_initial_directions");
    }

    #[test]
    fn empty_exec_fails_before_any_resource() {
        init_test("empty_exec_fails_before_any_resource");
        let dispatcher = Arc::new(LabDispatcher::new());
        let ctx = lab_context(dispatcher.clone());
        let mut opts = SpawnOptions::new("ignored");
        opts.exec.clear();
        let err = spawn_piped(&ctx, None, &opts).expect_err("empty exec");
        crate::assert_with_log!(
            matches!(err, SpawnError::InvalidExec(_)),
            "variant",
            "InvalidExec",
            err
        );
        crate::assert_with_log!(
            dispatcher.allocated() == 0,
            "nothing allocated",
            0usize,
            dispatcher.allocated()
        );
        crate::test_complete!("empty_exec_fails_before_any_resource");
    }

    #[test]
    fn destroy_is_idempotent_and_leaves_registry() {
        init_test("destroy_is_idempotent_and_leaves_registry");
        let _fd_guard = crate::test_utils::fd_serial();
        let dispatcher = Arc::new(LabDispatcher::new());
        let ctx = lab_context(dispatcher.clone());
        let owner = Arc::new(SpawnSet::new());
        let record = spawn_piped(&ctx, Some(&owner), &SpawnOptions::new("/bin/true"))
            .expect("spawn");
        crate::assert_with_log!(owner.len() == 1, "registered", 1usize, owner.len());
        {
            let mut rec = record.lock();
            terminate(&mut rec, &OsProcessOps);
        }
        destroy(&ctx, &record);
        crate::assert_with_log!(owner.is_empty(), "removed", true, owner.is_empty());
        crate::assert_with_log!(
            record.lock().state() == SpawnState::Destroyed,
            "destroyed",
            SpawnState::Destroyed,
            record.lock().state()
        );
        destroy(&ctx, &record);
        crate::assert_with_log!(
            dispatcher.detach_misses() == 0,
            "no double release",
            0usize,
            dispatcher.detach_misses()
        );
        crate::test_complete!("destroy_is_idempotent_and_leaves_registry");
    }

    #[test]
    fn timeout_fires_through_lab_timers() {
        init_test("timeout_fires_through_lab_timers");
        let _fd_guard = crate::test_utils::fd_serial();
        let dispatcher = Arc::new(LabDispatcher::new());
        let mut protocols = ProtocolRegistry::new();
        protocols.register(Protocol::new("raw-pipe"));
        let timers = Arc::new(LabTimers::new());
        let ctx = SpawnContext::new(dispatcher, Arc::new(protocols), timers.clone());
        let opts = SpawnOptions::new("/bin/sleep").arg("30").timeout(
            Duration::from_millis(10),
            crate::terminate::timeout_kill(),
        );
        let record = spawn_piped(&ctx, None, &opts).expect("spawn");
        crate::assert_with_log!(timers.armed() == 1, "armed", 1usize, timers.armed());
        let fired = timers.advance(Duration::from_millis(20));
        crate::assert_with_log!(fired == 1, "fired", 1usize, fired);
        {
            let rec = record.lock();
            crate::assert_with_log!(rec.pid() == -1, "reaped", -1, rec.pid());
            crate::assert_with_log!(
                rec.state() == SpawnState::TimedOut,
                "timed out",
                SpawnState::TimedOut,
                rec.state()
            );
        }
        destroy(&ctx, &record);
        crate::test_complete!("timeout_fires_through_lab_timers");
    }
}
