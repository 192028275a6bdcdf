//! The spawn context.
//!
//! Bundles the three collaborators every launch needs: the event
//! dispatcher, the protocol registry and the timeout scheduler. Cloning is
//! cheap; all three are shared behind `Arc`.

use crate::dispatch::Dispatcher;
use crate::protocol::ProtocolRegistry;
use crate::timer::TimerScheduler;
use std::sync::Arc;

/// Shared environment a spawn runs inside.
#[derive(Clone)]
pub struct SpawnContext {
    dispatcher: Arc<dyn Dispatcher>,
    protocols: Arc<ProtocolRegistry>,
    timers: Arc<dyn TimerScheduler>,
}

impl SpawnContext {
    /// Creates a context from its three collaborators.
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        protocols: Arc<ProtocolRegistry>,
        timers: Arc<dyn TimerScheduler>,
    ) -> Self {
        Self {
            dispatcher,
            protocols,
            timers,
        }
    }

    /// The event dispatcher channels are registered with.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// The protocol registry spawn options resolve against.
    #[must_use]
    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.protocols
    }

    /// The timeout scheduler.
    #[must_use]
    pub fn timers(&self) -> &Arc<dyn TimerScheduler> {
        &self.timers
    }
}
