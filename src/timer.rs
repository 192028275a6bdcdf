//! Timeout scheduler boundary.
//!
//! The launcher arms at most one timer per spawn; the callback is expected
//! to drive termination. The scheduler is an external collaborator behind
//! the [`TimerScheduler`] trait, with [`LabTimers`] as the deterministic
//! implementation tests advance by hand.

use parking_lot::Mutex;
use slab::Slab;
use std::time::Duration;

/// Callback fired when a spawn's timeout expires.
pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

/// Key identifying an armed timer.
///
/// Generation-stamped so a key held across cancel-and-rearm can never
/// cancel someone else's timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    index: usize,
    generation: u64,
}

/// The seam between the spawner and the timeout scheduler.
pub trait TimerScheduler: Send + Sync {
    /// Arms a one-shot timer firing `after` from now.
    fn schedule(&self, after: Duration, callback: TimeoutCallback) -> TimerKey;

    /// Disarms a timer. A stale or already-fired key is ignored.
    fn cancel(&self, key: TimerKey);
}

struct TimerEntry {
    deadline: Duration,
    generation: u64,
    callback: Option<TimeoutCallback>,
}

#[derive(Default)]
struct LabTimerState {
    now: Duration,
    entries: Slab<TimerEntry>,
    next_generation: u64,
}

/// Deterministic scheduler driven by [`advance`](LabTimers::advance).
#[derive(Default)]
pub struct LabTimers {
    state: Mutex<LabTimerState>,
}

impl LabTimers {
    /// Creates a scheduler at time zero with no armed timers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of armed (not yet fired, not cancelled) timers.
    #[must_use]
    pub fn armed(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Advances virtual time by `delta` and fires every due timer, in
    /// deadline order. Returns the number of callbacks fired.
    ///
    /// Callbacks run outside the scheduler lock, so a callback may
    /// schedule or cancel freely.
    pub fn advance(&self, delta: Duration) -> usize {
        let due = {
            let mut state = self.state.lock();
            state.now += delta;
            let now = state.now;
            let mut due: Vec<(Duration, usize)> = state
                .entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(i, e)| (e.deadline, i))
                .collect();
            due.sort();
            due.into_iter()
                .filter_map(|(_, i)| state.entries.remove(i).callback)
                .collect::<Vec<_>>()
        };
        let fired = due.len();
        for callback in due {
            callback();
        }
        fired
    }
}

impl TimerScheduler for LabTimers {
    fn schedule(&self, after: Duration, callback: TimeoutCallback) -> TimerKey {
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        let deadline = state.now + after;
        let index = state.entries.insert(TimerEntry {
            deadline,
            generation,
            callback: Some(callback),
        });
        TimerKey { index, generation }
    }

    fn cancel(&self, key: TimerKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(key.index) {
            if entry.generation == key.generation {
                state.entries.remove(key.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn advance_fires_due_timers_in_order() {
        init_test("advance_fires_due_timers_in_order");
        let timers = LabTimers::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, ms) in [("late", 30u64), ("early", 10), ("mid", 20)] {
            let order = order.clone();
            timers.schedule(
                Duration::from_millis(ms),
                Box::new(move || order.lock().push(label)),
            );
        }
        let fired = timers.advance(Duration::from_millis(25));
        crate::assert_with_log!(fired == 2, "two fired", 2usize, fired);
        let seen = order.lock().clone();
        crate::assert_with_log!(
            seen == vec!["early", "mid"],
            "order",
            vec!["early", "mid"],
            seen
        );
        crate::assert_with_log!(timers.armed() == 1, "one left", 1usize, timers.armed());
        crate::test_complete!("advance_fires_due_timers_in_order");
    }

    #[test]
    fn cancelled_timer_never_fires() {
        init_test("cancelled_timer_never_fires");
        let timers = LabTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let key = timers.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        timers.cancel(key);
        let count = timers.advance(Duration::from_millis(50));
        crate::assert_with_log!(count == 0, "none fired", 0usize, count);
        crate::assert_with_log!(
            fired.load(Ordering::SeqCst) == 0,
            "callback never ran",
            0usize,
            fired.load(Ordering::SeqCst)
        );
        crate::test_complete!("cancelled_timer_never_fires");
    }

    #[test]
    fn stale_key_cannot_cancel_reused_slot() {
        init_test("stale_key_cannot_cancel_reused_slot");
        let timers = LabTimers::new();
        let first = timers.schedule(Duration::from_millis(5), Box::new(|| {}));
        timers.cancel(first);
        let _second = timers.schedule(Duration::from_millis(5), Box::new(|| {}));
        // The slot was reused; the stale key must not disarm it.
        timers.cancel(first);
        crate::assert_with_log!(timers.armed() == 1, "still armed", 1usize, timers.armed());
        crate::test_complete!("stale_key_cannot_cancel_reused_slot");
    }

    #[test]
    fn callback_may_schedule_another_timer() {
        init_test("callback_may_schedule_another_timer");
        let timers = Arc::new(LabTimers::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let inner_fired = fired.clone();
        let inner_timers = timers.clone();
        timers.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                let counter = inner_fired.clone();
                inner_timers.schedule(
                    Duration::from_millis(5),
                    Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }),
        );
        timers.advance(Duration::from_millis(6));
        crate::assert_with_log!(timers.armed() == 1, "rearmed", 1usize, timers.armed());
        timers.advance(Duration::from_millis(6));
        crate::assert_with_log!(
            fired.load(Ordering::SeqCst) == 1,
            "inner fired",
            1usize,
            fired.load(Ordering::SeqCst)
        );
        crate::test_complete!("callback_may_schedule_another_timer");
    }
}
