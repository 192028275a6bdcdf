//! Test logging infrastructure for spawn scenarios.
//!
//! Captures the lifecycle of a piped spawn as typed events (pipe opens,
//! handle registrations, signals, reaps, unwind steps) with timestamps, so
//! an integration test that fails can print exactly what the launcher and
//! terminator did.
//!
//! # Overview
//!
//! - [`TestLogLevel`]: configurable verbosity levels
//! - [`TestEvent`]: typed events for spawn operations
//! - [`TestLogger`]: captures and reports events with timestamps
//!
//! # Example
//!
//! ```ignore
//! use pipespawn::test_logging::{TestLogger, TestLogLevel, TestEvent};
//!
//! let logger = TestLogger::new(TestLogLevel::Debug);
//! logger.log(TestEvent::Launch { pid: 4242, protocol: "raw-pipe".into() });
//!
//! // On test completion, print the report
//! println!("{}", logger.report());
//! ```

use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// ============================================================================
// TestLogLevel
// ============================================================================

/// Logging verbosity level for tests.
///
/// Levels are ordered from least to most verbose:
/// `Error < Warn < Info < Debug < Trace`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only errors and failures.
    Error,
    /// Warnings and above.
    Warn,
    /// General test progress.
    #[default]
    Info,
    /// Detailed resource operations.
    Debug,
    /// All events including per-descriptor closes and timer churn.
    Trace,
}

impl TestLogLevel {
    /// Returns a human-readable name for the level.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Returns the level from the `TEST_LOG_LEVEL` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("TEST_LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for TestLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TestLogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

// ============================================================================
// TestEvent
// ============================================================================

/// A typed event captured by the test logger.
///
/// Events cover the whole lifecycle of a piped spawn:
/// - Pipe events (open, close)
/// - Dispatcher events (handle alloc, attach, detach, poll direction)
/// - Process events (launch, signal, reap)
/// - Timer events (armed, fired, cancelled)
/// - Custom events for test-specific logging
#[derive(Debug, Clone)]
pub enum TestEvent {
    // ========================================================================
    // Pipe events
    // ========================================================================
    /// A pipe pair was created for a channel.
    PipeOpen {
        /// Channel name ("stdin", "stdout", "stderr").
        channel: &'static str,
        /// Read-end descriptor.
        read_fd: i32,
        /// Write-end descriptor.
        write_fd: i32,
    },

    /// A descriptor was closed.
    PipeClose {
        /// The descriptor that was closed.
        fd: i32,
    },

    // ========================================================================
    // Dispatcher events
    // ========================================================================
    /// A connection handle was allocated for a channel descriptor.
    HandleAlloc {
        /// Token assigned to the handle.
        token: usize,
        /// Descriptor the handle wraps.
        fd: i32,
    },

    /// A handle was attached to the descriptor table.
    HandleAttach {
        /// Token of the handle.
        token: usize,
    },

    /// A handle left the descriptor table.
    HandleDetach {
        /// Token of the handle.
        token: usize,
    },

    /// A channel's poll direction was changed.
    PollDirection {
        /// Token of the handle.
        token: usize,
        /// New direction ("readable", "writable", ...).
        direction: String,
    },

    // ========================================================================
    // Process events
    // ========================================================================
    /// A child was forked and exec'd.
    Launch {
        /// Pid of the child.
        pid: i32,
        /// Protocol handling the channels.
        protocol: String,
    },

    /// A signal send was attempted.
    SignalSent {
        /// Target pid (negative for a process group).
        target: i32,
        /// Signal name ("SIGTERM", "SIGPIPE", "SIGKILL").
        signal: &'static str,
        /// Whether the send succeeded.
        delivered: bool,
    },

    /// A child was reaped.
    Reaped {
        /// Pid of the reaped process.
        pid: i32,
        /// Raw wait status.
        status: i32,
    },

    /// One unwind layer ran during a failed launch.
    UnwindStep {
        /// Layer name ("detach", "release", "close").
        layer: &'static str,
        /// What the layer actually did.
        detail: String,
    },

    // ========================================================================
    // Timer events
    // ========================================================================
    /// A timeout was armed.
    TimerArmed {
        /// Delay until it fires.
        after: Duration,
    },

    /// An armed timeout fired.
    TimerFired,

    /// An armed timeout was cancelled before firing.
    TimerCancelled,

    // ========================================================================
    // Custom events
    // ========================================================================
    /// Custom event for test-specific logging.
    Custom {
        /// Category for filtering.
        category: &'static str,
        /// Human-readable message.
        message: String,
    },

    /// Error event.
    Error {
        /// Error category.
        category: &'static str,
        /// Error message.
        message: String,
    },

    /// Warning event.
    Warn {
        /// Warning category.
        category: &'static str,
        /// Warning message.
        message: String,
    },
}

impl TestEvent {
    /// Returns the minimum log level required to display this event.
    #[must_use]
    pub fn level(&self) -> TestLogLevel {
        match self {
            Self::Error { .. } => TestLogLevel::Error,
            Self::Warn { .. } => TestLogLevel::Warn,
            Self::Launch { .. } | Self::Reaped { .. } => TestLogLevel::Info,
            Self::PipeOpen { .. }
            | Self::HandleAlloc { .. }
            | Self::HandleAttach { .. }
            | Self::HandleDetach { .. }
            | Self::SignalSent { .. }
            | Self::UnwindStep { .. }
            | Self::Custom { .. } => TestLogLevel::Debug,
            Self::PipeClose { .. }
            | Self::PollDirection { .. }
            | Self::TimerArmed { .. }
            | Self::TimerFired
            | Self::TimerCancelled => TestLogLevel::Trace,
        }
    }

    /// Returns a short category name for the event.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::PipeOpen { .. } | Self::PipeClose { .. } => "pipe",
            Self::HandleAlloc { .. }
            | Self::HandleAttach { .. }
            | Self::HandleDetach { .. }
            | Self::PollDirection { .. } => "dispatch",
            Self::Launch { .. } | Self::SignalSent { .. } | Self::Reaped { .. } => "process",
            Self::UnwindStep { .. } => "unwind",
            Self::TimerArmed { .. } | Self::TimerFired | Self::TimerCancelled => "timer",
            Self::Custom { category, .. }
            | Self::Error { category, .. }
            | Self::Warn { category, .. } => category,
        }
    }
}

impl std::fmt::Display for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PipeOpen {
                channel,
                read_fd,
                write_fd,
            } => {
                write!(f, "pipe open: channel={channel} read={read_fd} write={write_fd}")
            }
            Self::PipeClose { fd } => write!(f, "pipe close: fd={fd}"),
            Self::HandleAlloc { token, fd } => {
                write!(f, "handle alloc: token={token} fd={fd}")
            }
            Self::HandleAttach { token } => write!(f, "handle attach: token={token}"),
            Self::HandleDetach { token } => write!(f, "handle detach: token={token}"),
            Self::PollDirection { token, direction } => {
                write!(f, "poll direction: token={token} direction={direction}")
            }
            Self::Launch { pid, protocol } => {
                write!(f, "launch: pid={pid} protocol={protocol}")
            }
            Self::SignalSent {
                target,
                signal,
                delivered,
            } => {
                if *delivered {
                    write!(f, "signal: target={target} {signal}")
                } else {
                    write!(f, "signal: target={target} {signal} SEND_FAILED")
                }
            }
            Self::Reaped { pid, status } => write!(f, "reaped: pid={pid} status={status}"),
            Self::UnwindStep { layer, detail } => {
                write!(f, "unwind {layer}: {detail}")
            }
            Self::TimerArmed { after } => write!(f, "timer armed: after={after:?}"),
            Self::TimerFired => write!(f, "timer fired"),
            Self::TimerCancelled => write!(f, "timer cancelled"),
            Self::Custom { category, message } => write!(f, "[{category}] {message}"),
            Self::Error { category, message } => write!(f, "ERROR [{category}] {message}"),
            Self::Warn { category, message } => write!(f, "WARN [{category}] {message}"),
        }
    }
}

// ============================================================================
// TestLogger
// ============================================================================

/// A timestamped event record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Time since logger creation.
    pub elapsed: Duration,
    /// The event that occurred.
    pub event: TestEvent,
}

/// Test logger that captures typed spawn events with timestamps.
///
/// # Example
///
/// ```ignore
/// let logger = TestLogger::new(TestLogLevel::Debug);
///
/// logger.log(TestEvent::HandleAlloc { token: 0, fd: 5 });
/// logger.log(TestEvent::HandleDetach { token: 0 });
///
/// println!("{}", logger.report());
/// logger.assert_handles_released();
/// ```
#[derive(Debug)]
pub struct TestLogger {
    /// Minimum level to capture.
    level: TestLogLevel,
    /// Captured events.
    events: Mutex<Vec<LogRecord>>,
    /// Start time for elapsed calculation.
    start_time: Instant,
    /// Whether to print events immediately.
    verbose: bool,
}

impl TestLogger {
    /// Creates a new logger with the specified level.
    #[must_use]
    pub fn new(level: TestLogLevel) -> Self {
        Self {
            level,
            events: Mutex::new(Vec::new()),
            start_time: Instant::now(),
            verbose: level >= TestLogLevel::Trace,
        }
    }

    /// Creates a logger using the `TEST_LOG_LEVEL` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(TestLogLevel::from_env())
    }

    /// Sets whether to print events immediately.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Returns the configured log level.
    #[must_use]
    pub fn level(&self) -> TestLogLevel {
        self.level
    }

    /// Returns the elapsed time since logger creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns whether the logger should capture events at the given level.
    #[must_use]
    pub fn should_log(&self, level: TestLogLevel) -> bool {
        level <= self.level
    }

    /// Logs an event if it meets the configured level.
    pub fn log(&self, event: TestEvent) {
        let event_level = event.level();
        if !self.should_log(event_level) {
            return;
        }

        let elapsed = self.start_time.elapsed();

        if self.verbose {
            eprintln!(
                "[{:>10.3}ms] [{:>5}] {}",
                elapsed.as_secs_f64() * 1000.0,
                event_level.name(),
                &event
            );
        }

        let record = LogRecord { elapsed, event };
        self.events.lock().expect("lock poisoned").push(record);
    }

    /// Logs a custom event.
    pub fn custom(&self, category: &'static str, message: impl Into<String>) {
        self.log(TestEvent::Custom {
            category,
            message: message.into(),
        });
    }

    /// Logs an error event.
    pub fn error(&self, category: &'static str, message: impl Into<String>) {
        self.log(TestEvent::Error {
            category,
            message: message.into(),
        });
    }

    /// Logs a warning event.
    pub fn warn(&self, category: &'static str, message: impl Into<String>) {
        self.log(TestEvent::Warn {
            category,
            message: message.into(),
        });
    }

    /// Returns the number of captured events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.lock().expect("lock poisoned").len()
    }

    /// Returns a snapshot of all captured events.
    #[must_use]
    pub fn events(&self) -> Vec<LogRecord> {
        self.events.lock().expect("lock poisoned").clone()
    }

    /// Generates a detailed report of all captured events.
    #[must_use]
    #[allow(clippy::significant_drop_tightening)]
    pub fn report(&self) -> String {
        let events = self.events.lock().expect("lock poisoned");
        let mut report = String::new();

        let _ = writeln!(report, "=== Spawn Event Log ({} events) ===", events.len());
        let _ = writeln!(report);

        for record in events.iter() {
            let _ = writeln!(
                report,
                "[{:>10.3}ms] [{:>5}] {:>8} | {}",
                record.elapsed.as_secs_f64() * 1000.0,
                record.event.level().name(),
                record.event.category(),
                record.event
            );
        }

        let _ = writeln!(report);
        let _ = writeln!(report, "=== Statistics ===");

        let pipe_opens = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::PipeOpen { .. }))
            .count();
        let allocs = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::HandleAlloc { .. }))
            .count();
        let detaches = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::HandleDetach { .. }))
            .count();
        let signals = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::SignalSent { .. }))
            .count();
        let reaps = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::Reaped { .. }))
            .count();
        let unwinds = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::UnwindStep { .. }))
            .count();
        let errors = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::Error { .. }))
            .count();
        let warnings = events
            .iter()
            .filter(|r| matches!(r.event, TestEvent::Warn { .. }))
            .count();

        let _ = writeln!(report, "Pipe opens: {pipe_opens}");
        let _ = writeln!(report, "Handle allocs: {allocs}");
        let _ = writeln!(report, "Handle detaches: {detaches}");
        let _ = writeln!(report, "Signals sent: {signals}");
        let _ = writeln!(report, "Children reaped: {reaps}");
        let _ = writeln!(report, "Unwind steps: {unwinds}");
        let _ = writeln!(report, "Errors: {errors}");
        let _ = writeln!(report, "Warnings: {warnings}");

        if let Some(last) = events.last() {
            let _ = writeln!(report, "Total duration: {:?}", last.elapsed);
        }

        report
    }

    /// Asserts that no errors were logged.
    ///
    /// # Panics
    ///
    /// Panics if any error events were logged.
    pub fn assert_no_errors(&self) {
        let error_messages: Vec<String> = {
            let events = self.events.lock().expect("lock poisoned");
            events
                .iter()
                .filter(|r| matches!(r.event, TestEvent::Error { .. }))
                .map(|r| format!("  - {}", r.event))
                .collect()
        };

        assert!(
            error_messages.is_empty(),
            "Test logged {} errors:\n{}\n\nFull log:\n{}",
            error_messages.len(),
            error_messages.join("\n"),
            self.report()
        );
    }

    /// Asserts that every allocated handle was detached again.
    ///
    /// # Panics
    ///
    /// Panics if any handle with an alloc event lacks a detach event.
    pub fn assert_handles_released(&self) {
        let leaked: Vec<usize> = {
            let events = self.events.lock().expect("lock poisoned");

            let allocated: std::collections::HashSet<_> = events
                .iter()
                .filter_map(|r| {
                    if let TestEvent::HandleAlloc { token, .. } = r.event {
                        Some(token)
                    } else {
                        None
                    }
                })
                .collect();

            let detached: std::collections::HashSet<_> = events
                .iter()
                .filter_map(|r| {
                    if let TestEvent::HandleDetach { token } = r.event {
                        Some(token)
                    } else {
                        None
                    }
                })
                .collect();

            allocated.difference(&detached).copied().collect()
        };

        assert!(
            leaked.is_empty(),
            "Handle leak detected: {} handles allocated but not detached: {:?}\n\nFull log:\n{}",
            leaked.len(),
            leaked,
            self.report()
        );
    }

    /// Clears all captured events.
    pub fn clear(&self) {
        self.events.lock().expect("lock poisoned").clear();
    }
}

impl Default for TestLogger {
    fn default() -> Self {
        Self::new(TestLogLevel::Info)
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Log a custom event to a test logger.
///
/// # Example
///
/// ```ignore
/// test_log!(logger, "setup", "Spawning {} with piped stdio", program);
/// ```
#[macro_export]
macro_rules! test_log {
    ($logger:expr, $cat:literal, $($arg:tt)*) => {
        $logger.log($crate::test_logging::TestEvent::Custom {
            category: $cat,
            message: format!($($arg)*),
        });
    };
}

/// Log an error event to a test logger.
///
/// # Example
///
/// ```ignore
/// test_error!(logger, "spawn", "Launch failed: {}", err);
/// ```
#[macro_export]
macro_rules! test_error {
    ($logger:expr, $cat:literal, $($arg:tt)*) => {
        $logger.log($crate::test_logging::TestEvent::Error {
            category: $cat,
            message: format!($($arg)*),
        });
    };
}

/// Log a warning event to a test logger.
///
/// # Example
///
/// ```ignore
/// test_warn!(logger, "reap", "Child outlived SIGTERM by {}ms", elapsed);
/// ```
#[macro_export]
macro_rules! test_warn {
    ($logger:expr, $cat:literal, $($arg:tt)*) => {
        $logger.log($crate::test_logging::TestEvent::Warn {
            category: $cat,
            message: format!($($arg)*),
        });
    };
}

/// Assert a condition, printing the full log on failure.
///
/// # Example
///
/// ```ignore
/// assert_log!(logger, record.lock().pid() > 0, "expected a live child");
/// ```
#[macro_export]
macro_rules! assert_log {
    ($logger:expr, $cond:expr) => {
        if !$cond {
            eprintln!("{}", $logger.report());
            panic!("assertion failed: {}", stringify!($cond));
        }
    };
    ($logger:expr, $cond:expr, $($arg:tt)*) => {
        if !$cond {
            eprintln!("{}", $logger.report());
            panic!($($arg)*);
        }
    };
}

// ============================================================================
// Tests
// ============================================================================
