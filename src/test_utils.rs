//! Shared helpers for the crate's unit tests.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the tracing subscriber for test output, once per test binary.
pub(crate) fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

static FD_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that allocate raw descriptors.
///
/// Assertions about a closed descriptor are only meaningful if no
/// concurrent test can reuse its number; every test that opens pipes or
/// forks holds this guard.
pub(crate) fn fd_serial() -> MutexGuard<'static, ()> {
    FD_LOCK.lock()
}

/// Marks the start of a test.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Marks a named section within a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::info!(section = $name, "--- section ---");
    };
}

/// Marks the successful end of a test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Asserts a condition, logging the expected and actual values.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $label:expr, $expected:expr, $actual:expr) => {
        if $cond {
            tracing::debug!(check = $label, "ok");
        } else {
            tracing::error!(
                check = $label,
                expected = ?$expected,
                actual = ?$actual,
                "assertion failed"
            );
            panic!(
                "{}: expected {:?}, got {:?}",
                $label, $expected, $actual
            );
        }
    };
}
