//! Error types for piped spawning.
//!
//! Every setup failure is handled locally by the unwind layers before it is
//! reported, so each variant here corresponds to exactly one observable
//! failure of the launch operation. Termination deliberately has no error
//! type: requests against an already-dead or already-reaped child succeed
//! trivially, and signal-send failures during escalation are logged rather
//! than surfaced.

use std::io;

/// Error type for spawn operations.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The requested protocol name matched no registered protocol.
    ///
    /// Checked before any OS resource is created, so this failure leaves
    /// nothing to unwind.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// The connection-handle pool had no free handle for a channel.
    #[error("no free connection handles")]
    HandlePoolExhausted,

    /// The dispatcher's descriptor table is full.
    #[error("dispatcher descriptor table is full")]
    DispatcherFull,

    /// The exec array was empty or contained an interior NUL byte.
    #[error("invalid exec array: {0}")]
    InvalidExec(String),

    /// OS pipe creation failed.
    #[error("pipe creation failed")]
    PipeCreate(#[source] io::Error),

    /// Putting a parent-side descriptor into non-blocking mode failed.
    #[error("setting non-blocking mode failed")]
    NonBlocking(#[source] io::Error),

    /// Inserting a channel handle into the dispatcher's descriptor table
    /// failed.
    #[error("dispatcher registration failed")]
    Register(#[source] io::Error),

    /// Setting the initial poll direction for a channel failed.
    #[error("setting poll direction failed")]
    PollDirection(#[source] io::Error),

    /// The fork itself failed, carrying the OS error.
    #[error("fork failed")]
    ForkFailed(#[source] io::Error),
}

impl SpawnError {
    /// Returns true if this error indicates resource exhaustion (no pipe,
    /// no handle slot, no descriptor-table capacity).
    #[must_use]
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            Self::HandlePoolExhausted | Self::DispatcherFull => true,
            Self::PipeCreate(e) | Self::ForkFailed(e) => {
                matches!(
                    e.raw_os_error(),
                    Some(libc::EMFILE | libc::ENFILE | libc::EAGAIN)
                )
            }
            _ => false,
        }
    }

    /// Returns the underlying OS error code, if this variant carries one.
    #[must_use]
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::PipeCreate(e)
            | Self::NonBlocking(e)
            | Self::Register(e)
            | Self::PollDirection(e)
            | Self::ForkFailed(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// A specialized Result type for spawn operations.
pub type Result<T> = std::result::Result<T, SpawnError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn display_carries_protocol_name() {
        init_test("display_carries_protocol_name");
        let err = SpawnError::UnknownProtocol("cgi".into());
        let msg = err.to_string();
        crate::assert_with_log!(msg.contains("cgi"), "name in message", "cgi", msg);
        crate::test_complete!("display_carries_protocol_name");
    }

    #[test]
    fn resource_exhaustion_classification() {
        init_test("resource_exhaustion_classification");
        let pool = SpawnError::HandlePoolExhausted.is_resource_exhaustion();
        crate::assert_with_log!(pool, "handle pool", true, pool);
        let table = SpawnError::DispatcherFull.is_resource_exhaustion();
        crate::assert_with_log!(table, "table full", true, table);
        let emfile =
            SpawnError::PipeCreate(io::Error::from_raw_os_error(libc::EMFILE));
        crate::assert_with_log!(
            emfile.is_resource_exhaustion(),
            "EMFILE pipe",
            true,
            emfile.is_resource_exhaustion()
        );
        let config = SpawnError::UnknownProtocol("x".into()).is_resource_exhaustion();
        crate::assert_with_log!(!config, "config error", false, config);
        crate::test_complete!("resource_exhaustion_classification");
    }

    #[test]
    fn os_error_is_exposed() {
        init_test("os_error_is_exposed");
        let err = SpawnError::ForkFailed(io::Error::from_raw_os_error(libc::EAGAIN));
        crate::assert_with_log!(
            err.os_error() == Some(libc::EAGAIN),
            "errno",
            Some(libc::EAGAIN),
            err.os_error()
        );
        let bare = SpawnError::HandlePoolExhausted.os_error();
        crate::assert_with_log!(bare.is_none(), "no errno", None::<i32>, bare);
        crate::test_complete!("os_error_is_exposed");
    }
}
