//! Action types for state machine I/O requests.

use std::os::fd::RawFd;

use crate::notifier::Interest;

/// Action requested by a state machine.
///
/// The caller should arrange for the requested readiness and then call the
/// machine's `step()` method again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Register one readiness notification for `interest` on `fd`, and step
    /// again when it fires.
    Wait {
        /// Socket descriptor of the connection
        fd: RawFd,
        /// Readiness to wait for
        interest: Interest,
    },

    /// The state machine has finished successfully.
    Finished,
}
