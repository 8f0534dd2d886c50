//! Contract of the single-threaded I/O readiness notifier.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// The descriptor has data to read (or hit EOF/error).
    Readable,
    /// The descriptor can accept more output.
    Writable,
}

/// Handle of one outstanding readiness registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Registration(pub u64);

/// A one-shot readiness notifier.
///
/// Every registration fires at most once: it is reported by exactly one
/// [`Notifier::wait`] call, or never if it is cancelled first.
pub trait Notifier {
    /// Watch `fd` for `interest`.
    fn register_once(&mut self, fd: RawFd, interest: Interest) -> io::Result<Registration>;

    /// Forget a registration that has not fired yet. Unknown or already
    /// fired registrations are ignored.
    fn cancel(&mut self, registration: Registration);

    /// Wait up to `timeout` (forever with `None`) and return every
    /// registration that became ready.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Registration>>;
}
