//! Sans-I/O state machines driving a connection handle.
//!
//! These state machines decide what the connection needs next without
//! waiting on anything. They produce `Action` values that tell the registry
//! which readiness to wait for before stepping them again.

pub mod action;
pub mod connect;
pub mod query;

pub use action::Action;
pub use connect::ConnectStateMachine;
pub use query::QueryStateMachine;

use std::io;
use std::os::fd::RawFd;

use crate::client::Connection;
use crate::error::{Error, Result};
use crate::notifier::Interest;

/// Build a wait action on the connection's socket.
///
/// A connection without a socket cannot be waited on, which ends the
/// operation.
fn wait_on<C: Connection>(conn: &C, interest: Interest) -> Result<Action> {
    let fd: RawFd = conn.socket().ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "connection has no socket descriptor",
        ))
    })?;
    Ok(Action::Wait { fd, interest })
}
