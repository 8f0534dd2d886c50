//! Connect state machine.

use crate::client::{Connection, ConnectionMetadata, PollingStatus};
use crate::error::{Error, Result};
use crate::notifier::Interest;

use super::action::Action;
use super::wait_on;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Polling,
    Connected,
    Failed,
}

/// Drives a connection handle from "connect started" to "connected".
///
/// Each [`step`](Self::step) polls the handle once and translates the
/// polling status into an [`Action`]. Readiness waits always target the
/// handle's current socket, since it may change between polls.
pub struct ConnectStateMachine {
    state: State,
    metadata: Option<ConnectionMetadata>,
    polls: u32,
}

impl ConnectStateMachine {
    pub fn new() -> Self {
        Self {
            state: State::Polling,
            metadata: None,
            polls: 0,
        }
    }

    /// Poll the connection once.
    ///
    /// Returns `Action::Wait` while the handshake needs the socket,
    /// `Action::Finished` once connected, or an error when the attempt failed.
    /// A connected machine keeps reporting `Action::Finished` without
    /// polling again. A failed machine must not be stepped again.
    pub fn step<C: Connection>(&mut self, conn: &mut C) -> Result<Action> {
        match self.state {
            State::Polling => {}
            State::Connected => return Ok(Action::Finished),
            State::Failed => {
                return Err(Error::Protocol("connect step after failure".into()));
            }
        }

        self.polls += 1;
        let status = conn.poll_connect();
        tracing::trace!(poll = self.polls, ?status, "connect poll");

        let result = match status {
            PollingStatus::Reading => wait_on(conn, Interest::Readable),
            PollingStatus::Writing => wait_on(conn, Interest::Writable),
            PollingStatus::Ok => conn.set_nonblocking().map(|()| {
                self.metadata = Some(conn.metadata());
                self.state = State::Connected;
                Action::Finished
            }),
            PollingStatus::Failed => Err(Error::Connect(conn.error_message())),
        };

        if result.is_err() {
            self.state = State::Failed;
        }
        result
    }

    /// Take the captured metadata out of the machine.
    pub fn take_metadata(&mut self) -> Option<ConnectionMetadata> {
        self.metadata.take()
    }
}

impl Default for ConnectStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
