//! Query state machine.
//!
//! Sends one query text, waits until every byte is on the wire, then reads
//! until the client reports no further input is needed. Output produced
//! while reading is flushed before the next read. All statements in
//! the text are collected, in order, into a [`QueryOutcome`].

use std::time::{Duration, Instant};

use crate::client::Connection;
use crate::error::{Error, Result};
use crate::notifier::Interest;
use crate::result::{QueryOutcome, ResultSet};

use super::action::Action;
use super::wait_on;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Flushing,
    Reading,
    Finished,
}

/// Query execution state machine.
pub struct QueryStateMachine {
    state: State,
    started: Option<Instant>,
    elapsed: Duration,
}

impl QueryStateMachine {
    pub fn new() -> Self {
        Self {
            state: State::Initial,
            started: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Send `sql` and return the first readiness to wait for.
    ///
    /// A connection that is no longer healthy fails with
    /// [`Error::ConnectionLost`]. A query the client refuses to accept fails
    /// with [`Error::Send`] and leaves the connection untouched.
    pub fn start<C: Connection>(&mut self, conn: &mut C, sql: &str) -> Result<Action> {
        if self.state != State::Initial {
            return Err(Error::Protocol(format!(
                "query started in state {:?}",
                self.state
            )));
        }
        if !conn.is_healthy() {
            return Err(Error::ConnectionLost);
        }

        conn.send_query(sql).map_err(|e| match e {
            Error::Send(message) => Error::Send(message),
            other => Error::Send(other.to_string()),
        })?;
        self.started = Some(Instant::now());
        self.flush(conn)
    }

    /// Continue after the requested readiness fired.
    pub fn step<C: Connection>(&mut self, conn: &mut C) -> Result<Action> {
        match self.state {
            State::Flushing => self.flush(conn),
            State::Reading => {
                conn.consume_input()?;
                if conn.is_busy() {
                    // Input may have produced a reply the server waits for.
                    return self.flush(conn);
                }
                self.elapsed = self.started.map(|t| t.elapsed()).unwrap_or_default();
                self.state = State::Finished;
                Ok(Action::Finished)
            }
            State::Initial | State::Finished => Err(Error::Protocol(format!(
                "query step in state {:?}",
                self.state
            ))),
        }
    }

    fn flush<C: Connection>(&mut self, conn: &mut C) -> Result<Action> {
        if conn.flush()? {
            self.state = State::Reading;
            wait_on(conn, Interest::Readable)
        } else {
            self.state = State::Flushing;
            wait_on(conn, Interest::Writable)
        }
    }

    /// Drain the connection's results into an outcome.
    ///
    /// Call once [`step`](Self::step) returned `Action::Finished`.
    pub fn finish<C: Connection>(self, conn: &mut C) -> QueryOutcome {
        QueryOutcome {
            result_sets: collect_results(conn),
            elapsed: self.elapsed,
        }
    }
}

impl Default for QueryStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every pending result from the client, in order.
pub fn collect_results<C: Connection>(conn: &mut C) -> Vec<ResultSet> {
    std::iter::from_fn(|| conn.next_result())
        .map(ResultSet::from)
        .collect()
}
