//! Contract of the non-blocking wire-protocol client binding.
//!
//! The registry and its state machines only talk to a connection through
//! these traits. [`crate::pg::PgDriver`] implements them over real sockets;
//! tests implement them with scripted fakes.

use std::os::fd::RawFd;

use crate::error::Result;

/// What a connection in progress needs before it can make further progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Wait until the socket is readable, then poll again.
    Reading,
    /// Wait until the socket is writable, then poll again.
    Writing,
    /// The connection is established and ready for queries.
    Ok,
    /// The attempt failed; see [`Connection::error_message`].
    Failed,
}

/// Status of one result produced by a query execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// A statement returned rows (possibly zero of them).
    TuplesOk,
    /// A statement without a row description completed.
    CommandOk,
    /// The query string was empty.
    EmptyQuery,
    /// The server's response could not be understood.
    BadResponse,
    /// The statement failed.
    FatalError,
}

/// One result as reported by the client, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResult {
    /// Outcome status
    pub status: ResultStatus,
    /// Column names, in order (only for `TuplesOk`)
    pub columns: Vec<String>,
    /// Rows of nullable text values (only for `TuplesOk`)
    pub rows: Vec<Vec<Option<String>>>,
    /// Command tag, e.g. `INSERT 0 1`
    pub command_status: String,
    /// Error text for failed results
    pub error_message: Option<String>,
}

impl RawResult {
    /// A result carrying rows.
    pub fn tuples(
        columns: Vec<String>,
        rows: Vec<Vec<Option<String>>>,
        command_status: impl Into<String>,
    ) -> Self {
        Self {
            status: ResultStatus::TuplesOk,
            columns,
            rows,
            command_status: command_status.into(),
            error_message: None,
        }
    }

    /// A completed command without rows.
    pub fn command(command_status: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::CommandOk,
            columns: Vec::new(),
            rows: Vec::new(),
            command_status: command_status.into(),
            error_message: None,
        }
    }

    /// A failed result of the given status.
    pub fn failed(status: ResultStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            command_status: String::new(),
            error_message: Some(message.into()),
        }
    }
}

/// Who and where a connection is talking to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// Authenticated user
    pub user: String,
    /// Host name or socket directory
    pub host: String,
    /// Database name
    pub database: String,
}

/// Factory for non-blocking connections.
pub trait Driver {
    /// Connection handle produced by this driver.
    type Conn: Connection;

    /// Begin connecting to `target` without waiting for the network.
    ///
    /// Errors are immediate failures (unparseable target, unsupported
    /// options, socket creation failure).
    fn start_connect(&mut self, target: &str) -> Result<Self::Conn>;
}

/// A non-blocking connection handle.
///
/// All methods return promptly; anything that would block is reported
/// through [`PollingStatus`], [`Connection::flush`] or [`Connection::is_busy`].
pub trait Connection {
    /// Advance the connect sequence.
    fn poll_connect(&mut self) -> PollingStatus;

    /// Mark the connection non-blocking for subsequent operations.
    fn set_nonblocking(&mut self) -> Result<()>;

    /// Socket descriptor to wait on, if the connection has one.
    fn socket(&self) -> Option<RawFd>;

    /// Whether the link is usable.
    fn is_healthy(&self) -> bool;

    /// Queue a query for sending. Fails synchronously when the client
    /// cannot accept it.
    fn send_query(&mut self, sql: &str) -> Result<()>;

    /// Push buffered output to the socket. Returns `true` once all of it
    /// has been written.
    fn flush(&mut self) -> Result<bool>;

    /// Read whatever input is available without blocking.
    ///
    /// Input can produce output of its own; what is left unsent is picked
    /// up by the next [`flush`](Self::flush).
    fn consume_input(&mut self) -> Result<()>;

    /// Whether the current query still needs more input.
    fn is_busy(&self) -> bool;

    /// Next completed result, or `None` at end of results.
    fn next_result(&mut self) -> Option<RawResult>;

    /// Connection metadata, meaningful once connected.
    fn metadata(&self) -> ConnectionMetadata;

    /// Text of the most recent failure.
    fn error_message(&self) -> String;

    /// Release the connection.
    fn close(self);
}
