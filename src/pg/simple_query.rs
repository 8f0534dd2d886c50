//! Simple query response state machine.
//!
//! Turns the server's response to one Query message into [`RawResult`]s,
//! one per statement, in order.

use crate::client::{RawResult, ResultStatus};
use crate::error::{Error, Result};
use crate::protocol::backend::{
    CommandComplete, DataRow, ErrorResponse, RawMessage, ReadyForQuery, RowDescription, msg_type,
};
use crate::protocol::frontend::write_copy_fail;
use crate::protocol::types::TransactionStatus;

/// Progress reported by [`SimpleQueryStateMachine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryProgress {
    /// More messages belong to this query.
    Continue,
    /// ReadyForQuery arrived; the response is complete.
    Ready(TransactionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingResponse,
    ProcessingRows,
    CopyOut,
    CopyIn,
    Finished,
}

/// Simple query protocol state machine.
pub struct SimpleQueryStateMachine {
    state: State,
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    results: Vec<RawResult>,
}

impl SimpleQueryStateMachine {
    pub fn new() -> Self {
        Self {
            state: State::WaitingResponse,
            columns: Vec::new(),
            rows: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Results completed so far, in statement order.
    pub fn take_results(&mut self) -> Vec<RawResult> {
        std::mem::take(&mut self.results)
    }

    /// Process one server message, appending any reply to `out`.
    ///
    /// Errors reported by the server become failed results rather than
    /// errors; only malformed or unexpected messages fail the step.
    pub fn step(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<QueryProgress> {
        let payload = msg.payload;

        match (self.state, msg.type_byte) {
            (State::Finished, other) => Err(Error::Protocol(format!(
                "Message '{}' after ReadyForQuery",
                other as char
            ))),
            (_, msg_type::ERROR_RESPONSE) => {
                let error = ErrorResponse::parse(payload)?;
                // A statement that fails mid-rows produces only the error.
                self.columns.clear();
                self.rows.clear();
                self.results.push(RawResult::failed(
                    ResultStatus::FatalError,
                    error.fields.to_string(),
                ));
                self.state = State::WaitingResponse;
                Ok(QueryProgress::Continue)
            }
            (_, msg_type::READY_FOR_QUERY) => {
                let status = ReadyForQuery::parse(payload)?
                    .transaction_status()
                    .unwrap_or_default();
                self.state = State::Finished;
                Ok(QueryProgress::Ready(status))
            }
            (State::WaitingResponse, msg_type::ROW_DESCRIPTION) => {
                let description = RowDescription::parse(payload)?;
                self.columns = description.names().iter().map(|s| s.to_string()).collect();
                self.rows.clear();
                self.state = State::ProcessingRows;
                Ok(QueryProgress::Continue)
            }
            (State::ProcessingRows, msg_type::DATA_ROW) => {
                let row = DataRow::parse(payload)?;
                if row.len() != self.columns.len() {
                    return Err(Error::Protocol(format!(
                        "DataRow has {} columns, expected {}",
                        row.len(),
                        self.columns.len()
                    )));
                }
                self.rows.push(row.to_text()?);
                Ok(QueryProgress::Continue)
            }
            (State::ProcessingRows, msg_type::COMMAND_COMPLETE) => {
                let complete = CommandComplete::parse(payload)?;
                self.results.push(RawResult::tuples(
                    std::mem::take(&mut self.columns),
                    std::mem::take(&mut self.rows),
                    complete.tag,
                ));
                self.state = State::WaitingResponse;
                Ok(QueryProgress::Continue)
            }
            (State::WaitingResponse | State::CopyOut, msg_type::COMMAND_COMPLETE) => {
                let complete = CommandComplete::parse(payload)?;
                self.results.push(RawResult::command(complete.tag));
                self.state = State::WaitingResponse;
                Ok(QueryProgress::Continue)
            }
            (State::WaitingResponse, msg_type::EMPTY_QUERY_RESPONSE) => {
                self.results
                    .push(RawResult::failed(ResultStatus::EmptyQuery, "empty query"));
                Ok(QueryProgress::Continue)
            }
            (State::WaitingResponse, msg_type::COPY_OUT_RESPONSE) => {
                tracing::debug!("discarding COPY TO STDOUT data");
                self.state = State::CopyOut;
                Ok(QueryProgress::Continue)
            }
            (State::CopyOut, msg_type::COPY_DATA | msg_type::COPY_DONE) => {
                Ok(QueryProgress::Continue)
            }
            (State::WaitingResponse, msg_type::COPY_IN_RESPONSE) => {
                write_copy_fail(out, "COPY FROM STDIN is not supported");
                self.state = State::CopyIn;
                Ok(QueryProgress::Continue)
            }
            (state, other) => Err(Error::Protocol(format!(
                "Unexpected message '{}' in query state {:?}",
                other as char, state
            ))),
        }
    }
}

impl Default for SimpleQueryStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
