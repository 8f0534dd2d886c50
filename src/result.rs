//! Collected query results.

use std::time::Duration;

use crate::client::{RawResult, ResultStatus};

/// The outcome of one statement within an executed query text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultSet {
    /// Rows returned by a statement.
    Tabular {
        /// Column names in order; SQL permits duplicates.
        columns: Vec<String>,
        /// Rows of nullable text values.
        rows: Vec<Vec<Option<String>>>,
        /// Number of rows.
        row_count: usize,
    },
    /// A statement that returned no rows, e.g. `UPDATE 3`.
    Command {
        /// Status text reported by the server.
        status: String,
    },
    /// A failed statement. Earlier and later results are kept alongside it.
    Error {
        /// Error text.
        message: String,
    },
}

impl ResultSet {
    /// Returns true for error entries.
    pub fn is_error(&self) -> bool {
        matches!(self, ResultSet::Error { .. })
    }
}

impl From<RawResult> for ResultSet {
    fn from(raw: RawResult) -> Self {
        match raw.status {
            ResultStatus::TuplesOk => ResultSet::Tabular {
                row_count: raw.rows.len(),
                columns: raw.columns,
                rows: raw.rows,
            },
            ResultStatus::CommandOk => ResultSet::Command {
                status: raw.command_status,
            },
            ResultStatus::EmptyQuery => ResultSet::Error {
                message: raw
                    .error_message
                    .unwrap_or_else(|| "empty query".to_string()),
            },
            ResultStatus::BadResponse | ResultStatus::FatalError => ResultSet::Error {
                message: raw
                    .error_message
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
        }
    }
}

/// Everything one query execution produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    /// Result sets in the order the statements produced them.
    pub result_sets: Vec<ResultSet>,
    /// Time from the accepted send until the last input arrived.
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_tuples() {
        let raw = RawResult::tuples(
            vec!["a".into(), "a".into()],
            vec![vec![Some("1".into()), None]],
            "SELECT 1",
        );
        assert_eq!(
            ResultSet::from(raw),
            ResultSet::Tabular {
                columns: vec!["a".into(), "a".into()],
                rows: vec![vec![Some("1".into()), None]],
                row_count: 1,
            }
        );
    }

    #[test]
    fn classify_failures() {
        let empty = ResultSet::from(RawResult::failed(ResultStatus::EmptyQuery, "empty query"));
        assert!(empty.is_error());

        let fatal = ResultSet::from(RawResult::failed(
            ResultStatus::FatalError,
            "ERROR: division by zero",
        ));
        assert_eq!(
            fatal,
            ResultSet::Error {
                message: "ERROR: division by zero".into()
            }
        );

        let command = ResultSet::from(RawResult::command("CREATE TABLE"));
        assert!(!command.is_error());
    }
}
