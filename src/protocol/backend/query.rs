//! Simple-query response messages, decoded as text.

use zerocopy::byteorder::big_endian::U16 as U16BE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::read_cstr;

/// Size of the fixed tail following each field name in a RowDescription.
const FIELD_TAIL_LEN: usize = 18;

/// Column count header shared by RowDescription and DataRow.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct CountHead {
    count: U16BE,
}

fn read_count<'a>(payload: &'a [u8], what: &str) -> Result<(usize, &'a [u8])> {
    let (head, rest) = payload
        .split_at_checked(2)
        .ok_or_else(|| Error::Protocol(format!("{what}: payload too short")))?;
    Ok((CountHead::ref_from_bytes(head)?.count.get() as usize, rest))
}

/// RowDescription message - the column names of a result set.
///
/// Type metadata is skipped: every value reaches the caller as text.
#[derive(Debug)]
pub struct RowDescription<'a> {
    names: Vec<&'a str>,
}

impl<'a> RowDescription<'a> {
    /// Parse a RowDescription message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_fields, mut data) = read_count(payload, "RowDescription")?;
        let mut names = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            data = rest.get(FIELD_TAIL_LEN..).ok_or_else(|| {
                Error::Protocol(format!("FieldDescription for {name:?} truncated"))
            })?;
            names.push(name);
        }

        Ok(Self { names })
    }

    /// Column names in order; duplicates are preserved.
    pub fn names(&self) -> &[&'a str] {
        &self.names
    }
}

/// DataRow message - contains a single row of data.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    num_columns: usize,
    columns_data: &'a [u8],
}

impl<'a> DataRow<'a> {
    /// Parse a DataRow message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_columns, columns_data) = read_count(payload, "DataRow")?;
        Ok(Self {
            num_columns,
            columns_data,
        })
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.num_columns
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.num_columns == 0
    }

    /// Decode every column as text. `None` represents NULL.
    ///
    /// Values that are not valid UTF-8 are decoded lossily.
    pub fn to_text(&self) -> Result<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(self.num_columns);
        let mut remaining = self.columns_data;

        for index in 0..self.num_columns {
            let (len, rest) = remaining
                .split_at_checked(4)
                .ok_or_else(|| Error::Protocol(format!("DataRow column {index} truncated")))?;
            let len = i32::from_be_bytes([len[0], len[1], len[2], len[3]]);

            if len < 0 {
                values.push(None);
                remaining = rest;
                continue;
            }

            let (value, rest) = rest
                .split_at_checked(len as usize)
                .ok_or_else(|| Error::Protocol(format!("DataRow column {index} truncated")))?;
            let text = match simdutf8::basic::from_utf8(value) {
                Ok(s) => s.to_string(),
                Err(_) => String::from_utf8_lossy(value).into_owned(),
            };
            values.push(Some(text));
            remaining = rest;
        }

        Ok(values)
    }
}

/// CommandComplete message - indicates successful completion of a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag (e.g., "SELECT 5", "INSERT 0 1", "UPDATE 10")
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    /// Parse a CommandComplete message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self { tag })
    }
}
