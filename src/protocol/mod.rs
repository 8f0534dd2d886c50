//! PostgreSQL wire protocol encoding and decoding.
//!
//! Only the pieces the non-blocking client needs: startup and
//! authentication, the simple query protocol, and termination.
//!
//! - `backend`: Server → Client messages (parsing)
//! - `frontend`: Client → Server messages (encoding)
//! - `codec`: Low-level encoding/decoding primitives and framing
//! - `types`: Common protocol types

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;

pub use backend::RawMessage;
pub use types::TransactionStatus;
