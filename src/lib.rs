//! Non-blocking PostgreSQL sessions for interactive editors.
//!
//! Each document (any hashable identity) owns at most one connection. The
//! [`Registry`] connects, queues queries in FIFO order, collects every result
//! set a query text produces, and tears connections down, all without ever
//! blocking the caller's thread.
//!
//! # Features
//!
//! - **Sans-I/O state machines**: connect and query logic is separated from
//!   I/O and returns [`state::Action`]s naming the readiness to wait for
//! - **One operation per connection**: a query sent while the connection is
//!   connecting or busy is queued, never interleaved
//! - **Pluggable collaborators**: the [`client::Driver`] and
//!   [`notifier::Notifier`] traits, implemented by [`PgDriver`] and
//!   [`MioNotifier`]
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//!
//! use pgmode::{MioNotifier, PgDriver, Registry};
//!
//! fn main() -> pgmode::Result<()> {
//!     let targets = HashMap::from([("notes.sql", "postgres://alice@localhost/notes".to_string())]);
//!     let mut registry = Registry::new(PgDriver, MioNotifier::new()?, targets);
//!
//!     registry.ensure_connected(&"notes.sql", |result| {
//!         if let Err(e) = result {
//!             eprintln!("connect failed: {}", e);
//!         }
//!     });
//!     registry.send_query(&"notes.sql", "SELECT 1 AS num; SELECT 2", |result| {
//!         if let Ok(outcome) = result {
//!             println!("{:?} in {:?}", outcome.result_sets, outcome.elapsed);
//!         }
//!     });
//!
//!     while !registry.is_idle() {
//!         registry.turn(None)?;
//!     }
//!     registry.disconnect_all();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod notifier;
pub mod opts;
pub mod pg;
pub mod protocol;
pub mod reactor;
pub mod registry;
pub mod result;
pub mod state;

pub use client::{Connection, ConnectionMetadata, Driver, PollingStatus};
pub use error::{Error, ErrorFields, Result};
pub use notifier::{Interest, Notifier, Registration};
pub use opts::{AbandonPolicy, Opts, RegistryOpts, SslMode};
pub use pg::{PgConnection, PgDriver};
pub use reactor::MioNotifier;
pub use registry::{Phase, Registry, ResolveTarget, Status};
pub use result::{QueryOutcome, ResultSet};
