//! PostgreSQL wire protocol driver.
//!
//! - `protocol`: message encoding and decoding (text format only)
//! - `scram`: SCRAM-SHA-256 authentication
//! - `statement`: per-session prepared statement cache
//! - `transport`: the TCP session behind [`crate::transport::Transport`]

pub mod protocol;
pub mod scram;
pub mod statement;
mod transport;


pub use protocol::TransactionStatus;
pub use transport::{PgConnector, PgTransport};
