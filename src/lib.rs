//! pgcore - transactional PostgreSQL client core.
//!
//! A [`Connection`] owns one server session. Work happens inside a
//! [`Transaction`] borrowed from it; pipelines, cursors and subtransactions
//! borrow the transaction in turn, so the compiler enforces that only one
//! of them is active at a time. [`Transactor`] retries a transaction body on
//! serialization failures and deadlocks.
//!
//! ```ignore
//! let mut conn = Connection::connect("postgresql://app@localhost/shop").await?;
//! let mut tx = conn.begin().await?;
//! tx.exec("INSERT INTO item (name) VALUES ($1)", &[&"lamp"]).await?;
//! tx.commit().await?;
//! ```

pub mod config;
pub mod connection;
pub mod convert;
pub mod copy;
pub mod cursor;
pub mod error;
pub mod errorhandler;
pub mod largeobject;
pub mod pg;
pub mod pipeline;
pub mod result;
pub mod transaction;
pub mod transactor;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ConnectMode, ConnectionConfig};
pub use connection::{Connection, NotificationReceiver, ReactivationGuard};
pub use convert::{quote_ident, quote_literal, FromText, ToText};
pub use copy::{CopyRow, TableReader, TableWriter};
pub use cursor::{CursorOptions, Direction, StatelessCursor, StreamCursor};
pub use error::{Error, ErrorKind, Result};
pub use errorhandler::{ErrorHandler, HandlerToken, QuietErrorHandler};
pub use largeobject::{LargeObject, LargeObjectAccess, OpenMode};
pub use pipeline::{Pipeline, QueryId};
pub use result::{Field, QueryResult, Row};
pub use transaction::{AccessMode, IsolationLevel, Transaction, TransactionOptions, TxState};
pub use transactor::Transactor;
pub use transport::{Notification, ServerInfo};
