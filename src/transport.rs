//! The seam between the core and a lower-level driver.
//!
//! A [`Transport`] moves exactly one statement per [`Transport::send`] and
//! hands back exactly one [`Envelope`] per [`Transport::poll_response`], in
//! the order the statements were sent. The core never looks at the wire
//! encoding; the bundled PostgreSQL driver lives in [`crate::pg`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use smallvec::SmallVec;

use crate::error::{Error, Result};

/// Type OID of a result column.
pub type Oid = u32;

/// One text cell; `None` is SQL NULL.
pub type Cell = Option<Bytes>;

/// A row as delivered by the transport. Rows up to 16 columns stay inline.
pub type RawRow = SmallVec<[Cell; 16]>;

/// Description of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_oid: Oid,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }
}

/// Error condition reported by the server for one statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: "ERROR".to_string(),
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    /// Full text as shown to the user: message plus detail and hint lines.
    pub fn text(&self) -> String {
        let mut text = self.message.clone();
        if let Some(detail) = &self.detail {
            text.push_str("\nDETAIL: ");
            text.push_str(detail);
        }
        if let Some(hint) = &self.hint {
            text.push_str("\nHINT: ");
            text.push_str(hint);
        }
        text
    }

    pub fn into_error(self) -> Error {
        let text = self.text();
        Error::from_sqlstate(&self.code, text)
    }
}

/// Complete response to one statement.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub columns: Vec<Column>,
    pub rows: Vec<RawRow>,
    pub command_tag: String,
    pub error: Option<ServerError>,
}

impl Envelope {
    /// Envelope for a statement that returned no rows.
    pub fn command(tag: impl Into<String>) -> Self {
        Self {
            command_tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: ServerError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Asynchronous notification raised by `NOTIFY` on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    pub backend_pid: i32,
}

/// Out-of-band traffic observed while waiting for responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Notice(String),
    Notification(Notification),
}

/// Session facts captured at connect time.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub backend_pid: i32,
    pub parameters: HashMap<String, String>,
}

impl ServerInfo {
    pub fn server_version(&self) -> Option<&str> {
        self.parameters.get("server_version").map(String::as_str)
    }
}

/// A session with the server, owned exclusively by one connection.
#[async_trait]
pub trait Transport: Send {
    /// Queue one statement; nothing is written until [`Transport::flush`].
    fn send(&mut self, statement: &str, params: &[Option<String>]) -> Result<()>;

    /// Queue a `COPY … FROM STDIN` statement together with its data.
    ///
    /// `data` is the text-format payload, split into chunks of any size.
    /// Answered by one envelope like any other statement.
    fn send_copy(&mut self, statement: &str, data: &[Bytes]) -> Result<()>;

    /// Push every queued statement to the server.
    async fn flush(&mut self) -> Result<()>;

    /// Write as much queued data as the session accepts without waiting.
    ///
    /// Callable from `Drop`; whatever is left goes out with the next flush.
    fn try_flush(&mut self) -> Result<()>;

    /// Wait for the response to the oldest unanswered statement.
    async fn poll_response(&mut self) -> Result<Envelope>;

    /// Idle poll point: collect events arriving within `timeout`.
    ///
    /// Returns at once while responses are still outstanding.
    async fn wait_for_events(&mut self, timeout: Duration) -> Result<()>;

    /// Notices and notifications collected so far.
    fn take_events(&mut self) -> Vec<Event>;

    fn is_connected(&self) -> bool;

    fn server_info(&self) -> ServerInfo;

    async fn close(&mut self) -> Result<()>;
}

/// Factory for fresh sessions, used on connect and on reactivation.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}
