//! Transactions.
//!
//! A [`Transaction`] borrows its [`Connection`] mutably for its whole life,
//! so nothing else can use the connection while it is open. Subtransactions
//! borrow the parent transaction the same way, which suspends the parent
//! until the subtransaction is gone.
//!
//! ```text
//! NotStarted --begin--> InProgress --commit--> Committed
//!                           |
//!                           +--abort / error / drop--> Aborted
//! ```
//!
//! `BEGIN` is deferred: it is queued without a round trip and its response
//! is read together with the first statement's. A failed `BEGIN` surfaces
//! on that first statement.
//!
//! A robust transaction records its server transaction id when it begins.
//! If the connection is lost during `COMMIT` it asks a fresh session for
//! that id's status before giving up with [`ErrorKind::InDoubt`].

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::connection::Connection;
use crate::convert::{quote_ident, ToText};
use crate::error::{Error, ErrorKind, Result};
use crate::result::QueryResult;

/// Isolation level requested at `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl AccessMode {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadWrite => "READ WRITE",
            Self::ReadOnly => "READ ONLY",
        }
    }
}

/// Settings fixed when a transaction begins.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub access_mode: AccessMode,
    /// Shown in error messages and logs.
    pub name: Option<String>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    pub fn access_mode(mut self, mode: AccessMode) -> Self {
        self.access_mode = mode;
        self
    }

    pub fn read_only(self) -> Self {
        self.access_mode(AccessMode::ReadOnly)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn begin_statement(&self) -> String {
        format!(
            "BEGIN ISOLATION LEVEL {} {}",
            self.isolation.as_sql(),
            self.access_mode.as_sql()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    NotStarted,
    InProgress,
    Committed,
    Aborted,
}

/// Status checks made before a robust commit is reported in doubt.
const RESOLVE_ATTEMPTS: u32 = 5;
const RESOLVE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Kind {
    /// `BEGIN` … `COMMIT` block.
    Db { robust: bool },
    /// Autocommit; every statement stands alone.
    Nontransaction,
    Sub { savepoint: String },
}

/// A unit of work on a connection.
pub struct Transaction<'c> {
    conn: &'c mut Connection,
    kind: Kind,
    options: TransactionOptions,
    state: TxState,
    depth: usize,
    /// Server transaction id, recorded by robust transactions.
    xid: Option<i64>,
}

impl Connection {
    /// Create a transaction without beginning it.
    pub fn transaction(&mut self, options: TransactionOptions) -> Result<Transaction<'_>> {
        Transaction::new(self, Kind::Db { robust: false }, options)
    }

    /// Begin a read-committed, read-write transaction.
    pub async fn begin(&mut self) -> Result<Transaction<'_>> {
        self.begin_with(TransactionOptions::default()).await
    }

    pub async fn begin_with(&mut self, options: TransactionOptions) -> Result<Transaction<'_>> {
        let mut tx = self.transaction(options)?;
        tx.begin().await?;
        Ok(tx)
    }

    /// Begin a transaction that resolves a lost `COMMIT` by asking the server.
    ///
    /// Costs one extra round trip at begin. Needs a server with
    /// `txid_status` (PostgreSQL 10 or later).
    pub async fn begin_robust(&mut self, options: TransactionOptions) -> Result<Transaction<'_>> {
        let mut tx = Transaction::new(self, Kind::Db { robust: true }, options)?;
        tx.begin().await?;
        Ok(tx)
    }

    /// Open an autocommit pseudo-transaction.
    ///
    /// Statements take effect immediately; `commit` and `abort` only end the
    /// object. A lost connection may be reactivated between statements.
    pub async fn nontransaction(&mut self) -> Result<Transaction<'_>> {
        let mut tx = Transaction::new(self, Kind::Nontransaction, TransactionOptions::default())?;
        tx.begin().await?;
        Ok(tx)
    }
}

impl<'c> Transaction<'c> {
    fn new(conn: &'c mut Connection, kind: Kind, options: TransactionOptions) -> Result<Self> {
        let description = describe(&kind, &options);
        conn.register_focus(&description)?;
        Ok(Self {
            conn,
            kind,
            options,
            state: TxState::NotStarted,
            depth: 0,
            xid: None,
        })
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// 0 for a top-level transaction, parent depth + 1 for a subtransaction.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_subtransaction(&self) -> bool {
        matches!(self.kind, Kind::Sub { .. })
    }

    /// True for the autocommit pseudo-transaction.
    pub fn is_nontransaction(&self) -> bool {
        matches!(self.kind, Kind::Nontransaction)
    }

    pub fn is_robust(&self) -> bool {
        matches!(self.kind, Kind::Db { robust: true })
    }

    /// Server transaction id, known once a robust transaction has begun.
    pub fn transaction_id(&self) -> Option<i64> {
        self.xid
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        self.conn
    }

    /// Start the transaction; fails with a usage error unless not yet started.
    pub async fn begin(&mut self) -> Result<()> {
        if self.state != TxState::NotStarted {
            return Err(Error::usage(format!(
                "cannot begin {}: it is {}",
                self,
                state_word(self.state)
            )));
        }
        match &self.kind {
            Kind::Nontransaction => {
                self.conn.ensure_active(true).await?;
            }
            Kind::Db { robust } => {
                let robust = *robust;
                self.conn.ensure_active(true).await?;
                let begin = self.options.begin_statement();
                self.conn.defer_check(&begin)?;
                if robust {
                    self.state = TxState::InProgress;
                    let reply = match self.conn.execute("SELECT txid_current()", &[], false).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            self.fail();
                            return Err(e);
                        }
                    };
                    self.xid = Some(reply.row(0)?.get::<i64>(0)?);
                }
            }
            Kind::Sub { savepoint } => {
                let statement = format!("SAVEPOINT {}", quote_ident(savepoint));
                self.conn.defer_check(&statement)?;
            }
        }
        self.state = TxState::InProgress;
        tracing::debug!(target: "pgcore::transaction", transaction = %self, "begin");
        Ok(())
    }

    /// Open a subtransaction; `self` is suspended until it is dropped.
    pub async fn subtransaction(&mut self) -> Result<Transaction<'_>> {
        self.ensure_in_progress("open a subtransaction")?;
        if matches!(self.kind, Kind::Nontransaction) {
            return Err(Error::usage("a nontransaction cannot have subtransactions"));
        }
        let savepoint = self.conn.unique_name("pgcore_sp");
        let mut sub = Transaction {
            conn: &mut *self.conn,
            kind: Kind::Sub { savepoint },
            options: self.options.clone(),
            state: TxState::NotStarted,
            depth: self.depth + 1,
            xid: None,
        };
        sub.begin().await?;
        Ok(sub)
    }

    /// Execute a statement, binding `params` as `$1`, `$2`, ….
    pub async fn exec(&mut self, sql: &str, params: &[&(dyn ToText + Sync)]) -> Result<QueryResult> {
        let params: Vec<Option<String>> = params.iter().map(|p| p.to_text()).collect();
        self.exec_raw(sql, &params).await
    }

    /// Execute a statement with parameters already rendered as text.
    pub async fn exec_raw(&mut self, sql: &str, params: &[Option<String>]) -> Result<QueryResult> {
        self.ensure_in_progress("execute a statement")?;
        let may_reactivate = matches!(self.kind, Kind::Nontransaction);
        match self.conn.execute(sql, params, may_reactivate).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Run a `COPY … FROM STDIN` with its text-format data.
    pub(crate) async fn exec_copy(&mut self, statement: &str, data: &[Bytes]) -> Result<QueryResult> {
        self.ensure_in_progress("copy into a table")?;
        match self.conn.execute_copy(statement, data).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Execute a statement prepared with [`Connection::prepare`].
    pub async fn exec_prepared(&mut self, name: &str, params: &[&(dyn ToText + Sync)]) -> Result<QueryResult> {
        self.ensure_in_progress("execute a prepared statement")?;
        let params: Vec<Option<String>> = params.iter().map(|p| p.to_text()).collect();
        let sql = self.conn.prepared_invocation(name, &params)?;
        self.exec_raw(&sql, &[]).await
    }

    /// Make the transaction's work permanent.
    ///
    /// If the connection is lost after `COMMIT` may have reached the server
    /// the outcome is unknown and an [`ErrorKind::InDoubt`] error is
    /// returned.
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_in_progress("commit")?;
        match &self.kind {
            Kind::Nontransaction => {
                self.state = TxState::Committed;
                Ok(())
            }
            Kind::Sub { savepoint } => {
                let statement = format!("RELEASE SAVEPOINT {}", quote_ident(savepoint));
                match self.conn.execute(&statement, &[], false).await {
                    Ok(_) => {
                        self.state = TxState::Committed;
                        Ok(())
                    }
                    Err(e) => {
                        self.fail();
                        Err(e)
                    }
                }
            }
            Kind::Db { .. } => self.commit_top().await,
        }
    }

    async fn commit_top(&mut self) -> Result<()> {
        if !self.conn.is_open() {
            self.state = TxState::Aborted;
            return Err(Error::broken(format!(
                "connection lost before {} could commit",
                self
            )));
        }

        // A COMMIT that could not even be queued never left the client.
        if let Err(e) = self.conn.queue("COMMIT", &[]) {
            self.state = TxState::Aborted;
            return Err(Error::broken(format!(
                "connection lost before {} could commit ({})",
                self,
                e.message()
            ))
            .with_query("COMMIT"));
        }

        // From here on a transport failure leaves the outcome unknown.
        if let Err(e) = self.conn.flush().await {
            return self.doubt(e).await;
        }
        let earlier = self.conn.drain_backlog().await;
        if let Err(e) = &earlier {
            if e.is_broken_connection() {
                return self.doubt(e.clone()).await;
            }
        }
        let reply = match self.conn.receive("COMMIT").await {
            Ok(reply) => reply,
            Err(e) if e.is_broken_connection() => return self.doubt(e).await,
            Err(e) => {
                self.state = TxState::Aborted;
                return Err(e);
            }
        };
        if let Err(e) = earlier {
            self.state = TxState::Aborted;
            return Err(e);
        }
        if reply.command_tag() == "ROLLBACK" {
            self.state = TxState::Aborted;
            return Err(Error::new(
                ErrorKind::TransactionRollback,
                format!("{} was rolled back by the server on commit", self),
            )
            .with_query("COMMIT"));
        }
        self.state = TxState::Committed;
        tracing::debug!(target: "pgcore::transaction", transaction = %self, "committed");
        Ok(())
    }

    /// The commit may or may not have happened.
    async fn doubt(&mut self, cause: Error) -> Result<()> {
        let error = self.in_doubt(cause);
        match self.xid {
            Some(xid) if self.is_robust() => self.resolve(xid, error).await,
            _ => Err(error),
        }
    }

    /// Ask a fresh session what became of server transaction `xid`.
    async fn resolve(&mut self, xid: i64, doubt: Error) -> Result<()> {
        let params = [Some(xid.to_string())];
        for attempt in 1..=RESOLVE_ATTEMPTS {
            let status = match self.conn.side_query("SELECT txid_status($1)", &params).await {
                Ok(reply) => reply.row(0).and_then(|row| row.get::<Option<String>>(0)),
                Err(e) => Err(e),
            };
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(target: "pgcore::transaction", transaction = %self, xid, error = %e, "could not check commit status");
                    return Err(doubt);
                }
            };
            match status.as_deref() {
                Some("committed") => {
                    self.state = TxState::Committed;
                    tracing::info!(target: "pgcore::transaction", transaction = %self, xid, "commit confirmed after connection loss");
                    return Ok(());
                }
                Some("aborted") => {
                    self.state = TxState::Aborted;
                    return Err(Error::new(
                        ErrorKind::TransactionRollback,
                        format!("{} was rolled back; the connection was lost during commit", self),
                    )
                    .with_query("COMMIT"));
                }
                Some("in progress") => {
                    tracing::debug!(target: "pgcore::transaction", xid, attempt, "commit still in progress");
                    tokio::time::sleep(RESOLVE_BACKOFF * attempt).await;
                }
                // Too old to know, or an answer this client does not understand.
                _ => return Err(doubt),
            }
        }
        Err(doubt)
    }

    fn in_doubt(&mut self, cause: Error) -> Error {
        self.state = TxState::Aborted;
        tracing::error!(target: "pgcore::transaction", transaction = %self, error = %cause, "connection lost during commit; outcome unknown");
        Error::in_doubt(format!(
            "connection lost while committing {}; the outcome is unknown ({})",
            self,
            cause.message()
        ))
        .with_query("COMMIT")
    }

    /// Roll back the transaction's work. Aborting twice is a no-op.
    pub async fn abort(&mut self) -> Result<()> {
        match self.state {
            TxState::Aborted => return Ok(()),
            TxState::Committed => {
                return Err(Error::usage(format!("cannot abort {}: it is committed", self)))
            }
            TxState::NotStarted => {
                self.state = TxState::Aborted;
                return Ok(());
            }
            TxState::InProgress => {}
        }
        self.state = TxState::Aborted;
        let statement = match &self.kind {
            Kind::Nontransaction => return Ok(()),
            Kind::Db { .. } => "ROLLBACK".to_string(),
            Kind::Sub { savepoint } => format!("ROLLBACK TO SAVEPOINT {}", quote_ident(savepoint)),
        };
        match self.conn.execute(&statement, &[], false).await {
            Ok(_) => Ok(()),
            // The server discards the transaction along with the session.
            Err(e) if e.is_broken_connection() => {
                tracing::warn!(target: "pgcore::transaction", transaction = %self, "connection lost while aborting");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Mark the transaction failed and queue its rollback.
    pub(crate) fn fail(&mut self) {
        // Autocommit statements fail alone.
        if self.state != TxState::InProgress || matches!(self.kind, Kind::Nontransaction) {
            return;
        }
        self.state = TxState::Aborted;
        self.queue_rollback();
    }

    fn queue_rollback(&mut self) {
        match &self.kind {
            Kind::Nontransaction => {}
            Kind::Db { .. } => self.conn.defer_discard("ROLLBACK"),
            Kind::Sub { savepoint } => {
                let statement = format!("ROLLBACK TO SAVEPOINT {}", quote_ident(savepoint));
                self.conn.defer_discard(&statement);
            }
        }
    }

    pub(crate) fn ensure_in_progress(&self, action: &str) -> Result<()> {
        if self.state == TxState::InProgress {
            return Ok(());
        }
        Err(Error::usage(format!(
            "cannot {} in {}: it is {}",
            action,
            self,
            state_word(self.state)
        )))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::InProgress {
            if !matches!(self.kind, Kind::Nontransaction) {
                tracing::debug!(target: "pgcore::transaction", transaction = %self, "implicit abort");
            }
            self.state = TxState::Aborted;
            self.queue_rollback();
        }
        if !matches!(self.kind, Kind::Sub { .. }) {
            self.conn.unregister_focus();
        }
    }
}

impl fmt::Display for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&describe(&self.kind, &self.options))
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("isolation", &self.options.isolation)
            .field("access_mode", &self.options.access_mode)
            .field("depth", &self.depth)
            .finish()
    }
}

fn describe(kind: &Kind, options: &TransactionOptions) -> String {
    let label = match kind {
        Kind::Db { robust: false } => "transaction",
        Kind::Db { robust: true } => "robust transaction",
        Kind::Nontransaction => "nontransaction",
        Kind::Sub { .. } => "subtransaction",
    };
    match &options.name {
        Some(name) => format!("{} '{}'", label, name),
        None => label.to_string(),
    }
}

fn state_word(state: TxState) -> &'static str {
    match state {
        TxState::NotStarted => "not started",
        TxState::InProgress => "in progress",
        TxState::Committed => "committed",
        TxState::Aborted => "aborted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockServer;
    use crate::transport::Envelope;

    async fn count(conn: &mut Connection) -> i64 {
        let r = conn.perform("SELECT count(*) FROM t", &[]).await.unwrap();
        r.row(0).unwrap().get::<i64>(0).unwrap()
    }

    #[tokio::test]
    async fn test_commit_persists() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO t VALUES ($1)", &[&"a"]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TxState::Committed);
        drop(tx);

        assert_eq!(server.table(), vec!["a"]);
        assert_eq!(
            server.statements(),
            vec![
                "BEGIN ISOLATION LEVEL READ COMMITTED READ WRITE",
                "INSERT INTO t VALUES ($1)",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        {
            let mut tx = conn.begin().await.unwrap();
            tx.exec("INSERT INTO t VALUES ($1)", &[&"lost"]).await.unwrap();
        }
        assert_eq!(conn.open_transaction(), None);

        let mut tx = conn.begin().await.unwrap();
        let r = tx.exec("SELECT count(*) FROM t", &[]).await.unwrap();
        assert_eq!(r.row(0).unwrap().get::<i64>(0).unwrap(), 0);
        tx.commit().await.unwrap();
        drop(tx);

        assert!(server.table().is_empty());
        assert!(server.statements().contains(&"ROLLBACK".to_string()));
    }

    #[tokio::test]
    async fn test_second_open_transaction_is_usage_error() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        std::mem::forget(conn.begin().await.unwrap());
        assert_eq!(conn.open_transaction(), Some("transaction"));

        let err = conn.begin().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = conn.nontransaction().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_lifecycle_misuse() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.transaction(TransactionOptions::new().name("batch")).unwrap();
        assert_eq!(tx.state(), TxState::NotStarted);
        let err = tx.exec("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.message().contains("transaction 'batch'"));

        tx.begin().await.unwrap();
        assert_eq!(tx.begin().await.unwrap_err().kind(), ErrorKind::Usage);
        tx.commit().await.unwrap();
        assert_eq!(tx.commit().await.unwrap_err().kind(), ErrorKind::Usage);
        assert_eq!(tx.abort().await.unwrap_err().kind(), ErrorKind::Usage);
        drop(tx);

        // No statement beyond the transaction itself reached the server
        assert_eq!(server.statements().len(), 2);
    }

    #[tokio::test]
    async fn test_options_emit_setup_statement() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let options = TransactionOptions::new()
            .isolation(IsolationLevel::Serializable)
            .read_only();
        let mut tx = conn.begin_with(options).await.unwrap();
        tx.exec("SELECT 1", &[]).await.unwrap();
        tx.commit().await.unwrap();
        drop(tx);
        assert_eq!(
            server.statements()[0],
            "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY"
        );
    }

    #[tokio::test]
    async fn test_statement_error_aborts_transaction() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO t VALUES ($1)", &[&"x"]).await.unwrap();
        let err = tx.exec("FAIL 23505", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UniqueViolation);
        assert_eq!(tx.state(), TxState::Aborted);
        assert_eq!(tx.commit().await.unwrap_err().kind(), ErrorKind::Usage);
        tx.abort().await.unwrap();
        drop(tx);

        assert_eq!(count(&mut conn).await, 0);
        assert!(server.table().is_empty());
    }

    #[tokio::test]
    async fn test_failed_begin_surfaces_on_first_statement() {
        let server = MockServer::new();
        server.fail_next("BEGIN", "25001", 1);
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        let err = tx.exec("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.sqlstate(), Some("25001"));
        assert!(err.query().unwrap().starts_with("BEGIN"));
        assert_eq!(tx.state(), TxState::Aborted);
    }

    #[tokio::test]
    async fn test_commit_rolled_back_by_server() {
        let server = MockServer::new();
        server.inject("COMMIT", Envelope::command("ROLLBACK"), 1);
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("SELECT 1", &[]).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionRollback);
        assert_eq!(tx.state(), TxState::Aborted);
    }

    #[tokio::test]
    async fn test_commit_serialization_failure() {
        let server = MockServer::new();
        server.fail_next("COMMIT", "40001", 1);
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO t VALUES ($1)", &[&1]).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(tx.state(), TxState::Aborted);
    }

    #[tokio::test]
    async fn test_connection_lost_during_commit_is_in_doubt() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO t VALUES ($1)", &[&"maybe"]).await.unwrap();
        server.kill_on("COMMIT");

        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InDoubt);
        assert!(!err.is_broken_connection());
        assert_eq!(tx.state(), TxState::Aborted);
        drop(tx);
        assert!(!conn.is_open());
        // The server did commit; only the answer was lost
        assert_eq!(server.table(), vec!["maybe"]);
    }

    #[tokio::test]
    async fn test_transport_killed_before_commit_is_broken() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO t VALUES ($1)", &[&"x"]).await.unwrap();
        server.kill_sessions();

        // COMMIT never left the client, so the outcome is known
        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenConnection);
        assert_eq!(err.query(), Some("COMMIT"));
        assert_eq!(tx.state(), TxState::Aborted);
        drop(tx);
        assert!(!server.statements().contains(&"COMMIT".to_string()));
        assert!(server.table().is_empty());
    }

    #[tokio::test]
    async fn test_robust_commit_confirmed_after_connection_loss() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin_robust(TransactionOptions::new()).await.unwrap();
        assert!(tx.is_robust());
        assert_eq!(tx.to_string(), "robust transaction");
        let xid = tx.transaction_id().unwrap();
        tx.exec("INSERT INTO t VALUES ($1)", &[&"kept"]).await.unwrap();
        server.kill_on("COMMIT");

        tx.commit().await.unwrap();
        assert_eq!(tx.state(), TxState::Committed);
        drop(tx);
        assert_eq!(server.table(), vec!["kept"]);
        assert!(server
            .statements()
            .contains(&"SELECT txid_status($1)".to_string()));
        // The status check ran on its own session
        assert_eq!(server.connects(), 2);
        assert!(xid > 0);
    }

    #[tokio::test]
    async fn test_robust_commit_reports_rollback() {
        let server = MockServer::new();
        server.inject("COMMIT", Envelope::command("ROLLBACK"), 1);
        let mut conn = server.connect().await;
        let mut tx = conn.begin_robust(TransactionOptions::new()).await.unwrap();
        tx.exec("INSERT INTO t VALUES ($1)", &[&"gone"]).await.unwrap();
        server.kill_on("COMMIT");

        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionRollback);
        assert_eq!(tx.state(), TxState::Aborted);
    }

    #[tokio::test]
    async fn test_robust_commit_stays_in_doubt_without_status() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin_robust(TransactionOptions::new()).await.unwrap();
        tx.exec("SELECT 1", &[]).await.unwrap();
        let unknown = Envelope {
            columns: vec![crate::transport::Column::new("txid_status", 25)],
            rows: vec![smallvec::smallvec![None]],
            command_tag: "SELECT 1".to_string(),
            error: None,
        };
        server.inject("SELECT txid_status", unknown, 1);
        server.kill_on("COMMIT");

        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InDoubt);
    }

    #[tokio::test]
    async fn test_plain_transaction_does_not_ask_for_status() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        assert_eq!(tx.transaction_id(), None);
        tx.exec("SELECT 1", &[]).await.unwrap();
        server.kill_on("COMMIT");
        assert_eq!(tx.commit().await.unwrap_err().kind(), ErrorKind::InDoubt);
        drop(tx);
        assert_eq!(server.connects(), 1);
        assert!(!server.statements().iter().any(|s| s.contains("txid")));
    }

    #[tokio::test]
    async fn test_statements_in_transaction_do_not_reactivate() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("SELECT 1", &[]).await.unwrap();
        server.kill_sessions();
        assert!(tx.exec("SELECT 1", &[]).await.unwrap_err().is_broken_connection());
        assert_eq!(tx.state(), TxState::Aborted);
        assert_eq!(tx.abort().await, Ok(()));
        drop(tx);
        assert_eq!(server.connects(), 1);

        // A fresh transaction may reconnect
        let mut tx = conn.begin().await.unwrap();
        tx.exec("SELECT 1", &[]).await.unwrap();
        assert_eq!(server.connects(), 2);
    }

    #[tokio::test]
    async fn test_nontransaction_autocommits_and_reactivates() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.nontransaction().await.unwrap();
        tx.exec("INSERT INTO t VALUES ($1)", &[&"now"]).await.unwrap();
        assert_eq!(server.table(), vec!["now"]);

        server.kill_sessions();
        assert!(tx.exec("SELECT 1", &[]).await.is_err());
        assert_eq!(tx.state(), TxState::InProgress);
        tx.exec("SELECT 1", &[]).await.unwrap();
        assert_eq!(server.connects(), 2);

        tx.abort().await.unwrap();
        drop(tx);
        assert_eq!(server.table(), vec!["now"]);
        assert!(!server.statements().iter().any(|s| s.starts_with("BEGIN")));
    }

    #[tokio::test]
    async fn test_subtransaction_rollback_keeps_parent_work() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO t VALUES ($1)", &[&"outer"]).await.unwrap();
        {
            let mut sub = tx.subtransaction().await.unwrap();
            assert_eq!(sub.depth(), 1);
            sub.exec("INSERT INTO t VALUES ($1)", &[&"inner"]).await.unwrap();
            let err = sub.exec("FAIL 23503", &[]).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ForeignKeyViolation);
            assert_eq!(sub.state(), TxState::Aborted);
        }
        tx.exec("INSERT INTO t VALUES ($1)", &[&"after"]).await.unwrap();
        tx.commit().await.unwrap();
        drop(tx);

        assert_eq!(server.table(), vec!["outer", "after"]);
    }

    #[tokio::test]
    async fn test_subtransaction_commit_releases_savepoint() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.begin().await.unwrap();
        {
            let mut sub = tx.subtransaction().await.unwrap();
            sub.exec("INSERT INTO t VALUES ($1)", &[&"kept"]).await.unwrap();
            sub.commit().await.unwrap();
        }
        {
            let mut sub = tx.subtransaction().await.unwrap();
            sub.exec("INSERT INTO t VALUES ($1)", &[&"dropped"]).await.unwrap();
        }
        tx.commit().await.unwrap();
        drop(tx);

        assert_eq!(server.table(), vec!["kept"]);
        let statements = server.statements();
        assert!(statements.iter().any(|s| s.starts_with("RELEASE SAVEPOINT")));
        assert!(statements.iter().any(|s| s.starts_with("ROLLBACK TO SAVEPOINT")));
    }

    #[tokio::test]
    async fn test_nontransaction_has_no_subtransactions() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        let mut tx = conn.nontransaction().await.unwrap();
        assert_eq!(
            tx.subtransaction().await.unwrap_err().kind(),
            ErrorKind::Usage
        );
    }

    #[tokio::test]
    async fn test_exec_prepared() {
        let server = MockServer::new();
        let mut conn = server.connect().await;
        conn.prepare("echo", "SELECT $1").await.unwrap();
        let mut tx = conn.begin().await.unwrap();
        let r = tx.exec_prepared("echo", &[&"hi"]).await.unwrap();
        assert_eq!(r.row(0).unwrap().get::<String>(0).unwrap(), "hi");
        let err = tx.exec_prepared("missing", &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSqlStatementName);
    }
}
