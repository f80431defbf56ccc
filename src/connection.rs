//! Connection to the server.
//!
//! A [`Connection`] owns one [`Transport`] session and is the only path to
//! it. Work is submitted one statement at a time and answered strictly in
//! submission order. Statements queued by implicit cleanup (a dropped
//! transaction, cursor or pipeline) are written out as far as the socket
//! allows at once; their responses sit in a backlog that is drained before
//! the next request's own response is read or the next idle wait begins.
//!
//! A connection that lost its session may reconnect transparently, but only
//! while no [`ReactivationGuard`] is alive: cursors, pipelines and prepared
//! statements hold one because their server-side state dies with the
//! session.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::{ConnectMode, ConnectionConfig};
use crate::convert::{literal_or_null, quote_ident};
use crate::error::{Error, Result};
use crate::errorhandler::{ErrorHandler, HandlerChain, HandlerToken};
use crate::pg::PgConnector;
use crate::result::QueryResult;
use crate::transport::{Connector, Envelope, Event, Notification, ServerInfo, Transport};

/// Callback invoked for notifications on a channel.
pub type NotificationReceiver = Box<dyn FnMut(&Notification) + Send>;

// ============================================================================
// Reactivation avoidance
// ============================================================================

/// Keeps the owning connection from reconnecting transparently while alive.
///
/// Dropping the guard releases the hold.
#[must_use = "the hold is released as soon as the guard is dropped"]
pub struct ReactivationGuard {
    counter: Arc<AtomicUsize>,
}

impl ReactivationGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for ReactivationGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for ReactivationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactivationGuard")
            .field("outstanding", &self.counter.load(Ordering::Acquire))
            .finish()
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A response the connection expects but nobody is waiting for.
#[derive(Debug)]
enum Backlog {
    /// Cleanup statement; failures are only logged.
    Discard(String),
    /// Deferred statement whose failure must reach the next caller.
    Check(String),
}

struct PreparedDef {
    definition: String,
    _guard: ReactivationGuard,
}

/// A connection to the database server.
pub struct Connection {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    server_info: ServerInfo,
    broken: bool,
    closed: bool,
    ever_connected: bool,
    focus: Option<String>,
    handlers: HandlerChain,
    receivers: HashMap<String, NotificationReceiver>,
    notifications: VecDeque<Notification>,
    reactivation: Arc<AtomicUsize>,
    backlog: VecDeque<Backlog>,
    prepared: HashMap<String, PreparedDef>,
    name_seq: u64,
}

impl Connection {
    /// Connect to a PostgreSQL server by URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let config = ConnectionConfig::from_url(url)?;
        Self::open(config).await
    }

    /// Open a connection using the bundled PostgreSQL transport.
    pub async fn open(config: ConnectionConfig) -> Result<Self> {
        let connector = Arc::new(PgConnector::new(config.clone()));
        Self::open_with(config, connector).await
    }

    /// Open a connection over any transport.
    pub async fn open_with(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let mode = config.connect_mode;
        let mut conn = Self {
            config,
            connector,
            transport: None,
            server_info: ServerInfo::default(),
            broken: false,
            closed: false,
            ever_connected: false,
            focus: None,
            handlers: HandlerChain::default(),
            receivers: HashMap::new(),
            notifications: VecDeque::new(),
            reactivation: Arc::new(AtomicUsize::new(0)),
            backlog: VecDeque::new(),
            prepared: HashMap::new(),
            name_seq: 0,
        };
        if mode == ConnectMode::Direct {
            conn.activate().await?;
        }
        Ok(conn)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Cheap liveness check; does not touch the network.
    pub fn is_open(&self) -> bool {
        !self.broken
            && !self.closed
            && self
                .transport
                .as_ref()
                .map(|t| t.is_connected())
                .unwrap_or(false)
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_info.server_version()
    }

    pub fn backend_pid(&self) -> i32 {
        self.server_info.backend_pid
    }

    /// Establish a session if there is none.
    ///
    /// Refused while reactivation-avoidance guards are held on a connection
    /// that was connected before, since their state is gone.
    pub async fn activate(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let outstanding = self.reactivation_avoidance_count();
        if self.ever_connected && outstanding > 0 {
            return Err(Error::broken(format!(
                "connection lost; cannot reconnect while {} session-scoped resource(s) are outstanding",
                outstanding
            )));
        }

        let timeout = self.config.connect_timeout_duration();
        let transport = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::broken(format!(
                    "timed out connecting after {:?}",
                    timeout
                )))
            }
        };

        self.server_info = transport.server_info();
        self.transport = Some(transport);
        self.broken = false;
        self.closed = false;
        self.backlog.clear();

        let reconnect = self.ever_connected;
        self.ever_connected = true;
        if reconnect {
            tracing::info!(target: "pgcore::connection", pid = self.server_info.backend_pid, "connection reactivated");
            let channels: Vec<String> = self.receivers.keys().cloned().collect();
            for channel in channels {
                self.roundtrip(&format!("LISTEN {}", quote_ident(&channel)), &[])
                    .await?;
            }
        } else {
            tracing::debug!(target: "pgcore::connection", pid = self.server_info.backend_pid, "connected");
        }
        Ok(())
    }

    /// Close the session while keeping the connection object reusable.
    ///
    /// Refused while a transaction is open or session-scoped state is held.
    pub async fn deactivate(&mut self) -> Result<()> {
        if let Some(focus) = &self.focus {
            return Err(Error::usage(format!(
                "cannot deactivate connection while {} is open",
                focus
            )));
        }
        let outstanding = self.reactivation_avoidance_count();
        if outstanding > 0 {
            return Err(Error::usage(format!(
                "cannot deactivate connection while {} session-scoped resource(s) are outstanding",
                outstanding
            )));
        }
        self.drop_transport().await;
        Ok(())
    }

    /// Close the session for good. Every later operation fails with a
    /// broken-connection error until [`Connection::activate`] is called.
    pub async fn disconnect(&mut self) {
        self.drop_transport().await;
        self.closed = true;
        tracing::debug!(target: "pgcore::connection", "disconnected");
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::debug!(target: "pgcore::connection", error = %e, "error while closing transport");
            }
        }
        self.backlog.clear();
    }

    // ------------------------------------------------------------------------
    // Reactivation avoidance
    // ------------------------------------------------------------------------

    /// Hold off transparent reconnection until the guard is dropped.
    pub fn avoid_reactivation(&self) -> ReactivationGuard {
        ReactivationGuard::new(&self.reactivation)
    }

    pub fn reactivation_avoidance_count(&self) -> usize {
        self.reactivation.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Notices and notifications
    // ------------------------------------------------------------------------

    /// Add a notice handler; it runs before every handler registered earlier.
    pub fn register_errorhandler(&mut self, handler: Arc<dyn ErrorHandler>) -> HandlerToken {
        self.handlers.register(handler)
    }

    pub fn unregister_errorhandler(&mut self, token: HandlerToken) -> bool {
        self.handlers.unregister(token)
    }

    /// Feed a notice through the handler chain as if the server sent it.
    pub fn process_notice(&self, notice: &str) {
        self.handlers.dispatch(notice);
    }

    /// Store the callback for `channel` without issuing `LISTEN`.
    pub fn set_notification_receiver<F>(&mut self, channel: &str, receiver: F)
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        self.receivers.insert(channel.to_string(), Box::new(receiver));
    }

    /// Subscribe to `channel`; `receiver` runs at the next poll point after a
    /// notification arrives.
    pub async fn listen<F>(&mut self, channel: &str, receiver: F) -> Result<()>
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        let already = self.receivers.contains_key(channel);
        self.set_notification_receiver(channel, receiver);
        if !already {
            let sql = format!("LISTEN {}", quote_ident(channel));
            let may_reactivate = self.focus.is_none();
            if let Err(e) = self.execute(&sql, &[], may_reactivate).await {
                self.receivers.remove(channel);
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn unlisten(&mut self, channel: &str) -> Result<()> {
        if self.receivers.remove(channel).is_none() {
            return Ok(());
        }
        let sql = format!("UNLISTEN {}", quote_ident(channel));
        let may_reactivate = self.focus.is_none();
        self.execute(&sql, &[], may_reactivate).await.map(|_| ())
    }

    /// Poll point: deliver notifications that have already arrived.
    ///
    /// Returns the number of notifications delivered.
    pub async fn get_notifs(&mut self) -> Result<usize> {
        self.await_notification(Duration::ZERO).await
    }

    /// Wait up to `timeout` for notifications, then deliver them.
    pub async fn await_notification(&mut self, timeout: Duration) -> Result<usize> {
        if self.is_open() {
            self.settle_backlog().await?;
        }
        if self.notifications.is_empty() && self.is_open() {
            let waited = match self.transport.as_mut() {
                Some(transport) => transport.wait_for_events(timeout).await,
                None => Ok(()),
            };
            self.dispatch_events();
            if let Err(e) = waited {
                self.mark_broken(&e);
                return Err(e);
            }
        }
        Ok(self.deliver_notifications())
    }

    fn deliver_notifications(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(notification) = self.notifications.pop_front() {
            match self.receivers.get_mut(&notification.channel) {
                Some(receiver) => {
                    receiver(&notification);
                    delivered += 1;
                }
                None => {
                    tracing::debug!(target: "pgcore::notify", channel = %notification.channel, "notification without receiver dropped");
                }
            }
        }
        delivered
    }

    fn dispatch_events(&mut self) {
        let events = match self.transport.as_mut() {
            Some(transport) => transport.take_events(),
            None => return,
        };
        for event in events {
            match event {
                Event::Notice(text) => {
                    self.handlers.dispatch(&text);
                }
                Event::Notification(n) => self.notifications.push_back(n),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Prepared statements
    // ------------------------------------------------------------------------

    /// Create a session-level prepared statement called `name`.
    pub async fn prepare(&mut self, name: &str, definition: &str) -> Result<()> {
        if self.prepared.contains_key(name) {
            return Err(Error::argument(format!(
                "prepared statement '{}' already exists",
                name
            )));
        }
        let sql = format!("PREPARE {} AS {}", quote_ident(name), definition);
        let may_reactivate = self.focus.is_none();
        self.execute(&sql, &[], may_reactivate).await?;
        let guard = self.avoid_reactivation();
        self.prepared.insert(
            name.to_string(),
            PreparedDef {
                definition: definition.to_string(),
                _guard: guard,
            },
        );
        Ok(())
    }

    /// Drop the prepared statement called `name`.
    pub async fn unprepare(&mut self, name: &str) -> Result<()> {
        if !self.prepared.contains_key(name) {
            return Err(Error::argument(format!(
                "unknown prepared statement '{}'",
                name
            )));
        }
        let sql = format!("DEALLOCATE {}", quote_ident(name));
        let result = self.execute(&sql, &[], false).await;
        self.prepared.remove(name);
        result.map(|_| ())
    }

    pub fn prepared_definition(&self, name: &str) -> Option<&str> {
        self.prepared.get(name).map(|p| p.definition.as_str())
    }

    /// `EXECUTE` statement for a prepared statement with literal arguments.
    pub(crate) fn prepared_invocation(&self, name: &str, params: &[Option<String>]) -> Result<String> {
        if !self.prepared.contains_key(name) {
            return Err(Error::new(
                crate::error::ErrorKind::InvalidSqlStatementName,
                format!("unknown prepared statement '{}'", name),
            ));
        }
        if params.is_empty() {
            return Ok(format!("EXECUTE {}", quote_ident(name)));
        }
        let args: Vec<String> = params
            .iter()
            .map(|p| literal_or_null(p.as_deref()))
            .collect();
        Ok(format!("EXECUTE {}({})", quote_ident(name), args.join(", ")))
    }

    // ------------------------------------------------------------------------
    // Request submission
    // ------------------------------------------------------------------------

    /// Submit one statement and wait for its result.
    ///
    /// Outside a transaction this may reconnect transparently.
    pub async fn perform(&mut self, statement: &str, params: &[Option<String>]) -> Result<QueryResult> {
        let may_reactivate = self.focus.is_none();
        self.execute(statement, params, may_reactivate).await
    }

    pub(crate) async fn execute(
        &mut self,
        statement: &str,
        params: &[Option<String>],
        may_reactivate: bool,
    ) -> Result<QueryResult> {
        self.ensure_active(may_reactivate).await?;
        self.roundtrip(statement, params).await
    }

    /// Send, flush and read back one statement on the current session.
    async fn roundtrip(&mut self, statement: &str, params: &[Option<String>]) -> Result<QueryResult> {
        self.queue(statement, params)?;
        self.flush().await?;
        let earlier = self.drain_backlog().await;
        let own = self.receive(statement).await;
        earlier?;
        own
    }

    /// Make sure a live session exists, reconnecting when allowed.
    pub(crate) async fn ensure_active(&mut self, may_reactivate: bool) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        if self.closed {
            return Err(Error::broken("connection has been closed"));
        }
        if !self.ever_connected {
            return self.activate().await;
        }
        if !may_reactivate || !self.config.auto_reactivate {
            return Err(Error::broken("connection to server lost"));
        }
        tracing::warn!(target: "pgcore::connection", "connection lost, attempting to reactivate");
        self.activate().await
    }

    /// Queue a statement without flushing.
    pub(crate) fn queue(&mut self, statement: &str, params: &[Option<String>]) -> Result<()> {
        tracing::trace!(target: "pgcore::connection", statement, params = params.len(), "queue");
        let result = match self.transport.as_mut() {
            Some(transport) if !self.broken => transport.send(statement, params),
            _ => Err(Error::broken("no live connection to server")),
        };
        if let Err(e) = &result {
            self.mark_broken(e);
        }
        result
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        let result = match self.transport.as_mut() {
            Some(transport) if !self.broken => transport.flush().await,
            _ => Err(Error::broken("no live connection to server")),
        };
        if let Err(e) = &result {
            self.mark_broken(e);
        }
        result
    }

    /// Queue a `COPY … FROM STDIN` with its data, without flushing.
    pub(crate) fn queue_copy(&mut self, statement: &str, data: &[Bytes]) -> Result<()> {
        tracing::trace!(target: "pgcore::connection", statement, chunks = data.len(), "queue copy");
        let result = match self.transport.as_mut() {
            Some(transport) if !self.broken => transport.send_copy(statement, data),
            _ => Err(Error::broken("no live connection to server")),
        };
        if let Err(e) = &result {
            self.mark_broken(e);
        }
        result
    }

    /// Submit a `COPY … FROM STDIN` and wait for its completion.
    pub(crate) async fn execute_copy(&mut self, statement: &str, data: &[Bytes]) -> Result<QueryResult> {
        self.ensure_active(false).await?;
        self.queue_copy(statement, data)?;
        self.flush().await?;
        let earlier = self.drain_backlog().await;
        let own = self.receive(statement).await;
        earlier?;
        own
    }

    /// Write queued statements without waiting; a full socket is not an error.
    fn try_flush(&mut self) {
        let result = match self.transport.as_mut() {
            Some(transport) if !self.broken => transport.try_flush(),
            _ => return,
        };
        if let Err(e) = &result {
            self.mark_broken(e);
        }
    }

    /// Queue a cleanup statement whose outcome nobody waits for, and push it
    /// toward the server as far as the socket allows.
    ///
    /// Safe to call from `Drop`: nothing is awaited.
    pub(crate) fn defer_discard(&mut self, statement: &str) {
        if !self.is_open() {
            return;
        }
        if self.queue(statement, &[]).is_ok() {
            self.backlog.push_back(Backlog::Discard(statement.to_string()));
            self.try_flush();
        }
    }

    /// Finish any cleanup still outstanding so the session is idle.
    async fn settle_backlog(&mut self) -> Result<()> {
        if self.backlog.is_empty() {
            return Ok(());
        }
        self.flush().await?;
        self.drain_backlog().await
    }

    /// Queue a statement whose failure surfaces on the next request.
    pub(crate) fn defer_check(&mut self, statement: &str) -> Result<()> {
        self.queue(statement, &[])?;
        self.backlog.push_back(Backlog::Check(statement.to_string()));
        Ok(())
    }

    /// Expect `count` responses that nobody will read individually.
    pub(crate) fn discard_responses(&mut self, count: usize, what: &str) {
        if !self.is_open() {
            return;
        }
        for _ in 0..count {
            self.backlog.push_back(Backlog::Discard(what.to_string()));
        }
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Read every backlog response; returns the first deferred failure.
    pub(crate) async fn drain_backlog(&mut self) -> Result<()> {
        let mut first_failure = None;
        while !self.backlog.is_empty() {
            let envelope = self.next_envelope().await?;
            let Some(entry) = self.backlog.pop_front() else {
                break;
            };
            let Some(server_error) = envelope.error else {
                continue;
            };
            match entry {
                Backlog::Discard(statement) => {
                    tracing::warn!(target: "pgcore::connection", statement = %statement, error = %server_error.message, "cleanup statement failed");
                    self.mark_broken(&server_error.into_error());
                }
                Backlog::Check(statement) => {
                    let error = server_error.into_error().with_query(statement);
                    self.mark_broken(&error);
                    if first_failure.is_none() {
                        first_failure = Some(error);
                    }
                }
            }
            if self.broken {
                break;
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Read the response to `query`, which must be the oldest outstanding.
    pub(crate) async fn receive(&mut self, query: &str) -> Result<QueryResult> {
        let envelope = self.next_envelope().await?;
        match envelope.error {
            Some(server_error) => {
                let error = server_error.into_error().with_query(query);
                // Class 08 from the server means the session is unusable too.
                self.mark_broken(&error);
                Err(error)
            }
            None => Ok(QueryResult::from_envelope(envelope, query)),
        }
    }

    /// Run one statement on a separate, short-lived session.
    ///
    /// Used to inspect server state when this connection's own session can
    /// no longer be trusted.
    pub(crate) async fn side_query(&self, statement: &str, params: &[Option<String>]) -> Result<QueryResult> {
        let timeout = self.config.connect_timeout_duration();
        let mut transport = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::broken(format!(
                    "timed out connecting after {:?}",
                    timeout
                )))
            }
        };
        let sent = match transport.send(statement, params) {
            Ok(()) => transport.flush().await,
            Err(e) => Err(e),
        };
        let envelope = match sent {
            Ok(()) => transport.poll_response().await,
            Err(e) => Err(e),
        };
        if let Err(e) = transport.close().await {
            tracing::debug!(target: "pgcore::connection", error = %e, "error while closing side session");
        }
        let envelope = envelope?;
        match envelope.error {
            Some(server_error) => Err(server_error.into_error().with_query(statement)),
            None => Ok(QueryResult::from_envelope(envelope, statement)),
        }
    }

    async fn next_envelope(&mut self) -> Result<Envelope> {
        let result = match self.transport.as_mut() {
            Some(transport) if !self.broken => transport.poll_response().await,
            _ => Err(Error::broken("no live connection to server")),
        };
        self.dispatch_events();
        if let Err(e) = &result {
            self.mark_broken(e);
        }
        result
    }

    fn mark_broken(&mut self, error: &Error) {
        if error.is_broken_connection() && !self.broken {
            tracing::warn!(target: "pgcore::connection", error = %error, "connection broken");
            self.broken = true;
            self.backlog.clear();
        }
    }

    // ------------------------------------------------------------------------
    // Transaction focus
    // ------------------------------------------------------------------------

    /// Name of the transaction currently open on this connection.
    pub fn open_transaction(&self) -> Option<&str> {
        self.focus.as_deref()
    }

    pub(crate) fn register_focus(&mut self, name: &str) -> Result<()> {
        if let Some(current) = &self.focus {
            return Err(Error::usage(format!(
                "cannot open {} while {} is still open",
                name, current
            )));
        }
        self.focus = Some(name.to_string());
        Ok(())
    }

    pub(crate) fn unregister_focus(&mut self) {
        self.focus = None;
    }

    /// Server-side object name unique within this connection.
    pub(crate) fn unique_name(&mut self, prefix: &str) -> String {
        self.name_seq += 1;
        format!("{}_{}", prefix, self.name_seq)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("database", &self.config.database)
            .field("open", &self.is_open())
            .field("focus", &self.focus)
            .field("backlog", &self.backlog.len())
            .finish()
    }
}
