//! TCP session speaking the PostgreSQL protocol, exposed as a [`Transport`].

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use smallvec::{smallvec, SmallVec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::protocol::{decode, Authentication, Backend, Frontend, TransactionStatus};
use super::scram::{self, ScramClient};
use super::statement::StatementCache;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::transport::{Connector, Envelope, Event, Notification, ServerInfo, Transport};

/// Opens [`PgTransport`] sessions for one configuration.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: ConnectionConfig,
}

impl PgConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let transport = PgTransport::connect(&self.config).await?;
        Ok(Box::new(transport))
    }
}

/// Response bookkeeping for one sent statement.
#[derive(Debug)]
struct Pending {
    /// Query text whose Parse travels with this statement, until the
    /// server acknowledges it with ParseComplete.
    parsing: Option<String>,
}

pub struct PgTransport {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    pending: VecDeque<Pending>,
    /// Response being assembled for the front of `pending`.
    current: Option<Envelope>,
    statements: StatementCache,
    server_info: ServerInfo,
    status: TransactionStatus,
    events: Vec<Event>,
    connected: bool,
}

impl PgTransport {
    /// Connect and authenticate.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                Error::broken(format!(
                    "could not connect to {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::broken(e.to_string()))?;
        let (reader, writer) = stream.into_split();

        let mut transport = Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(32 * 1024),
            write_buf: BytesMut::with_capacity(4 * 1024),
            pending: VecDeque::new(),
            current: None,
            statements: StatementCache::new(config.statement_cache_capacity),
            server_info: ServerInfo::default(),
            status: TransactionStatus::Idle,
            events: Vec::new(),
            connected: true,
        };
        transport.startup(config).await?;
        tracing::debug!(
            target: "pgcore::pg",
            host = %config.host,
            port = config.port,
            pid = transport.server_info.backend_pid,
            "session established"
        );
        Ok(transport)
    }

    async fn startup(&mut self, config: &ConnectionConfig) -> Result<()> {
        Frontend::Startup {
            user: &config.user,
            database: &config.database,
            application_name: config.application_name.as_deref(),
        }
        .encode(&mut self.write_buf);
        self.write_out().await?;

        let mut scram: Option<ScramClient> = None;
        loop {
            match self.read_message().await? {
                Backend::Authentication(auth) => {
                    self.authenticate(config, auth, &mut scram).await?
                }
                Backend::ParameterStatus { name, value } => {
                    self.server_info.parameters.insert(name, value);
                }
                Backend::BackendKeyData { process_id, .. } => {
                    self.server_info.backend_pid = process_id;
                }
                Backend::ReadyForQuery(status) => {
                    self.status = status;
                    return Ok(());
                }
                Backend::ErrorResponse(error) => {
                    self.connected = false;
                    // Anything refusing the session is a broken connection;
                    // only the connection-limit code keeps its own kind.
                    let error = error.into_error();
                    if error.is_broken_connection() {
                        return Err(error);
                    }
                    return Err(Error::broken(format!("connection refused: {}", error.message())));
                }
                Backend::NoticeResponse(notice) => self.events.push(Event::Notice(notice.text())),
                _ => {}
            }
        }
    }

    async fn authenticate(
        &mut self,
        config: &ConnectionConfig,
        auth: Authentication,
        scram: &mut Option<ScramClient>,
    ) -> Result<()> {
        let password = || {
            config
                .password
                .as_deref()
                .ok_or_else(|| Error::broken("server requested a password but none is configured"))
        };
        match auth {
            Authentication::Ok => return Ok(()),
            Authentication::CleartextPassword => {
                Frontend::Password(password()?).encode(&mut self.write_buf);
            }
            Authentication::Md5Password { salt } => {
                let hashed = md5_password(&config.user, password()?, &salt);
                Frontend::Password(&hashed).encode(&mut self.write_buf);
            }
            Authentication::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                    return Err(Error::broken(format!(
                        "no supported SASL mechanism among {:?}",
                        mechanisms
                    )));
                }
                let client = ScramClient::new(password()?);
                Frontend::SaslInitialResponse {
                    mechanism: scram::MECHANISM,
                    data: &client.client_first(),
                }
                .encode(&mut self.write_buf);
                *scram = Some(client);
            }
            Authentication::SaslContinue(data) => {
                let client = scram
                    .as_mut()
                    .ok_or_else(|| Error::broken("unexpected SASL continuation"))?;
                let reply = client
                    .client_final(&data)
                    .map_err(|e| Error::broken(format!("SCRAM authentication failed: {}", e)))?;
                Frontend::SaslResponse(&reply).encode(&mut self.write_buf);
            }
            Authentication::SaslFinal(data) => {
                let client = scram
                    .as_ref()
                    .ok_or_else(|| Error::broken("unexpected SASL completion"))?;
                client
                    .verify(&data)
                    .map_err(|e| Error::broken(format!("SCRAM authentication failed: {}", e)))?;
                return Ok(());
            }
        }
        self.write_out().await
    }

    /// Transaction status as of the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.status
    }

    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    fn check_connected(&self) -> Result<()> {
        if !self.connected {
            return Err(Error::broken("connection to server lost"));
        }
        Ok(())
    }

    fn lost(&mut self, what: &str, cause: impl std::fmt::Display) -> Error {
        if self.connected {
            tracing::warn!(target: "pgcore::pg", error = %cause, "{}", what);
        }
        self.connected = false;
        self.statements.clear();
        Error::broken(format!("{}: {}", what, cause))
    }

    async fn write_out(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let buf = self.write_buf.split();
        let written = match self.writer.write_all(&buf).await {
            Ok(()) => self.writer.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| self.lost("write to server failed", e))
    }

    /// Read one backend message. Cancel-safe: partial input stays buffered.
    async fn read_message(&mut self) -> Result<Backend> {
        loop {
            match decode(&mut self.read_buf) {
                Ok(Some(msg)) => return Ok(msg),
                Ok(None) => {}
                Err(e) => return Err(self.lost("malformed server message", e)),
            }
            match self.reader.read_buf(&mut self.read_buf).await {
                Ok(0) => return Err(self.lost("server closed the connection", "end of stream")),
                Ok(_) => {}
                Err(e) => return Err(self.lost("read from server failed", e)),
            }
        }
    }

    /// Record out-of-band traffic; returns the message back if it is not.
    fn absorb(&mut self, msg: Backend) -> Option<Backend> {
        match msg {
            Backend::NoticeResponse(notice) => {
                self.events.push(Event::Notice(notice.text()));
                None
            }
            Backend::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                self.events.push(Event::Notification(Notification {
                    channel,
                    payload,
                    backend_pid: process_id,
                }));
                None
            }
            Backend::ParameterStatus { name, value } => {
                self.server_info.parameters.insert(name, value);
                None
            }
            other => Some(other),
        }
    }
}

#[async_trait]
impl Transport for PgTransport {
    fn send(&mut self, statement: &str, params: &[Option<String>]) -> Result<()> {
        self.check_connected()?;
        if params.is_empty() {
            Frontend::Query(statement).encode(&mut self.write_buf);
            self.pending.push_back(Pending { parsing: None });
            return Ok(());
        }

        let (name, parsing) = match self.statements.lookup(statement) {
            Some(name) => (name, None),
            None => {
                let (name, evicted) = self.statements.assign(statement);
                if let Some(evicted) = evicted {
                    Frontend::CloseStatement(&evicted).encode(&mut self.write_buf);
                }
                Frontend::Parse {
                    name: &name,
                    query: statement,
                }
                .encode(&mut self.write_buf);
                (name, Some(statement.to_string()))
            }
        };
        Frontend::Bind {
            statement: &name,
            params,
        }
        .encode(&mut self.write_buf);
        Frontend::DescribePortal.encode(&mut self.write_buf);
        Frontend::Execute.encode(&mut self.write_buf);
        Frontend::Sync.encode(&mut self.write_buf);
        self.pending.push_back(Pending { parsing });
        Ok(())
    }

    fn send_copy(&mut self, statement: &str, data: &[Bytes]) -> Result<()> {
        self.check_connected()?;
        // Data queued behind the COPY is dropped by the server if the
        // statement fails before entering copy mode.
        Frontend::Query(statement).encode(&mut self.write_buf);
        for chunk in data {
            Frontend::CopyData(chunk).encode(&mut self.write_buf);
        }
        Frontend::CopyDone.encode(&mut self.write_buf);
        self.pending.push_back(Pending { parsing: None });
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.write_out().await
    }

    fn try_flush(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            match self.writer.try_write(&self.write_buf) {
                Ok(0) => return Err(self.lost("write to server failed", "connection closed")),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(self.lost("write to server failed", e)),
            }
        }
        Ok(())
    }

    async fn poll_response(&mut self) -> Result<Envelope> {
        if self.pending.is_empty() {
            return Err(Error::internal("no statement is awaiting a response"));
        }
        loop {
            let msg = self.read_message().await?;
            let Some(msg) = self.absorb(msg) else {
                continue;
            };
            let envelope = self.current.get_or_insert_with(Envelope::default);
            match msg {
                Backend::RowDescription(columns) => envelope.columns = columns,
                Backend::DataRow(values) => envelope.rows.push(SmallVec::from_vec(values)),
                Backend::CommandComplete(tag) => envelope.command_tag = tag,
                Backend::CopyData(data) => envelope.rows.push(smallvec![Some(data)]),
                Backend::ErrorResponse(error) => {
                    envelope.error = Some(error);
                    // Without ParseComplete the statement name never existed.
                    if let Some(query) = self.pending.front_mut().and_then(|p| p.parsing.take()) {
                        self.statements.forget(&query);
                    }
                }
                Backend::ParseComplete => {
                    if let Some(pending) = self.pending.front_mut() {
                        pending.parsing = None;
                    }
                }
                Backend::ReadyForQuery(status) => {
                    self.status = status;
                    self.pending.pop_front();
                    return Ok(self.current.take().unwrap_or_default());
                }
                _ => {}
            }
        }
    }

    async fn wait_for_events(&mut self, timeout: Duration) -> Result<()> {
        if !self.pending.is_empty() {
            return Ok(());
        }
        let first = match tokio::time::timeout(timeout, self.read_message()).await {
            Err(_) => return Ok(()),
            Ok(msg) => msg?,
        };
        if let Some(other) = self.absorb(first) {
            tracing::debug!(target: "pgcore::pg", message = ?other, "ignoring unsolicited message");
        }
        // Take whatever else already arrived without waiting again.
        while let Some(msg) = decode(&mut self.read_buf).map_err(|e| self.lost("malformed server message", e))? {
            if let Some(other) = self.absorb(msg) {
                tracing::debug!(target: "pgcore::pg", message = ?other, "ignoring unsolicited message");
            }
        }
        Ok(())
    }

    fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn server_info(&self) -> ServerInfo {
        self.server_info.clone()
    }

    async fn close(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        Frontend::Terminate.encode(&mut self.write_buf);
        let result = self.write_out().await;
        self.connected = false;
        let _ = self.writer.shutdown().await;
        result
    }
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt))
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}
