//! Scripted in-memory server used by the unit tests.
//!
//! `MockServer` hands out `MockTransport` sessions that understand a tiny
//! SQL dialect: transaction control and savepoints, one shared table `t`
//! with a single text column `v`, integer `SELECT`s, cursors over
//! `generate_series(a, b)`, `NOTICE <text>`, `FAIL <sqlstate>`, `COPY` on
//! `t`, the large-object functions and `txid_current`/`txid_status`.
//! Responses are computed when a statement is sent and released in FIFO
//! order once flushed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use smallvec::smallvec;
use tokio::sync::Semaphore;

use crate::config::{ConnectMode, ConnectionConfig};
use crate::connection::Connection;
use crate::convert::{FromText, ToText};
use crate::copy::{decode_row, encode_row};
use crate::error::{Error, Result};
use crate::transport::{
    Column, Connector, Envelope, Event, Notification, RawRow, ServerError, ServerInfo, Transport,
};

const INT4: u32 = 23;
const INT8: u32 = 20;
const TEXT: u32 = 25;
const OID: u32 = 26;
const BYTEA: u32 = 17;
const FIRST_OID: u32 = 16384;
const INV_WRITE: i64 = 0x20000;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn lazy_config() -> ConnectionConfig {
    ConnectionConfig::default().connect_mode(ConnectMode::Lazy)
}

struct Injection {
    prefix: String,
    envelope: Envelope,
    remaining: usize,
}

#[derive(Default)]
struct ServerState {
    generation: u64,
    connects: usize,
    refuse: Option<ServerError>,
    statements: Vec<String>,
    table: Vec<String>,
    injections: Vec<Injection>,
    kill_on: Option<String>,
    notifications: Vec<Notification>,
    gate: Option<Arc<Semaphore>>,
    received: usize,
    flushed: Vec<String>,
    large_objects: HashMap<u32, Vec<u8>>,
    next_oid: u32,
    next_xid: i64,
    xid_status: HashMap<i64, &'static str>,
}

/// Shared server; clones observe the same state.
#[derive(Clone)]
pub(crate) struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub(crate) fn new() -> Self {
        init_tracing();
        Self {
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub(crate) async fn connect(&self) -> Connection {
        Connection::open_with(ConnectionConfig::default(), self.connector())
            .await
            .expect("mock connect")
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Every statement sent on any session, in order.
    pub(crate) fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Statements in the order they were written to the server.
    pub(crate) fn flushed(&self) -> Vec<String> {
        self.state.lock().flushed.clone()
    }

    /// Contents of a large object, if it exists.
    pub(crate) fn large_object(&self, oid: u32) -> Option<Vec<u8>> {
        self.state.lock().large_objects.get(&oid).cloned()
    }

    /// Number of responses handed out so far.
    pub(crate) fn received(&self) -> usize {
        self.state.lock().received
    }

    /// Committed contents of table `t`.
    pub(crate) fn table(&self) -> Vec<String> {
        self.state.lock().table.clone()
    }

    pub(crate) fn refuse_connections(&self, code: &str, message: &str) {
        self.state.lock().refuse = Some(ServerError::new(code, message));
    }

    /// Every existing session fails on its next I/O.
    pub(crate) fn kill_sessions(&self) {
        self.state.lock().generation += 1;
    }

    /// The session dies right after executing the next statement starting
    /// with `prefix`, before its response is read.
    pub(crate) fn kill_on(&self, prefix: &str) {
        self.state.lock().kill_on = Some(prefix.to_string());
    }

    /// Answer the next `times` statements starting with `prefix` with
    /// `envelope` instead of executing them.
    pub(crate) fn inject(&self, prefix: &str, envelope: Envelope, times: usize) {
        self.state.lock().injections.push(Injection {
            prefix: prefix.to_string(),
            envelope,
            remaining: times,
        });
    }

    pub(crate) fn fail_next(&self, prefix: &str, sqlstate: &str, times: usize) {
        let envelope = Envelope::failed(ServerError::new(sqlstate, format!("injected {}", sqlstate)));
        self.inject(prefix, envelope, times);
    }

    pub(crate) fn notify(&self, channel: &str, payload: &str) {
        self.state.lock().notifications.push(Notification {
            channel: channel.to_string(),
            payload: payload.to_string(),
            backend_pid: 4242,
        });
    }

    /// Hold back every response until released.
    pub(crate) fn close_gate(&self) {
        self.state.lock().gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub(crate) fn release(&self, responses: usize) {
        if let Some(gate) = &self.state.lock().gate {
            gate.add_permits(responses);
        }
    }

    pub(crate) fn open_gate(&self) {
        if let Some(gate) = self.state.lock().gate.take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }
}

#[async_trait]
impl Connector for MockServer {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let mut state = self.state.lock();
        if let Some(refusal) = &state.refuse {
            return Err(refusal.clone().into_error());
        }
        state.connects += 1;
        Ok(Box::new(MockTransport {
            server: Arc::clone(&self.state),
            generation: state.generation,
            alive: true,
            pid: 1000 + state.connects as i32,
            queued: Vec::new(),
            flushed: VecDeque::new(),
            tx: None,
            cursors: HashMap::new(),
            notices: Vec::new(),
            lo_fds: HashMap::new(),
            next_fd: 0,
        }))
    }
}

struct Reply {
    statement: String,
    envelope: Envelope,
    notices: Vec<String>,
    kill: bool,
}

#[derive(Default)]
struct TxSim {
    writes: Vec<String>,
    failed: bool,
    savepoints: Vec<(String, usize)>,
    xid: Option<i64>,
}

struct LoDescriptor {
    oid: u32,
    pos: usize,
    writable: bool,
}

struct CursorSim {
    rows: Vec<i64>,
    pos: usize,
    scroll: bool,
    hold: bool,
}

impl CursorSim {
    fn forward(&mut self, n: usize) -> Vec<i64> {
        let mut out = Vec::new();
        while out.len() < n && self.pos < self.rows.len() {
            self.pos += 1;
            out.push(self.rows[self.pos - 1]);
        }
        if out.len() < n {
            self.pos = self.rows.len() + 1;
        }
        out
    }

    fn current(&self) -> Vec<i64> {
        match self.pos {
            p if p >= 1 && p <= self.rows.len() => vec![self.rows[p - 1]],
            _ => Vec::new(),
        }
    }

    fn backward(&mut self, n: usize) -> Vec<i64> {
        let mut out = Vec::new();
        while out.len() < n && self.pos > 1 {
            self.pos -= 1;
            out.push(self.rows[self.pos - 1]);
        }
        if out.len() < n {
            self.pos = 0;
        }
        out
    }
}

pub(crate) struct MockTransport {
    server: Arc<Mutex<ServerState>>,
    generation: u64,
    alive: bool,
    pid: i32,
    queued: Vec<Reply>,
    flushed: VecDeque<Reply>,
    tx: Option<TxSim>,
    cursors: HashMap<String, CursorSim>,
    notices: Vec<String>,
    lo_fds: HashMap<i32, LoDescriptor>,
    next_fd: i32,
}

fn lost() -> Error {
    Error::broken("server closed the connection unexpectedly")
}

fn fail(code: &str, message: &str) -> Envelope {
    Envelope::failed(ServerError::new(code, message))
}

fn rows_of(values: impl IntoIterator<Item = String>) -> Vec<RawRow> {
    values
        .into_iter()
        .map(|v| -> RawRow { smallvec![Some(Bytes::from(v))] })
        .collect()
}

fn select(name: &str, oid: u32, tag: &str, values: Vec<String>) -> Envelope {
    let count = values.len();
    Envelope {
        columns: vec![Column::new(name, oid)],
        rows: rows_of(values),
        command_tag: format!("{} {}", tag, count),
        error: None,
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    let s = s.strip_prefix('E').unwrap_or(s).trim();
    if s.len() >= 2 && (s.starts_with('\'') || s.starts_with('"')) {
        s[1..s.len() - 1].replace("''", "'").replace("\"\"", "\"")
    } else {
        s.to_string()
    }
}

fn bind(statement: &str, params: &[Option<String>]) -> String {
    let mut sql = statement.to_string();
    for (i, p) in params.iter().enumerate().rev() {
        let value = match p {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

impl MockTransport {
    fn check_alive(&mut self) -> Result<()> {
        let generation = self.server.lock().generation;
        if !self.alive || generation != self.generation {
            self.alive = false;
            return Err(lost());
        }
        Ok(())
    }

    fn visible(&self, state: &ServerState) -> Vec<String> {
        let mut rows = state.table.clone();
        if let Some(tx) = &self.tx {
            rows.extend(tx.writes.iter().cloned());
        }
        rows
    }

    fn end_transaction(&mut self, state: &mut ServerState, committed: bool) {
        if let Some(xid) = self.tx.as_ref().and_then(|tx| tx.xid) {
            state
                .xid_status
                .insert(xid, if committed { "committed" } else { "aborted" });
        }
        self.tx = None;
        self.cursors.retain(|_, c| c.hold);
        self.lo_fds.clear();
    }

    /// Statements queued so far are now on the wire.
    fn push_out(&mut self) {
        let statements: Vec<String> = self.queued.iter().map(|r| r.statement.clone()).collect();
        self.server.lock().flushed.extend(statements);
        self.flushed.extend(self.queued.drain(..));
    }

    fn execute(&mut self, state: &mut ServerState, sql: &str) -> Reply {
        let mut notices = Vec::new();
        let mut envelope = None;
        if let Some(inj) = state
            .injections
            .iter_mut()
            .find(|i| i.remaining > 0 && sql.starts_with(&i.prefix))
        {
            inj.remaining -= 1;
            envelope = Some(inj.envelope.clone());
        }
        let envelope = match envelope {
            Some(e) => {
                // An injected answer to COMMIT or ROLLBACK still ends the block
                let upper = sql.trim_start().to_ascii_uppercase();
                if upper.starts_with("COMMIT") || upper == "ROLLBACK" {
                    let committed = upper.starts_with("COMMIT")
                        && e.error.is_none()
                        && e.command_tag != "ROLLBACK";
                    self.end_transaction(state, committed);
                }
                e
            }
            None => self.simulate(state, sql, &mut notices),
        };
        if envelope.error.is_some() {
            if let Some(tx) = self.tx.as_mut() {
                tx.failed = true;
            }
        }
        let kill = match &state.kill_on {
            Some(prefix) if sql.starts_with(prefix.as_str()) => {
                state.kill_on = None;
                true
            }
            _ => false,
        };
        Reply {
            statement: sql.to_string(),
            envelope,
            notices,
            kill,
        }
    }

    fn simulate(&mut self, state: &mut ServerState, sql: &str, notices: &mut Vec<String>) -> Envelope {
        let words: Vec<&str> = sql.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let first = upper.first().map(String::as_str).unwrap_or("");

        let ends_block = matches!(first, "ROLLBACK" | "COMMIT");
        if !ends_block && self.tx.as_ref().map(|t| t.failed).unwrap_or(false) {
            return fail(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            );
        }

        match first {
            "BEGIN" => {
                if self.tx.is_some() {
                    notices.push("there is already a transaction in progress".to_string());
                } else {
                    self.tx = Some(TxSim::default());
                }
                Envelope::command("BEGIN")
            }
            "COMMIT" => match self.tx.as_mut() {
                None => {
                    notices.push("there is no transaction in progress".to_string());
                    Envelope::command("COMMIT")
                }
                Some(tx) => {
                    let failed = tx.failed;
                    let writes = std::mem::take(&mut tx.writes);
                    self.end_transaction(state, !failed);
                    if failed {
                        Envelope::command("ROLLBACK")
                    } else {
                        state.table.extend(writes);
                        Envelope::command("COMMIT")
                    }
                }
            },
            "ROLLBACK" if upper.len() >= 4 && upper[1] == "TO" => {
                let name = unquote(words[words.len() - 1]);
                let Some(tx) = self.tx.as_mut() else {
                    return fail("25P01", "ROLLBACK TO SAVEPOINT can only be used in transaction blocks");
                };
                match tx.savepoints.iter().rposition(|(n, _)| *n == name) {
                    Some(idx) => {
                        let len = tx.savepoints[idx].1;
                        tx.writes.truncate(len);
                        tx.savepoints.truncate(idx + 1);
                        tx.failed = false;
                        Envelope::command("ROLLBACK")
                    }
                    None => fail("3B001", "savepoint does not exist"),
                }
            }
            "ROLLBACK" => {
                self.end_transaction(state, false);
                Envelope::command("ROLLBACK")
            }
            "SAVEPOINT" => {
                let name = unquote(words.get(1).copied().unwrap_or(""));
                match self.tx.as_mut() {
                    Some(tx) => {
                        tx.savepoints.push((name, tx.writes.len()));
                        Envelope::command("SAVEPOINT")
                    }
                    None => fail("25P01", "SAVEPOINT can only be used in transaction blocks"),
                }
            }
            "RELEASE" => {
                let name = unquote(words[words.len() - 1]);
                match self.tx.as_mut() {
                    Some(tx) => match tx.savepoints.iter().rposition(|(n, _)| *n == name) {
                        Some(idx) => {
                            tx.savepoints.truncate(idx);
                            Envelope::command("RELEASE")
                        }
                        None => fail("3B001", "savepoint does not exist"),
                    },
                    None => fail("25P01", "RELEASE SAVEPOINT can only be used in transaction blocks"),
                }
            }
            "INSERT" => {
                let value = match (sql.find('('), sql.rfind(')')) {
                    (Some(open), Some(close)) if open < close => unquote(&sql[open + 1..close]),
                    _ => return fail("42601", "syntax error in INSERT"),
                };
                match self.tx.as_mut() {
                    Some(tx) => tx.writes.push(value),
                    None => state.table.push(value),
                }
                Envelope::command("INSERT 0 1")
            }
            "SELECT" => {
                let rest = sql["SELECT".len()..].trim();
                if rest.eq_ignore_ascii_case("count(*) FROM t") {
                    let n = self.visible(state).len();
                    select("count", 20, "SELECT", vec![n.to_string()])
                } else if rest.eq_ignore_ascii_case("v FROM t") {
                    select("v", TEXT, "SELECT", self.visible(state))
                } else if let Some(envelope) = self.call(state, rest) {
                    envelope
                } else if let Ok(n) = unquote(rest).parse::<i64>() {
                    select("?column?", INT4, "SELECT", vec![n.to_string()])
                } else {
                    fail("42601", &format!("syntax error at or near \"{}\"", rest))
                }
            }
            "NOTICE" => {
                notices.push(sql["NOTICE".len()..].trim().to_string());
                Envelope::command("DO")
            }
            "FAIL" => {
                let code = words.get(1).copied().unwrap_or("XX000");
                fail(code, "requested failure")
            }
            "LISTEN" | "UNLISTEN" | "PREPARE" | "DEALLOCATE" => Envelope::command(first),
            "EXECUTE" => {
                let arg = match (sql.find('('), sql.rfind(')')) {
                    (Some(open), Some(close)) if open < close => {
                        let inner = &sql[open + 1..close];
                        unquote(inner.split(',').next().unwrap_or(""))
                    }
                    _ => String::new(),
                };
                select("arg", TEXT, "SELECT", vec![arg])
            }
            "DECLARE" => self.declare(sql, &words, &upper),
            "COPY" => self.copy_out(state, &words, &upper),
            "FETCH" | "MOVE" => self.fetch_or_move(first == "FETCH", &words, &upper),
            "CLOSE" => {
                let name = unquote(words.get(1).copied().unwrap_or(""));
                match self.cursors.remove(&name) {
                    Some(_) => Envelope::command("CLOSE CURSOR"),
                    None => fail("34000", &format!("cursor \"{}\" does not exist", name)),
                }
            }
            _ => fail(
                "42601",
                &format!("syntax error at or near \"{}\"", words.first().unwrap_or(&"")),
            ),
        }
    }

    /// Server functions called as `SELECT name(args)`.
    fn call(&mut self, state: &mut ServerState, expr: &str) -> Option<Envelope> {
        let open = expr.find('(')?;
        let close = expr.rfind(')')?;
        if close < open {
            return None;
        }
        let name = expr[..open].trim().to_ascii_lowercase();
        let inner = expr[open + 1..close].trim();
        let args: Vec<String> = if inner.is_empty() {
            Vec::new()
        } else {
            inner.split(',').map(unquote).collect()
        };
        let int = |i: usize| args.get(i).and_then(|a| a.parse::<i64>().ok()).unwrap_or(-1);

        let envelope = match name.as_str() {
            "txid_current" => {
                let xid = match self.tx.as_mut() {
                    Some(tx) => *tx.xid.get_or_insert_with(|| {
                        state.next_xid += 1;
                        state.next_xid
                    }),
                    None => {
                        state.next_xid += 1;
                        state.next_xid
                    }
                };
                state.xid_status.entry(xid).or_insert("in progress");
                select("txid_current", INT8, "SELECT", vec![xid.to_string()])
            }
            "txid_status" => {
                let status = state.xid_status.get(&int(0)).copied();
                let cell = status.map(|s| Bytes::from_static(s.as_bytes()));
                Envelope {
                    columns: vec![Column::new("txid_status", TEXT)],
                    rows: vec![smallvec![cell]],
                    command_tag: "SELECT 1".to_string(),
                    error: None,
                }
            }
            "lo_create" => {
                let oid = FIRST_OID + state.next_oid;
                state.next_oid += 1;
                state.large_objects.insert(oid, Vec::new());
                select("lo_create", OID, "SELECT", vec![oid.to_string()])
            }
            "lo_unlink" => match state.large_objects.remove(&(int(0) as u32)) {
                Some(_) => select("lo_unlink", INT4, "SELECT", vec!["1".to_string()]),
                None => fail("42704", &format!("large object {} does not exist", int(0))),
            },
            "lo_open" => {
                let oid = int(0) as u32;
                if self.tx.is_none() {
                    return Some(fail("0A000", "large objects need a transaction block"));
                }
                if !state.large_objects.contains_key(&oid) {
                    return Some(fail("42704", &format!("large object {} does not exist", oid)));
                }
                let fd = self.next_fd;
                self.next_fd += 1;
                self.lo_fds.insert(
                    fd,
                    LoDescriptor {
                        oid,
                        pos: 0,
                        writable: int(1) & INV_WRITE != 0,
                    },
                );
                select("lo_open", INT4, "SELECT", vec![fd.to_string()])
            }
            "loread" | "lowrite" | "lo_lseek64" | "lo_tell64" | "lo_truncate64" | "lo_close" => {
                let fd = int(0) as i32;
                if name == "lo_close" {
                    return Some(match self.lo_fds.remove(&fd) {
                        Some(_) => select("lo_close", INT4, "SELECT", vec!["0".to_string()]),
                        None => fail("42704", &format!("invalid large-object descriptor: {}", fd)),
                    });
                }
                let Some(desc) = self.lo_fds.get_mut(&fd) else {
                    return Some(fail("42704", &format!("invalid large-object descriptor: {}", fd)));
                };
                let Some(data) = state.large_objects.get_mut(&desc.oid) else {
                    return Some(fail("42704", &format!("large object {} does not exist", desc.oid)));
                };
                if matches!(name.as_str(), "lowrite" | "lo_truncate64") && !desc.writable {
                    return Some(fail(
                        "55000",
                        &format!("large object descriptor {} was not opened for writing", fd),
                    ));
                }
                match name.as_str() {
                    "loread" => {
                        let start = desc.pos.min(data.len());
                        let end = (start + int(1).max(0) as usize).min(data.len());
                        desc.pos = end;
                        let text = data[start..end].to_text().unwrap_or_default();
                        select("loread", BYTEA, "SELECT", vec![text])
                    }
                    "lowrite" => {
                        let bytes = match args.get(1).map(|a| Vec::<u8>::from_text(a)) {
                            Some(Ok(bytes)) => bytes,
                            _ => return Some(fail("22P02", "invalid input syntax for type bytea")),
                        };
                        let end = desc.pos + bytes.len();
                        if data.len() < end {
                            data.resize(end, 0);
                        }
                        data[desc.pos..end].copy_from_slice(&bytes);
                        desc.pos = end;
                        select("lowrite", INT4, "SELECT", vec![bytes.len().to_string()])
                    }
                    "lo_lseek64" => {
                        let base = match int(2) {
                            0 => 0,
                            1 => desc.pos as i64,
                            _ => data.len() as i64,
                        };
                        let target = base + int(1);
                        if target < 0 {
                            return Some(fail("22023", "invalid seek offset"));
                        }
                        desc.pos = target as usize;
                        select("lo_lseek64", INT8, "SELECT", vec![target.to_string()])
                    }
                    "lo_tell64" => select("lo_tell64", INT8, "SELECT", vec![desc.pos.to_string()]),
                    _ => {
                        data.resize(int(1).max(0) as usize, 0);
                        select("lo_truncate64", INT4, "SELECT", vec!["0".to_string()])
                    }
                }
            }
            _ => return None,
        };
        Some(envelope)
    }

    /// `COPY t [(v)] TO STDOUT`: one text-format line per row.
    fn copy_out(&mut self, state: &mut ServerState, words: &[&str], upper: &[String]) -> Envelope {
        let table = unquote(words.get(1).copied().unwrap_or(""));
        if table != "t" {
            return fail("42P01", &format!("relation \"{}\" does not exist", table));
        }
        if !upper.iter().any(|w| w == "STDOUT") {
            return fail("0A000", "mock COPY only writes to STDOUT without data");
        }
        let values = self.visible(state);
        let count = values.len();
        let rows = values
            .into_iter()
            .map(|v| -> RawRow {
                let mut line = BytesMut::new();
                encode_row(&[Some(v)], &mut line);
                smallvec![Some(line.freeze())]
            })
            .collect();
        Envelope {
            columns: Vec::new(),
            rows,
            command_tag: format!("COPY {}", count),
            error: None,
        }
    }

    /// `COPY t [(v)] FROM STDIN` with its data; rows land in `t`.
    fn copy_in(&mut self, state: &mut ServerState, statement: &str, data: &[Bytes]) -> Envelope {
        if self.tx.as_ref().map(|t| t.failed).unwrap_or(false) {
            return fail(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            );
        }
        let words: Vec<&str> = statement.split_whitespace().collect();
        let table = unquote(words.get(1).copied().unwrap_or(""));
        if table != "t" {
            return fail("42P01", &format!("relation \"{}\" does not exist", table));
        }
        let payload: Vec<u8> = data.iter().flat_map(|chunk| chunk.iter().copied()).collect();
        let mut lines: Vec<&[u8]> = payload.split(|b| *b == b'\n').collect();
        if lines.last().map(|l| l.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        let mut values = Vec::with_capacity(lines.len());
        for line in lines {
            match decode_row(line) {
                Ok(fields) => values.push(fields.into_iter().next().flatten().unwrap_or_default()),
                Err(e) => return fail("22P04", e.message()),
            }
        }
        let count = values.len();
        match self.tx.as_mut() {
            Some(tx) => tx.writes.extend(values),
            None => state.table.extend(values),
        }
        Envelope::command(format!("COPY {}", count))
    }

    fn declare(&mut self, sql: &str, words: &[&str], upper: &[String]) -> Envelope {
        let name = unquote(words.get(1).copied().unwrap_or(""));
        let scroll = upper.get(2).map(String::as_str) != Some("NO");
        let hold = upper.windows(2).any(|w| w[0] == "WITH" && w[1] == "HOLD");
        if self.tx.is_none() && !hold {
            return fail("25P01", "DECLARE CURSOR can only be used in transaction blocks");
        }
        if self.cursors.contains_key(&name) {
            return fail("42P03", &format!("cursor \"{}\" already exists", name));
        }
        let bounds = sql.find("generate_series(").and_then(|start| {
            let inner = &sql[start + "generate_series(".len()..];
            let inner = &inner[..inner.find(')')?];
            let (a, b) = inner.split_once(',')?;
            Some((a.trim().parse::<i64>().ok()?, b.trim().parse::<i64>().ok()?))
        });
        let Some((from, to)) = bounds else {
            return fail("42601", "mock cursors only support generate_series(a, b)");
        };
        self.cursors.insert(
            name,
            CursorSim {
                rows: (from..=to).collect(),
                pos: 0,
                scroll,
                hold,
            },
        );
        Envelope::command("DECLARE CURSOR")
    }

    fn fetch_or_move(&mut self, fetch: bool, words: &[&str], upper: &[String]) -> Envelope {
        let name = unquote(words.last().copied().unwrap_or(""));
        let Some(cursor) = self.cursors.get_mut(&name) else {
            return fail("34000", &format!("cursor \"{}\" does not exist", name));
        };
        let direction = upper.get(1).map(String::as_str).unwrap_or("");
        let amount = upper.get(2).map(String::as_str).unwrap_or("1");
        let count = if amount == "ALL" {
            usize::MAX
        } else {
            match amount.parse::<usize>() {
                Ok(n) => n,
                Err(_) => return fail("42601", "syntax error in FETCH/MOVE"),
            }
        };
        let values = match direction {
            // A zero count re-reads the current row without moving.
            "FORWARD" | "BACKWARD" if count == 0 => cursor.current(),
            "FORWARD" => cursor.forward(count),
            "BACKWARD" => {
                if !cursor.scroll {
                    return fail("55000", "cursor can only scan forward");
                }
                cursor.backward(count)
            }
            "ABSOLUTE" => {
                if !cursor.scroll && count < cursor.pos {
                    return fail("55000", "cursor can only scan forward");
                }
                cursor.pos = count.min(cursor.rows.len() + 1);
                if count >= 1 && count <= cursor.rows.len() {
                    vec![cursor.rows[count - 1]]
                } else {
                    Vec::new()
                }
            }
            _ => return fail("42601", "syntax error in FETCH/MOVE"),
        };
        if fetch {
            select(
                "generate_series",
                INT4,
                "FETCH",
                values.iter().map(i64::to_string).collect(),
            )
        } else {
            Envelope::command(format!("MOVE {}", values.len()))
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn send(&mut self, statement: &str, params: &[Option<String>]) -> Result<()> {
        self.check_alive()?;
        let server = Arc::clone(&self.server);
        let mut state = server.lock();
        state.statements.push(statement.to_string());
        let reply = self.execute(&mut state, &bind(statement, params));
        self.queued.push(reply);
        Ok(())
    }

    fn send_copy(&mut self, statement: &str, data: &[Bytes]) -> Result<()> {
        self.check_alive()?;
        let server = Arc::clone(&self.server);
        let mut state = server.lock();
        state.statements.push(statement.to_string());
        let envelope = self.copy_in(&mut state, statement, data);
        if envelope.error.is_some() {
            if let Some(tx) = self.tx.as_mut() {
                tx.failed = true;
            }
        }
        self.queued.push(Reply {
            statement: statement.to_string(),
            envelope,
            notices: Vec::new(),
            kill: false,
        });
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.check_alive()?;
        self.push_out();
        Ok(())
    }

    fn try_flush(&mut self) -> Result<()> {
        self.check_alive()?;
        self.push_out();
        Ok(())
    }

    async fn poll_response(&mut self) -> Result<Envelope> {
        self.check_alive()?;
        let gate = self.server.lock().gate.clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| Error::internal("mock gate closed"))?
                .forget();
        }
        let reply = self
            .flushed
            .pop_front()
            .ok_or_else(|| Error::internal("mock: response requested before flush"))?;
        self.server.lock().received += 1;
        if reply.kill {
            self.alive = false;
            return Err(lost());
        }
        self.notices.extend(reply.notices);
        Ok(reply.envelope)
    }

    async fn wait_for_events(&mut self, timeout: Duration) -> Result<()> {
        self.check_alive()?;
        // Like a real session, nothing is read at idle while responses are due.
        if !self.queued.is_empty() || !self.flushed.is_empty() {
            return Ok(());
        }
        let idle = self.notices.is_empty() && self.server.lock().notifications.is_empty();
        if idle && !timeout.is_zero() {
            tokio::time::sleep(timeout).await;
        }
        Ok(())
    }

    fn take_events(&mut self) -> Vec<Event> {
        let mut events: Vec<Event> = self.notices.drain(..).map(Event::Notice).collect();
        events.extend(
            self.server
                .lock()
                .notifications
                .drain(..)
                .map(Event::Notification),
        );
        events
    }

    fn is_connected(&self) -> bool {
        self.alive
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            backend_pid: self.pid,
            parameters: HashMap::from([("server_version".to_string(), "16.0".to_string())]),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.alive = false;
        Ok(())
    }
}
