//! PostgreSQL v3 frontend/backend messages.
//!
//! Only the text format is spoken: parameters go out as text and every
//! result column comes back as text. Reference:
//! <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::transport::{Column, ServerError};

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608;

fn protocol_error(what: impl std::fmt::Display) -> Error {
    Error::broken(format!("protocol error: {}", what))
}

// ============================================================================
// Frontend messages
// ============================================================================

/// Messages the client sends.
#[derive(Debug, Clone)]
pub enum Frontend<'a> {
    Startup {
        user: &'a str,
        database: &'a str,
        application_name: Option<&'a str>,
    },
    Password(&'a str),
    SaslInitialResponse {
        mechanism: &'a str,
        data: &'a [u8],
    },
    SaslResponse(&'a [u8]),
    Query(&'a str),
    Parse {
        name: &'a str,
        query: &'a str,
    },
    Bind {
        statement: &'a str,
        params: &'a [Option<String>],
    },
    DescribePortal,
    Execute,
    CloseStatement(&'a str),
    CopyData(&'a [u8]),
    CopyDone,
    Sync,
    Terminate,
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

impl Frontend<'_> {
    /// Append the encoded message to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        let mut body = BytesMut::new();
        let tag = match self {
            Frontend::Startup {
                user,
                database,
                application_name,
            } => {
                body.put_i32(PROTOCOL_VERSION);
                put_cstr(&mut body, "user");
                put_cstr(&mut body, user);
                put_cstr(&mut body, "database");
                put_cstr(&mut body, database);
                if let Some(name) = application_name {
                    put_cstr(&mut body, "application_name");
                    put_cstr(&mut body, name);
                }
                put_cstr(&mut body, "client_encoding");
                put_cstr(&mut body, "UTF8");
                body.put_u8(0);
                None
            }
            Frontend::Password(password) => {
                put_cstr(&mut body, password);
                Some(b'p')
            }
            Frontend::SaslInitialResponse { mechanism, data } => {
                put_cstr(&mut body, mechanism);
                body.put_i32(data.len() as i32);
                body.put_slice(data);
                Some(b'p')
            }
            Frontend::SaslResponse(data) => {
                body.put_slice(data);
                Some(b'p')
            }
            Frontend::Query(query) => {
                put_cstr(&mut body, query);
                Some(b'Q')
            }
            Frontend::Parse { name, query } => {
                put_cstr(&mut body, name);
                put_cstr(&mut body, query);
                // Let the server infer every parameter type.
                body.put_i16(0);
                Some(b'P')
            }
            Frontend::Bind { statement, params } => {
                put_cstr(&mut body, "");
                put_cstr(&mut body, statement);
                // All parameters in text format.
                body.put_i16(0);
                body.put_i16(params.len() as i16);
                for param in params.iter() {
                    match param {
                        Some(text) => {
                            body.put_i32(text.len() as i32);
                            body.put_slice(text.as_bytes());
                        }
                        None => body.put_i32(-1),
                    }
                }
                // All result columns in text format.
                body.put_i16(0);
                Some(b'B')
            }
            Frontend::DescribePortal => {
                body.put_u8(b'P');
                put_cstr(&mut body, "");
                Some(b'D')
            }
            Frontend::Execute => {
                put_cstr(&mut body, "");
                body.put_i32(0);
                Some(b'E')
            }
            Frontend::CloseStatement(name) => {
                body.put_u8(b'S');
                put_cstr(&mut body, name);
                Some(b'C')
            }
            Frontend::CopyData(data) => {
                body.put_slice(data);
                Some(b'd')
            }
            Frontend::CopyDone => Some(b'c'),
            Frontend::Sync => Some(b'S'),
            Frontend::Terminate => Some(b'X'),
        };

        if let Some(tag) = tag {
            out.put_u8(tag);
        }
        out.put_i32(body.len() as i32 + 4);
        out.put_slice(&body);
    }
}

// ============================================================================
// Backend messages
// ============================================================================

/// Transaction status reported with ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

/// Authentication request from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue(Bytes),
    SaslFinal(Bytes),
}

/// Messages the server sends.
#[derive(Debug, Clone)]
pub enum Backend {
    Authentication(Authentication),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<Column>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription,
    CopyInResponse,
    CopyOutResponse,
    CopyData(Bytes),
    CopyDone,
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

/// Split one complete message off the front of `buf`.
///
/// Returns `Ok(None)` while the buffer holds only part of a message.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Backend>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(protocol_error(format!("invalid message length {}", len)));
    }
    let total = 1 + len as usize;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(total).freeze();
    let tag = frame.get_u8();
    frame.advance(4);
    Backend::parse(tag, Reader(frame)).map(Some)
}

impl Backend {
    fn parse(tag: u8, mut r: Reader) -> Result<Self> {
        let msg = match tag {
            b'R' => Backend::Authentication(parse_auth(&mut r)?),
            b'S' => Backend::ParameterStatus {
                name: r.cstr()?,
                value: r.cstr()?,
            },
            b'K' => Backend::BackendKeyData {
                process_id: r.i32()?,
                secret_key: r.i32()?,
            },
            b'Z' => Backend::ReadyForQuery(match r.u8()? {
                b'T' => TransactionStatus::InTransaction,
                b'E' => TransactionStatus::Failed,
                _ => TransactionStatus::Idle,
            }),
            b'T' => {
                let count = r.i16()?.max(0) as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = r.cstr()?;
                    // table oid, attribute number
                    r.skip(6)?;
                    let type_oid = r.i32()? as u32;
                    // type size, type modifier, format code
                    r.skip(8)?;
                    columns.push(Column::new(name, type_oid));
                }
                Backend::RowDescription(columns)
            }
            b'D' => {
                let count = r.i16()?.max(0) as usize;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = r.i32()?;
                    values.push(if len < 0 {
                        None
                    } else {
                        Some(r.bytes(len as usize)?)
                    });
                }
                Backend::DataRow(values)
            }
            b'C' => Backend::CommandComplete(r.cstr()?),
            b'I' => Backend::EmptyQueryResponse,
            b'1' => Backend::ParseComplete,
            b'2' => Backend::BindComplete,
            b'3' => Backend::CloseComplete,
            b'n' => Backend::NoData,
            b's' => Backend::PortalSuspended,
            b't' => Backend::ParameterDescription,
            b'G' => Backend::CopyInResponse,
            b'H' => Backend::CopyOutResponse,
            b'd' => Backend::CopyData(r.rest()),
            b'c' => Backend::CopyDone,
            b'E' => Backend::ErrorResponse(server_error(r.fields()?)),
            b'N' => Backend::NoticeResponse(server_error(r.fields()?)),
            b'A' => Backend::NotificationResponse {
                process_id: r.i32()?,
                channel: r.cstr()?,
                payload: r.cstr()?,
            },
            other => {
                return Err(protocol_error(format!(
                    "unexpected message type '{}'",
                    other as char
                )))
            }
        };
        Ok(msg)
    }
}

fn parse_auth(r: &mut Reader) -> Result<Authentication> {
    Ok(match r.i32()? {
        0 => Authentication::Ok,
        3 => Authentication::CleartextPassword,
        5 => {
            let mut salt = [0u8; 4];
            salt.copy_from_slice(&r.bytes(4)?);
            Authentication::Md5Password { salt }
        }
        10 => {
            let mut mechanisms = Vec::new();
            while r.remaining() > 0 {
                let mechanism = r.cstr()?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            Authentication::Sasl { mechanisms }
        }
        11 => Authentication::SaslContinue(r.rest()),
        12 => Authentication::SaslFinal(r.rest()),
        other => {
            return Err(Error::broken(format!(
                "unsupported authentication method {}",
                other
            )))
        }
    })
}

fn server_error(mut fields: HashMap<u8, String>) -> ServerError {
    ServerError {
        severity: fields.remove(&b'S').unwrap_or_default(),
        code: fields.remove(&b'C').unwrap_or_default(),
        message: fields.remove(&b'M').unwrap_or_default(),
        detail: fields.remove(&b'D'),
        hint: fields.remove(&b'H'),
    }
}

/// Bounds-checked reader over a message body.
struct Reader(Bytes);

impl Reader {
    fn need(&self, n: usize) -> Result<()> {
        if self.0.remaining() < n {
            return Err(protocol_error("message body too short"));
        }
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.0.remaining()
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.0.get_u8())
    }

    fn i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.0.get_i16())
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.0.get_i32())
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.need(n)?;
        self.0.advance(n);
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.0.split_to(n))
    }

    fn rest(&mut self) -> Bytes {
        self.0.split_off(0)
    }

    fn cstr(&mut self) -> Result<String> {
        let end = self
            .0
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| protocol_error("missing string terminator"))?;
        let raw = self.0.split_to(end);
        self.0.advance(1);
        Ok(match std::str::from_utf8(&raw) {
            Ok(s) => s.to_owned(),
            Err(_) => String::from_utf8_lossy(&raw).into_owned(),
        })
    }

    fn fields(&mut self) -> Result<HashMap<u8, String>> {
        let mut fields = HashMap::new();
        while self.remaining() > 0 {
            let code = self.u8()?;
            if code == 0 {
                break;
            }
            fields.insert(code, self.cstr()?);
        }
        Ok(fields)
    }
}
