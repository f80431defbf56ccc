//! Large objects, driven through the server-side `lo_*` functions.
//!
//! Every call is an ordinary statement in the enclosing transaction, so
//! large-object work commits or rolls back with it. Descriptors only live
//! until the transaction ends; a nontransaction cannot open one.

use std::io::SeekFrom;

use crate::convert::FromText;
use crate::error::{Error, Result};
use crate::transaction::{Transaction, TxState};

/// Server flag bits for `lo_open`.
const INV_WRITE: i32 = 0x0002_0000;
const INV_READ: i32 = 0x0004_0000;

/// How a large object is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    fn flags(self) -> i32 {
        match self {
            Self::Read => INV_READ,
            Self::Write => INV_WRITE,
            Self::ReadWrite => INV_READ | INV_WRITE,
        }
    }
}

/// Identity of a large object on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LargeObject {
    oid: u32,
}

impl LargeObject {
    /// Create a new, empty large object.
    pub async fn create(tx: &mut Transaction<'_>) -> Result<Self> {
        ensure_transactional(tx)?;
        let reply = tx.exec("SELECT lo_create($1)", &[&0i64]).await?;
        let oid = reply.row(0)?.get::<i64>(0)?;
        let oid = u32::try_from(oid)
            .map_err(|_| Error::range(format!("large object id {} out of range", oid)))?;
        tracing::debug!(target: "pgcore::largeobject", oid, "created");
        Ok(Self { oid })
    }

    /// Refer to an existing large object.
    pub fn from_oid(oid: u32) -> Self {
        Self { oid }
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    /// Open the object for reading and/or writing.
    pub async fn open<'t, 'c>(&self, tx: &'t mut Transaction<'c>, mode: OpenMode) -> Result<LargeObjectAccess<'t, 'c>> {
        ensure_transactional(tx)?;
        let reply = tx.exec("SELECT lo_open($1, $2)", &[&self.oid, &mode.flags()]).await?;
        let fd = reply.row(0)?.get::<i32>(0)?;
        Ok(LargeObjectAccess {
            tx,
            object: *self,
            fd,
            mode,
            closed: false,
        })
    }

    /// Delete the object from the server.
    pub async fn remove(self, tx: &mut Transaction<'_>) -> Result<()> {
        ensure_transactional(tx)?;
        tx.exec("SELECT lo_unlink($1)", &[&self.oid]).await?;
        tracing::debug!(target: "pgcore::largeobject", oid = self.oid, "removed");
        Ok(())
    }
}

fn ensure_transactional(tx: &Transaction<'_>) -> Result<()> {
    if tx.is_nontransaction() {
        return Err(Error::usage("large objects need a transaction, not a nontransaction"));
    }
    Ok(())
}

/// An open descriptor on a large object.
///
/// Borrows the transaction for as long as it is open. Dropping it without
/// [`LargeObjectAccess::close`] closes the descriptor in the background.
#[derive(Debug)]
pub struct LargeObjectAccess<'t, 'c> {
    tx: &'t mut Transaction<'c>,
    object: LargeObject,
    fd: i32,
    mode: OpenMode,
    closed: bool,
}

impl LargeObjectAccess<'_, '_> {
    pub fn object(&self) -> LargeObject {
        self.object
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Read up to `max` bytes from the current position.
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        let len = i32::try_from(max).map_err(|_| Error::range("read size exceeds 2 GiB"))?;
        let reply = self.tx.exec("SELECT loread($1, $2)", &[&self.fd, &len]).await?;
        let text = reply.row(0)?.get::<String>(0)?;
        Vec::<u8>::from_text(&text)
    }

    /// Read from the current position to the end.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        const BLOCK: usize = 64 * 1024;
        let mut out = Vec::new();
        loop {
            let block = self.read(BLOCK).await?;
            let done = block.len() < BLOCK;
            out.extend_from_slice(&block);
            if done {
                return Ok(out);
            }
        }
    }

    /// Write `data` at the current position; returns the bytes written.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let reply = self.tx.exec("SELECT lowrite($1, $2)", &[&self.fd, &data]).await?;
        let written = reply.row(0)?.get::<i64>(0)?;
        Ok(written.max(0) as usize)
    }

    /// Move the position; returns the new offset from the start.
    pub async fn seek(&mut self, to: SeekFrom) -> Result<u64> {
        let (offset, whence) = match to {
            SeekFrom::Start(n) => (
                i64::try_from(n).map_err(|_| Error::range("seek offset out of range"))?,
                0,
            ),
            SeekFrom::Current(n) => (n, 1),
            SeekFrom::End(n) => (n, 2),
        };
        let reply = self
            .tx
            .exec("SELECT lo_lseek64($1, $2, $3)", &[&self.fd, &offset, &whence])
            .await?;
        position(reply.row(0)?.get::<i64>(0)?)
    }

    /// Current offset from the start.
    pub async fn tell(&mut self) -> Result<u64> {
        let reply = self.tx.exec("SELECT lo_tell64($1)", &[&self.fd]).await?;
        position(reply.row(0)?.get::<i64>(0)?)
    }

    /// Cut or zero-extend the object to `len` bytes.
    pub async fn truncate(&mut self, len: u64) -> Result<()> {
        let len = i64::try_from(len).map_err(|_| Error::range("length out of range"))?;
        self.tx
            .exec("SELECT lo_truncate64($1, $2)", &[&self.fd, &len])
            .await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.tx.exec("SELECT lo_close($1)", &[&self.fd]).await?;
        Ok(())
    }
}

fn position(offset: i64) -> Result<u64> {
    u64::try_from(offset).map_err(|_| Error::internal(format!("server reported offset {}", offset)))
}

impl Drop for LargeObjectAccess<'_, '_> {
    fn drop(&mut self) {
        if self.closed || self.tx.state() != TxState::InProgress {
            return;
        }
        let statement = format!("SELECT lo_close({})", self.fd);
        self.tx.conn_mut().defer_discard(&statement);
    }
}
