//! Bulk transfer with `COPY` in text format.
//!
//! A [`TableWriter`] collects rows on the client and sends them in one
//! `COPY … FROM STDIN` when completed; dropping it unfinished sends nothing.
//! A [`TableReader`] runs `COPY … TO STDOUT` and decodes the lines.

use bytes::{BufMut, Bytes, BytesMut};

use crate::convert::{quote_ident, ToText};
use crate::error::{Error, Result};
use crate::result::QueryResult;
use crate::transaction::Transaction;

/// Largest piece of row data handed to the transport at once.
const CHUNK_SIZE: usize = 64 * 1024;

/// One decoded row; `None` is SQL NULL.
pub type CopyRow = Vec<Option<String>>;

impl<'c> Transaction<'c> {
    /// Start writing rows into `table`.
    ///
    /// `columns` may be empty to mean every column in table order.
    pub fn table_writer(&mut self, table: &str, columns: &[&str]) -> Result<TableWriter<'_, 'c>> {
        self.ensure_in_progress("write to a table")?;
        let statement = copy_statement(table, columns, "FROM STDIN");
        Ok(TableWriter {
            tx: self,
            statement,
            buffer: BytesMut::new(),
            rows: 0,
            done: false,
        })
    }

    /// Read every row of `table` (or of `columns` in it).
    pub async fn table_reader(&mut self, table: &str, columns: &[&str]) -> Result<TableReader> {
        let statement = copy_statement(table, columns, "TO STDOUT");
        let result = self.exec_raw(&statement, &[]).await?;
        Ok(TableReader::new(result))
    }
}

fn copy_statement(table: &str, columns: &[&str], direction: &str) -> String {
    let mut statement = format!("COPY {}", quote_ident(table));
    if !columns.is_empty() {
        let list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        statement.push_str(&format!(" ({})", list.join(", ")));
    }
    statement.push(' ');
    statement.push_str(direction);
    statement
}

/// Rows headed for one table.
#[derive(Debug)]
pub struct TableWriter<'t, 'c> {
    tx: &'t mut Transaction<'c>,
    statement: String,
    buffer: BytesMut,
    rows: usize,
    done: bool,
}

impl TableWriter<'_, '_> {
    /// Append one row; each value's text form is escaped for `COPY`.
    pub fn write_row(&mut self, values: &[&(dyn ToText + Sync)]) -> Result<()> {
        self.ensure_open()?;
        let fields: Vec<Option<String>> = values.iter().map(|v| v.to_text()).collect();
        encode_row(&fields, &mut self.buffer);
        self.rows += 1;
        Ok(())
    }

    /// Append one line that is already in `COPY` text format.
    ///
    /// The line must not contain an unescaped newline.
    pub fn write_raw_line(&mut self, line: &str) -> Result<()> {
        self.ensure_open()?;
        if line.contains('\n') {
            return Err(Error::argument("a COPY line cannot contain a newline"));
        }
        self.buffer.put_slice(line.as_bytes());
        self.buffer.put_u8(b'\n');
        self.rows += 1;
        Ok(())
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Send every row to the server; returns the number of rows copied.
    ///
    /// A failure aborts the transaction like any failed statement.
    pub async fn complete(mut self) -> Result<u64> {
        self.ensure_open()?;
        self.done = true;
        let mut data = std::mem::take(&mut self.buffer);
        let mut chunks = Vec::with_capacity(data.len() / CHUNK_SIZE + 1);
        while !data.is_empty() {
            let at = data.len().min(CHUNK_SIZE);
            chunks.push(data.split_to(at).freeze());
        }
        let result = self.tx.exec_copy(&self.statement, &chunks).await?;
        tracing::debug!(target: "pgcore::copy", statement = %self.statement, rows = self.rows, "copy complete");
        Ok(result.affected_rows())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.done {
            return Err(Error::usage("table writer is already complete"));
        }
        Ok(())
    }
}

impl Drop for TableWriter<'_, '_> {
    fn drop(&mut self) {
        if !self.done && self.rows > 0 {
            tracing::debug!(target: "pgcore::copy", statement = %self.statement, rows = self.rows, "table writer dropped; rows discarded");
        }
    }
}

/// Rows read from a table by `COPY … TO STDOUT`.
#[derive(Debug)]
pub struct TableReader {
    lines: Vec<Option<Bytes>>,
    next: usize,
}

impl TableReader {
    fn new(result: QueryResult) -> Self {
        let lines = (0..result.row_count())
            .map(|i| result.cell(i, 0).map(Bytes::copy_from_slice))
            .collect();
        Self { lines, next: 0 }
    }

    /// Rows not yet read.
    pub fn remaining(&self) -> usize {
        self.lines.len() - self.next
    }

    /// Read the next row as raw `COPY` text, without the line break.
    pub fn next_raw_line(&mut self) -> Option<String> {
        let line = self.lines.get(self.next)?.clone();
        self.next += 1;
        let line = line.unwrap_or_default();
        let line = line.strip_suffix(b"\n").unwrap_or(&line);
        Some(String::from_utf8_lossy(line).into_owned())
    }
}

impl Iterator for TableReader {
    type Item = Result<CopyRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.lines.get(self.next)?.clone();
        self.next += 1;
        Some(decode_row(&line.unwrap_or_default()))
    }
}

/// Append one text-format row, terminated by a newline.
pub(crate) fn encode_row(fields: &[Option<String>], out: &mut BytesMut) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.put_u8(b'\t');
        }
        let Some(text) = field else {
            out.put_slice(b"\\N");
            continue;
        };
        for byte in text.bytes() {
            match byte {
                b'\\' => out.put_slice(b"\\\\"),
                b'\t' => out.put_slice(b"\\t"),
                b'\n' => out.put_slice(b"\\n"),
                b'\r' => out.put_slice(b"\\r"),
                other => out.put_u8(other),
            }
        }
    }
    out.put_u8(b'\n');
}

/// Split one text-format line into fields, undoing the escapes.
pub fn decode_row(line: &[u8]) -> Result<CopyRow> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let mut fields = Vec::new();
    for raw in line.split(|b| *b == b'\t') {
        if raw == b"\\N" {
            fields.push(None);
            continue;
        }
        let mut out = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            if raw[i] != b'\\' {
                out.push(raw[i]);
                i += 1;
                continue;
            }
            let Some(&escaped) = raw.get(i + 1) else {
                return Err(Error::conversion("COPY line ends in a lone backslash"));
            };
            i += 2;
            match escaped {
                b'b' => out.push(0x08),
                b'f' => out.push(0x0c),
                b'n' => out.push(b'\n'),
                b'r' => out.push(b'\r'),
                b't' => out.push(b'\t'),
                b'v' => out.push(0x0b),
                b'0'..=b'7' => {
                    let mut value = u32::from(escaped - b'0');
                    let mut digits = 1;
                    while digits < 3 {
                        match raw.get(i) {
                            Some(d @ b'0'..=b'7') => {
                                value = value * 8 + u32::from(d - b'0');
                                i += 1;
                                digits += 1;
                            }
                            _ => break,
                        }
                    }
                    out.push((value & 0xff) as u8);
                }
                b'x' => {
                    let mut value = 0u32;
                    let mut digits = 0;
                    while digits < 2 {
                        match raw.get(i).and_then(|d| (*d as char).to_digit(16)) {
                            Some(d) => {
                                value = value * 16 + d;
                                i += 1;
                                digits += 1;
                            }
                            None => break,
                        }
                    }
                    if digits == 0 {
                        out.push(b'x');
                    } else {
                        out.push(value as u8);
                    }
                }
                other => out.push(other),
            }
        }
        let text = String::from_utf8(out)
            .map_err(|_| Error::conversion("COPY field is not valid UTF-8"))?;
        fields.push(Some(text));
    }
    Ok(fields)
}
