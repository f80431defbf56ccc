//! Immutable query results and the lightweight views into them.
//!
//! A [`QueryResult`] is a reference-counted snapshot: cloning it, iterating
//! it or taking a [`Row`] or [`Field`] only bumps the count. Views store an
//! index plus a handle to the shared data, so they stay valid for as long as
//! any of them is alive and never copy cell data.

use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;

use crate::convert::FromText;
use crate::error::{Error, Result};
use crate::transport::{Column, Envelope, Oid, RawRow};

#[derive(Debug)]
struct ResultData {
    columns: Vec<Column>,
    rows: Vec<RawRow>,
    command_tag: String,
    query: String,
}

/// Completed result of one statement.
#[derive(Clone)]
pub struct QueryResult {
    data: Arc<ResultData>,
}

impl QueryResult {
    pub(crate) fn from_envelope(envelope: Envelope, query: &str) -> Self {
        Self {
            data: Arc::new(ResultData {
                columns: envelope.columns,
                rows: envelope.rows,
                command_tag: envelope.command_tag,
                query: query.to_string(),
            }),
        }
    }

    /// Result with no rows, answered without asking the server.
    pub(crate) fn empty(command_tag: impl Into<String>, query: &str) -> Self {
        Self::from_envelope(Envelope::command(command_tag), query)
    }

    pub fn row_count(&self) -> usize {
        self.data.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.data.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.rows.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.data.columns
    }

    /// Command tag reported by the server, e.g. `INSERT 0 5`.
    pub fn command_tag(&self) -> &str {
        &self.data.command_tag
    }

    /// The statement that produced this result.
    pub fn query(&self) -> &str {
        &self.data.query
    }

    /// Rows inserted, updated, deleted, selected, fetched or moved.
    pub fn affected_rows(&self) -> u64 {
        parse_rows_affected(&self.data.command_tag)
    }

    /// Index of the column called `name`.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.data
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::range(format!("unknown column '{}'", name)))
    }

    pub fn column_name(&self, col: usize) -> Result<&str> {
        self.check_column(col)?;
        Ok(&self.data.columns[col].name)
    }

    pub fn column_type(&self, col: usize) -> Result<Oid> {
        self.check_column(col)?;
        Ok(self.data.columns[col].type_oid)
    }

    pub fn row(&self, row: usize) -> Result<Row> {
        self.check_row(row)?;
        Ok(Row {
            result: self.clone(),
            index: row,
        })
    }

    /// Bounds-checked field view.
    pub fn at(&self, row: usize, col: usize) -> Result<Field> {
        self.check_row(row)?;
        self.check_column(col)?;
        Ok(Field {
            result: self.clone(),
            row,
            col,
        })
    }

    /// Iterate the rows. Every call starts again from the first row.
    pub fn iter(&self) -> Rows {
        Rows {
            result: self.clone(),
            front: 0,
            back: self.row_count(),
        }
    }

    fn check_row(&self, row: usize) -> Result<()> {
        if row >= self.row_count() {
            return Err(Error::range(format!(
                "row {} out of range (result has {} rows)",
                row,
                self.row_count()
            )));
        }
        Ok(())
    }

    fn check_column(&self, col: usize) -> Result<()> {
        if col >= self.column_count() {
            return Err(Error::range(format!(
                "column {} out of range (result has {} columns)",
                col,
                self.column_count()
            )));
        }
        Ok(())
    }

    /// Raw cell without column checks; `row` must be in range.
    pub(crate) fn cell(&self, row: usize, col: usize) -> Option<&[u8]> {
        self.data.rows[row]
            .get(col)
            .and_then(|cell| cell.as_deref())
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("query", &self.data.query)
            .field("command_tag", &self.data.command_tag)
            .field("rows", &self.row_count())
            .field("columns", &self.column_count())
            .finish()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = Row;
    type IntoIter = Rows;

    fn into_iter(self) -> Rows {
        self.iter()
    }
}

/// Row iterator over a [`QueryResult`]; double-ended for reverse traversal.
#[derive(Clone, Debug)]
pub struct Rows {
    result: QueryResult,
    front: usize,
    back: usize,
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        if self.front >= self.back {
            return None;
        }
        let row = Row {
            result: self.result.clone(),
            index: self.front,
        };
        self.front += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.back - self.front;
        (n, Some(n))
    }
}

impl DoubleEndedIterator for Rows {
    fn next_back(&mut self) -> Option<Row> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(Row {
            result: self.result.clone(),
            index: self.back,
        })
    }
}

impl ExactSizeIterator for Rows {}
impl FusedIterator for Rows {}

/// One row of a [`QueryResult`].
#[derive(Clone, Debug)]
pub struct Row {
    result: QueryResult,
    index: usize,
}

impl Row {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.result.column_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn at(&self, col: usize) -> Result<Field> {
        self.result.at(self.index, col)
    }

    /// Field by column name.
    pub fn field(&self, name: &str) -> Result<Field> {
        let col = self.result.column_index(name)?;
        self.at(col)
    }

    /// Convert the value in column `col`.
    pub fn get<T: FromText>(&self, col: usize) -> Result<T> {
        self.at(col)?.get()
    }

    /// Convert the value in the column called `name`.
    pub fn get_named<T: FromText>(&self, name: &str) -> Result<T> {
        self.field(name)?.get()
    }

    pub fn fields(&self) -> Fields {
        Fields {
            result: self.result.clone(),
            row: self.index,
            front: 0,
            back: self.len(),
        }
    }
}

/// Field iterator over a [`Row`].
#[derive(Clone, Debug)]
pub struct Fields {
    result: QueryResult,
    row: usize,
    front: usize,
    back: usize,
}

impl Iterator for Fields {
    type Item = Field;

    fn next(&mut self) -> Option<Field> {
        if self.front >= self.back {
            return None;
        }
        let field = Field {
            result: self.result.clone(),
            row: self.row,
            col: self.front,
        };
        self.front += 1;
        Some(field)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.back - self.front;
        (n, Some(n))
    }
}

impl DoubleEndedIterator for Fields {
    fn next_back(&mut self) -> Option<Field> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(Field {
            result: self.result.clone(),
            row: self.row,
            col: self.back,
        })
    }
}

impl ExactSizeIterator for Fields {}
impl FusedIterator for Fields {}

/// A single value at (row, column).
#[derive(Clone, Debug)]
pub struct Field {
    result: QueryResult,
    row: usize,
    col: usize,
}

impl Field {
    pub fn row(&self) -> usize {
        self.row
    }

    pub fn column(&self) -> usize {
        self.col
    }

    pub fn name(&self) -> &str {
        &self.result.data.columns[self.col].name
    }

    pub fn type_oid(&self) -> Oid {
        self.result.data.columns[self.col].type_oid
    }

    pub fn is_null(&self) -> bool {
        self.result.cell(self.row, self.col).is_none()
    }

    /// Raw bytes of the value, `None` for NULL.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.result.cell(self.row, self.col)
    }

    /// Text of the value, `None` for NULL.
    pub fn as_str(&self) -> Result<Option<&str>> {
        match self.as_bytes() {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(bytes).map(Some).map_err(|_| {
                Error::conversion(format!("column '{}' is not valid UTF-8", self.name()))
            }),
        }
    }

    /// Convert the value; NULL converts only into `Option<T>`.
    pub fn get<T: FromText>(&self) -> Result<T> {
        match self.as_str()? {
            Some(text) => T::from_text(text),
            None => T::from_null().ok_or_else(|| {
                Error::conversion(format!(
                    "column '{}' is null in row {}",
                    self.name(),
                    self.row
                ))
            }),
        }
    }
}

/// Parse rows affected from a PostgreSQL command tag.
fn parse_rows_affected(tag: &str) -> u64 {
    // - "INSERT 0 5" -> 5 rows
    // - "UPDATE 3", "DELETE 2", "SELECT 10", "FETCH 4", "MOVE 7", "COPY 1"
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["FETCH", n]
        | ["MOVE", n]
        | ["COPY", n]
        | ["MERGE", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}
