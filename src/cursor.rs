//! Server-side cursors.
//!
//! [`StreamCursor`] walks a result set in chunks, forward and (when declared
//! `SCROLL`) backward. [`StatelessCursor`] always declares a scrollable
//! cursor and addresses rows by absolute position, so every fetch is
//! independent of the previous one.
//!
//! Both hold a reactivation guard and are closed when dropped.

use std::fmt;

use crate::connection::ReactivationGuard;
use crate::convert::quote_ident;
use crate::error::{Error, ErrorKind, Result};
use crate::result::QueryResult;
use crate::transaction::{Transaction, TxState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Forward => "FORWARD",
            Self::Backward => "BACKWARD",
        }
    }
}

/// How a cursor is declared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorOptions {
    /// `SCROLL`: allow fetching backward.
    pub scroll: bool,
    /// `WITH HOLD`: keep the cursor past the end of the transaction.
    pub hold: bool,
}

impl CursorOptions {
    pub fn scroll(mut self) -> Self {
        self.scroll = true;
        self
    }

    pub fn hold(mut self) -> Self {
        self.hold = true;
        self
    }
}

fn cursor_state(message: String) -> Error {
    Error::new(ErrorKind::InvalidCursorState, message)
}

/// Name and lifetime bookkeeping shared by both cursor types.
struct Declared {
    name: String,
    options: CursorOptions,
    closed: bool,
    _guard: ReactivationGuard,
}

impl Declared {
    async fn declare(tx: &mut Transaction<'_>, query: &str, options: CursorOptions) -> Result<Self> {
        tx.ensure_in_progress("declare a cursor")?;
        let name = tx.conn_mut().unique_name("pgcore_cursor");
        let statement = format!(
            "DECLARE {} {} CURSOR {}FOR {}",
            quote_ident(&name),
            if options.scroll { "SCROLL" } else { "NO SCROLL" },
            if options.hold { "WITH HOLD " } else { "" },
            query
        );
        tx.exec_raw(&statement, &[]).await?;
        tracing::debug!(target: "pgcore::cursor", cursor = %name, scroll = options.scroll, "declared");
        let guard = tx.connection().avoid_reactivation();
        Ok(Self {
            name,
            options,
            closed: false,
            _guard: guard,
        })
    }

    fn check_usable(&self, tx: &Transaction<'_>) -> Result<()> {
        if self.closed {
            return Err(cursor_state(format!("cursor \"{}\" is closed", self.name)));
        }
        if tx.state() != TxState::InProgress {
            return Err(cursor_state(format!(
                "cursor \"{}\" is used outside its transaction",
                self.name
            )));
        }
        Ok(())
    }

    fn statement(&self, verb: &str, what: &str) -> String {
        let preposition = if verb == "FETCH" { "FROM" } else { "IN" };
        format!("{} {} {} {}", verb, what, preposition, quote_ident(&self.name))
    }

    async fn run(&self, tx: &mut Transaction<'_>, verb: &str, what: &str) -> Result<QueryResult> {
        tx.exec_raw(&self.statement(verb, what), &[]).await
    }

    /// `FETCH`/`MOVE` of zero rows. The server would re-read the current
    /// row, so it is answered here without moving the cursor.
    fn nothing(&self, verb: &str, direction: Direction) -> QueryResult {
        let what = format!("{} 0", direction.as_sql());
        QueryResult::empty(format!("{} 0", verb), &self.statement(verb, &what))
    }

    async fn close(&mut self, tx: &mut Transaction<'_>) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if tx.state() != TxState::InProgress {
            return Ok(());
        }
        let statement = format!("CLOSE {}", quote_ident(&self.name));
        tx.exec_raw(&statement, &[]).await.map(|_| ())
    }

    fn close_on_drop(&mut self, tx: &mut Transaction<'_>) {
        if !self.closed && tx.state() == TxState::InProgress {
            self.closed = true;
            let statement = format!("CLOSE {}", quote_ident(&self.name));
            tx.conn_mut().defer_discard(&statement);
        }
    }
}

// ============================================================================
// Stream cursor
// ============================================================================

/// A named cursor read in chunks.
pub struct StreamCursor<'t, 'c> {
    tx: &'t mut Transaction<'c>,
    declared: Declared,
    position: usize,
    at_end: bool,
    poisoned: bool,
}

impl<'c> Transaction<'c> {
    /// Declare a cursor over `query` in this transaction.
    pub async fn declare_cursor(&mut self, query: &str, options: CursorOptions) -> Result<StreamCursor<'_, 'c>> {
        StreamCursor::declare(self, query, options).await
    }

    /// Declare a scrollable cursor for absolute-position reads.
    pub async fn stateless_cursor(&mut self, query: &str) -> Result<StatelessCursor<'_, 'c>> {
        StatelessCursor::declare(self, query, false).await
    }
}

impl<'t, 'c> StreamCursor<'t, 'c> {
    pub async fn declare(tx: &'t mut Transaction<'c>, query: &str, options: CursorOptions) -> Result<Self> {
        let declared = Declared::declare(tx, query, options).await?;
        Ok(Self {
            tx,
            declared,
            position: 0,
            at_end: false,
            poisoned: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.declared.name
    }

    pub fn is_scroll(&self) -> bool {
        self.declared.options.scroll
    }

    /// Rows before the current position; 0 before the first row.
    pub fn position(&self) -> usize {
        self.position
    }

    /// True once a forward fetch came back short.
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    pub fn is_closed(&self) -> bool {
        self.declared.closed
    }

    /// Fetch up to `count` rows in `direction`.
    pub async fn fetch(&mut self, count: usize, direction: Direction) -> Result<QueryResult> {
        self.check_direction(direction)?;
        if count == 0 {
            return Ok(self.declared.nothing("FETCH", direction));
        }
        let result = self
            .declared
            .run(self.tx, "FETCH", &format!("{} {}", direction.as_sql(), count))
            .await?;
        self.advance(result.row_count(), count, direction);
        Ok(result)
    }

    /// Fetch every remaining row in `direction`.
    pub async fn fetch_all(&mut self, direction: Direction) -> Result<QueryResult> {
        self.check_direction(direction)?;
        let result = self
            .declared
            .run(self.tx, "FETCH", &format!("{} ALL", direction.as_sql()))
            .await?;
        self.advance(result.row_count(), usize::MAX, direction);
        Ok(result)
    }

    /// Skip up to `count` rows without reading them; returns rows skipped.
    pub async fn move_by(&mut self, count: usize, direction: Direction) -> Result<u64> {
        self.check_direction(direction)?;
        if count == 0 {
            return Ok(0);
        }
        let result = self
            .declared
            .run(self.tx, "MOVE", &format!("{} {}", direction.as_sql(), count))
            .await?;
        let moved = result.affected_rows();
        self.advance(moved as usize, count, direction);
        Ok(moved)
    }

    /// Close the cursor. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.declared.close(self.tx).await
    }

    fn check_direction(&mut self, direction: Direction) -> Result<()> {
        self.declared.check_usable(self.tx)?;
        if self.poisoned {
            return Err(cursor_state(format!(
                "cursor \"{}\" was used against its declared direction",
                self.declared.name
            )));
        }
        if direction == Direction::Backward && !self.declared.options.scroll {
            self.poisoned = true;
            return Err(cursor_state(format!(
                "cursor \"{}\" is declared NO SCROLL and cannot move backward",
                self.declared.name
            )));
        }
        Ok(())
    }

    fn advance(&mut self, rows: usize, requested: usize, direction: Direction) {
        match direction {
            Direction::Forward if rows < requested => {
                if !self.at_end {
                    self.position += rows + 1;
                }
                self.at_end = true;
            }
            Direction::Forward => self.position += rows,
            Direction::Backward => {
                self.at_end = false;
                self.position = if rows < requested {
                    0
                } else {
                    self.position.saturating_sub(rows)
                };
            }
        }
    }
}

impl Drop for StreamCursor<'_, '_> {
    fn drop(&mut self) {
        self.declared.close_on_drop(self.tx);
    }
}

impl fmt::Debug for StreamCursor<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCursor")
            .field("name", &self.declared.name)
            .field("scroll", &self.declared.options.scroll)
            .field("position", &self.position)
            .field("closed", &self.declared.closed)
            .finish()
    }
}

// ============================================================================
// Stateless cursor
// ============================================================================

/// A scrollable cursor read by absolute row index (0-based).
pub struct StatelessCursor<'t, 'c> {
    tx: &'t mut Transaction<'c>,
    declared: Declared,
    size: Option<usize>,
}

impl<'t, 'c> StatelessCursor<'t, 'c> {
    pub async fn declare(tx: &'t mut Transaction<'c>, query: &str, hold: bool) -> Result<Self> {
        let options = CursorOptions { scroll: true, hold };
        let declared = Declared::declare(tx, query, options).await?;
        Ok(Self {
            tx,
            declared,
            size: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.declared.name
    }

    /// Number of rows in the result set.
    pub async fn size(&mut self) -> Result<usize> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        self.declared.check_usable(self.tx)?;
        self.declared.run(self.tx, "MOVE", "ABSOLUTE 0").await?;
        let moved = self.declared.run(self.tx, "MOVE", "FORWARD ALL").await?;
        let size = moved.affected_rows() as usize;
        self.size = Some(size);
        Ok(size)
    }

    /// Up to `count` rows starting at row `position`.
    pub async fn fetch_at(&mut self, position: usize, count: usize) -> Result<QueryResult> {
        self.declared.check_usable(self.tx)?;
        if count == 0 {
            return Ok(self.declared.nothing("FETCH", Direction::Forward));
        }
        self.declared
            .run(self.tx, "MOVE", &format!("ABSOLUTE {}", position))
            .await?;
        self.declared
            .run(self.tx, "FETCH", &format!("FORWARD {}", count))
            .await
    }

    /// Rows `begin..end`; when `end < begin` the rows `end..begin` come back
    /// in reverse order.
    pub async fn retrieve(&mut self, begin: usize, end: usize) -> Result<QueryResult> {
        let size = self.size().await?;
        if begin > size || end > size {
            return Err(Error::range(format!(
                "cursor range {}..{} is outside 0..{}",
                begin, end, size
            )));
        }
        if begin <= end {
            return self.fetch_at(begin, end - begin).await;
        }
        self.declared
            .run(self.tx, "MOVE", &format!("ABSOLUTE {}", begin + 1))
            .await?;
        self.declared
            .run(self.tx, "FETCH", &format!("BACKWARD {}", begin - end))
            .await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.declared.close(self.tx).await
    }
}

impl Drop for StatelessCursor<'_, '_> {
    fn drop(&mut self) {
        self.declared.close_on_drop(self.tx);
    }
}

impl fmt::Debug for StatelessCursor<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatelessCursor")
            .field("name", &self.declared.name)
            .field("size", &self.size)
            .field("closed", &self.declared.closed)
            .finish()
    }
}
