//! Pipelined query execution.
//!
//! A [`Pipeline`] sends statements without waiting for their results. The
//! server answers strictly in submission order; results asked for out of
//! order are buffered until retrieved.
//!
//! At most `high_water_mark` statements are in flight at once. Inserting
//! beyond that first reads (and buffers) the oldest outstanding response.
//!
//! The first failing statement aborts the pipeline: everything still in
//! flight is read and thrown away, the owning transaction is marked aborted,
//! and every later retrieval or insert returns that error. Results of
//! statements issued before the failure can still be retrieved.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::connection::ReactivationGuard;
use crate::convert::ToText;
use crate::error::{Error, Result};
use crate::result::QueryResult;
use crate::transaction::Transaction;

pub const DEFAULT_HIGH_WATER_MARK: usize = 64;

/// Identifies a statement inserted into a [`Pipeline`]. Ids increase in
/// insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(u64);

impl QueryId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct Pipeline<'t, 'c> {
    tx: &'t mut Transaction<'c>,
    in_flight: VecDeque<(QueryId, String)>,
    completed: BTreeMap<QueryId, QueryResult>,
    next_id: u64,
    high_water_mark: usize,
    failure: Option<(QueryId, Error)>,
    _guard: ReactivationGuard,
}

impl<'c> Transaction<'c> {
    /// Open a pipeline with the default high-water mark.
    pub fn pipeline(&mut self) -> Result<Pipeline<'_, 'c>> {
        Pipeline::new(self, DEFAULT_HIGH_WATER_MARK)
    }
}

impl<'t, 'c> Pipeline<'t, 'c> {
    pub fn new(tx: &'t mut Transaction<'c>, high_water_mark: usize) -> Result<Self> {
        if high_water_mark == 0 {
            return Err(Error::argument("pipeline high-water mark must be at least 1"));
        }
        tx.ensure_in_progress("open a pipeline")?;
        let guard = tx.connection().avoid_reactivation();
        Ok(Self {
            tx,
            in_flight: VecDeque::new(),
            completed: BTreeMap::new(),
            next_id: 0,
            high_water_mark,
            failure: None,
            _guard: guard,
        })
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Statements sent whose responses have not been read yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// True when nothing is in flight or waiting to be retrieved.
    pub fn is_finished(&self) -> bool {
        self.in_flight.is_empty() && self.completed.is_empty()
    }

    pub fn is_aborted(&self) -> bool {
        self.failure.is_some()
    }

    /// Send a statement; returns its id without waiting for the result.
    pub async fn insert(&mut self, sql: &str) -> Result<QueryId> {
        self.insert_raw(sql, &[]).await
    }

    pub async fn insert_with(&mut self, sql: &str, params: &[&(dyn ToText + Sync)]) -> Result<QueryId> {
        let params: Vec<Option<String>> = params.iter().map(|p| p.to_text()).collect();
        self.insert_raw(sql, &params).await
    }

    async fn insert_raw(&mut self, sql: &str, params: &[Option<String>]) -> Result<QueryId> {
        if let Some((_, e)) = &self.failure {
            return Err(e.clone());
        }
        self.tx.ensure_in_progress("insert into a pipeline")?;

        while self.in_flight.len() >= self.high_water_mark {
            self.receive_oldest().await;
            if let Some((_, e)) = &self.failure {
                return Err(e.clone());
            }
        }

        let id = QueryId(self.next_id);
        let conn = self.tx.conn_mut();
        let dispatched = match conn.ensure_active(false).await {
            Ok(()) => match conn.queue(sql, params) {
                Ok(()) => conn.flush().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        self.next_id += 1;
        match dispatched {
            Ok(()) => {
                tracing::trace!(target: "pgcore::pipeline", id = id.0, sql, "inserted");
                self.in_flight.push_back((id, sql.to_string()));
                Ok(id)
            }
            Err(e) => {
                let e = e.with_query(sql);
                self.abort_at(id, e.clone()).await;
                Err(e)
            }
        }
    }

    /// Result of statement `id`, buffering the results of earlier ones.
    pub async fn retrieve(&mut self, id: QueryId) -> Result<QueryResult> {
        if id.0 >= self.next_id {
            return Err(Error::usage(format!("pipeline query {} has not been issued", id)));
        }
        loop {
            if let Some(result) = self.completed.remove(&id) {
                return Ok(result);
            }
            if let Some((failed, e)) = &self.failure {
                if id >= *failed {
                    return Err(e.clone());
                }
            }
            let oldest = self.in_flight.front().map(|(oldest, _)| *oldest);
            match oldest {
                Some(oldest) if oldest <= id => self.receive_oldest().await,
                _ => {
                    return Err(Error::usage(format!(
                        "pipeline query {} was already retrieved",
                        id
                    )))
                }
            }
        }
    }

    /// The oldest result not yet retrieved.
    pub async fn retrieve_any(&mut self) -> Result<(QueryId, QueryResult)> {
        loop {
            if let Some(entry) = self.completed.pop_first() {
                return Ok(entry);
            }
            if let Some((_, e)) = &self.failure {
                return Err(e.clone());
            }
            if self.in_flight.is_empty() {
                return Err(Error::usage("pipeline has no outstanding queries"));
            }
            self.receive_oldest().await;
        }
    }

    /// Wait for everything in flight and discard all unretrieved results.
    ///
    /// Returns the error that aborted the pipeline, if any.
    pub async fn complete(&mut self) -> Result<()> {
        while !self.in_flight.is_empty() {
            self.receive_oldest().await;
        }
        self.completed.clear();
        match &self.failure {
            Some((_, e)) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Read the oldest in-flight response into the buffer, aborting the
    /// pipeline if it failed.
    async fn receive_oldest(&mut self) {
        let Some((id, sql)) = self.in_flight.front().cloned() else {
            return;
        };
        let conn = self.tx.conn_mut();
        let earlier = conn.drain_backlog().await;
        let own = conn.receive(&sql).await;
        self.in_flight.pop_front();
        let outcome = match earlier {
            Err(e) => Err(e),
            Ok(()) => own,
        };
        match outcome {
            Ok(result) => {
                self.completed.insert(id, result);
            }
            Err(e) => self.abort_at(id, e).await,
        }
    }

    async fn abort_at(&mut self, id: QueryId, error: Error) {
        tracing::warn!(target: "pgcore::pipeline", id = id.0, error = %error, discarded = self.in_flight.len(), "pipeline aborted");
        let conn = self.tx.conn_mut();
        while let Some((_, sql)) = self.in_flight.pop_front() {
            if let Err(e) = conn.receive(&sql).await {
                if e.is_broken_connection() {
                    self.in_flight.clear();
                    break;
                }
            }
        }
        self.failure = Some((id, error));
        self.tx.fail();
    }
}

impl Drop for Pipeline<'_, '_> {
    fn drop(&mut self) {
        if !self.in_flight.is_empty() {
            tracing::debug!(target: "pgcore::pipeline", discarded = self.in_flight.len(), "pipeline dropped with queries in flight");
            let count = self.in_flight.len();
            self.tx.conn_mut().discard_responses(count, "pipelined query");
        }
    }
}

impl fmt::Debug for Pipeline<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("in_flight", &self.in_flight.len())
            .field("buffered", &self.completed.len())
            .field("high_water_mark", &self.high_water_mark)
            .field("aborted", &self.failure.is_some())
            .finish()
    }
}
