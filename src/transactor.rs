//! Retrying transaction driver.
//!
//! [`Transactor::run`] begins a transaction, hands it to the body, and
//! commits. Serialization failures and deadlocks restart the whole body in a
//! fresh transaction, up to a fixed number of attempts. Everything else,
//! including an in-doubt commit, is returned to the caller at once.
//!
//! Hooks observe the outcome: `on_abort` sees every failed attempt,
//! `on_doubt` an in-doubt commit and `on_commit` the successful one.
//!
//! ```ignore
//! let total = Transactor::new(5)
//!     .run(&mut conn, |tx| {
//!         Box::pin(async move {
//!             tx.exec("UPDATE account SET balance = balance - 10 WHERE id = 1", &[]).await?;
//!             let r = tx.exec("SELECT sum(balance) FROM account", &[]).await?;
//!             r.row(0)?.get::<i64>(0)
//!         })
//!     })
//!     .await?;
//! ```

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::transaction::{Transaction, TransactionOptions, TxState};

pub const DEFAULT_ATTEMPTS: usize = 3;

type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Clone)]
pub struct Transactor {
    attempts: usize,
    options: TransactionOptions,
    robust: bool,
    on_commit: Option<Arc<dyn Fn() + Send + Sync>>,
    on_abort: Option<ErrorHook>,
    on_doubt: Option<ErrorHook>,
}

impl fmt::Debug for Transactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transactor")
            .field("attempts", &self.attempts)
            .field("options", &self.options)
            .field("robust", &self.robust)
            .field("on_commit", &self.on_commit.is_some())
            .field("on_abort", &self.on_abort.is_some())
            .field("on_doubt", &self.on_doubt.is_some())
            .finish()
    }
}

impl Default for Transactor {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS)
    }
}

impl Transactor {
    /// A transactor that runs the body at most `attempts` times.
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts,
            options: TransactionOptions::default(),
            robust: false,
            on_commit: None,
            on_abort: None,
            on_doubt: None,
        }
    }

    /// Options for every transaction the transactor begins.
    pub fn options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    /// Use robust transactions, which settle a lost `COMMIT` when they can.
    pub fn robust(mut self) -> Self {
        self.robust = true;
        self
    }

    /// Called once after the body's work has been committed.
    pub fn on_commit<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_commit = Some(Arc::new(hook));
        self
    }

    /// Called with the error of every attempt that was rolled back.
    pub fn on_abort<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_abort = Some(Arc::new(hook));
        self
    }

    /// Called when the commit outcome is unknown.
    pub fn on_doubt<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_doubt = Some(Arc::new(hook));
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Run `body` in a transaction and commit, retrying recoverable failures.
    pub async fn run<T, F>(&self, conn: &mut Connection, mut body: F) -> Result<T>
    where
        F: for<'t> FnMut(&'t mut Transaction<'_>) -> BoxFuture<'t, Result<T>>,
    {
        if self.attempts == 0 {
            return Err(Error::argument("transactor needs at least one attempt"));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = if self.robust {
                conn.begin_robust(self.options.clone()).await?
            } else {
                conn.begin_with(self.options.clone()).await?
            };
            let outcome = match body(&mut tx).await {
                Ok(value) => finish(&mut tx).await.map(|()| value),
                Err(e) => Err(e),
            };
            let error = match outcome {
                Ok(value) => {
                    drop(tx);
                    if let Some(hook) = &self.on_commit {
                        hook();
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if tx.state() == TxState::InProgress {
                if let Err(abort_error) = tx.abort().await {
                    tracing::debug!(target: "pgcore::transactor", error = %abort_error, "abort after failed attempt failed");
                }
            }
            drop(tx);

            if error.kind() == ErrorKind::InDoubt {
                if let Some(hook) = &self.on_doubt {
                    hook(&error);
                }
                return Err(error);
            }
            if let Some(hook) = &self.on_abort {
                hook(&error);
            }
            if !error.is_recoverable() {
                return Err(error);
            }
            if attempt >= self.attempts {
                tracing::warn!(target: "pgcore::transactor", attempts = attempt, error = %error, "giving up");
                return Err(error);
            }
            tracing::warn!(target: "pgcore::transactor", attempt, max = self.attempts, error = %error, "recoverable failure, retrying");
        }
    }
}

/// Commit unless the body already ended the transaction itself.
async fn finish(tx: &mut Transaction<'_>) -> Result<()> {
    match tx.state() {
        TxState::InProgress => tx.commit().await,
        TxState::Committed => Ok(()),
        TxState::Aborted | TxState::NotStarted => Err(Error::usage(format!(
            "transactor body left {} without committable work",
            tx
        ))),
    }
}
