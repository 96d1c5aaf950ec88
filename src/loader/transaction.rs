//! Serialized write scopes over the shared pool.
//!
//! A coordinator hands out at most one [`TransactionScope`] at a time. A second
//! `begin` while a scope is alive fails immediately with
//! [`LoaderError::NestedTransaction`]; nothing is queued. The scope releases the
//! coordinator on every exit path: `commit`, `rollback`, or drop (sqlx rolls back
//! an uncommitted transaction when it is dropped).

use crate::error::LoaderError;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Deadline for the whole scope, measured from `begin`
    pub timeout: Duration,
    /// Roll back when the callback of [`TransactionCoordinator::run`] fails.
    /// When false the statements that did succeed are committed.
    pub rollback_on_error: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TRANSACTION_TIMEOUT,
            rollback_on_error: true,
        }
    }
}

/// Resets the coordinator to idle when the scope goes away.
struct ActiveFlag(Arc<AtomicBool>);

impl Drop for ActiveFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    pool: SqlitePool,
    active: Arc<AtomicBool>,
}

impl TransactionCoordinator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> TransactionState {
        if self.active.load(Ordering::Acquire) {
            TransactionState::Active
        } else {
            TransactionState::Idle
        }
    }

    /// Acquire the write scope.
    ///
    /// Fails with `NestedTransaction` when a scope from this coordinator is still
    /// alive, and with `Timeout` when no connection is available before the deadline.
    pub async fn begin(&self, options: TransactionOptions) -> Result<TransactionScope, LoaderError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("rejected nested transaction request");
            return Err(LoaderError::NestedTransaction);
        }
        let flag = ActiveFlag(Arc::clone(&self.active));

        let started = Instant::now();
        let tx = match tokio::time::timeout(options.timeout, self.pool.begin()).await {
            Ok(tx) => tx?,
            Err(_) => return Err(LoaderError::timeout("transaction begin", options.timeout)),
        };

        log::debug!("transaction started (timeout {:?})", options.timeout);
        Ok(TransactionScope {
            tx,
            started,
            timeout: options.timeout,
            _flag: flag,
        })
    }

    /// Run `callback` inside a scope, committing on success.
    ///
    /// The callback is abandoned and the scope rolled back when it runs past
    /// `options.timeout`. Captured state must be owned, since the callback's
    /// future only borrows the connection.
    pub async fn run<T, F>(&self, options: TransactionOptions, callback: F) -> Result<T, LoaderError>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, LoaderError>>,
    {
        let mut scope = self.begin(options).await?;
        let remaining = scope.remaining();
        let outcome = tokio::time::timeout(remaining, callback(scope.connection())).await;

        match outcome {
            Ok(Ok(value)) => {
                scope.commit().await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if options.rollback_on_error {
                    log::warn!("transaction callback failed, rolling back: {}", err);
                    if let Err(rollback_err) = scope.rollback().await {
                        log::error!("rollback after failure also failed: {}", rollback_err);
                    }
                } else {
                    log::warn!("transaction callback failed, committing partial work: {}", err);
                    scope.commit().await?;
                }
                Err(err)
            }
            Err(_) => {
                log::warn!("transaction exceeded {:?}, rolling back", options.timeout);
                if let Err(rollback_err) = scope.rollback().await {
                    log::error!("rollback after timeout failed: {}", rollback_err);
                }
                Err(LoaderError::timeout("transaction", options.timeout))
            }
        }
    }
}

/// An active write scope. All statements issued through [`connection`](Self::connection)
/// belong to one SQLite transaction.
pub struct TransactionScope {
    tx: Transaction<'static, Sqlite>,
    started: Instant,
    timeout: Duration,
    _flag: ActiveFlag,
}

impl TransactionScope {
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    /// Fail with `Timeout` once the deadline has passed.
    pub fn check_deadline(&self, operation: &str) -> Result<(), LoaderError> {
        if self.is_expired() {
            return Err(LoaderError::timeout(operation, self.timeout));
        }
        Ok(())
    }

    /// Commit, unless the deadline has already passed, in which case roll back
    /// and report the timeout.
    pub async fn commit(self) -> Result<(), LoaderError> {
        let TransactionScope {
            tx,
            started,
            timeout,
            _flag,
        } = self;

        if started.elapsed() >= timeout {
            log::warn!("transaction deadline passed before commit, rolling back");
            tx.rollback().await?;
            return Err(LoaderError::timeout("transaction", timeout));
        }

        tx.commit().await?;
        log::debug!("transaction committed after {:?}", started.elapsed());
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), LoaderError> {
        let TransactionScope { tx, started, _flag, .. } = self;
        tx.rollback().await?;
        log::debug!("transaction rolled back after {:?}", started.elapsed());
        Ok(())
    }
}
