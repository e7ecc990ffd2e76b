//! Repository layer for database operations
//!
//! Data access is split per aggregate. Each submodule exposes free functions
//! that take a `&mut SqliteConnection`, so the same query runs either on a
//! pooled connection or inside a unit of work.

pub mod accounts;
pub mod activity;
pub mod categories;
pub mod comments;
pub mod documents;
pub mod ledger;
pub mod library_files;
pub mod ratings;

use crate::error::{AppError, Result};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by a unit-of-work closure, borrowing the transaction connection
pub type UnitFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

/// Which moderated rows a listing may return
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// Every row regardless of status
    All,
    /// Approved rows plus everything uploaded by this account
    ApprovedOrOwnedBy(String),
    ApprovedOnly,
}

impl Visibility {
    /// (restricted to approved, exempt owner) as bound into listing queries
    fn bounds(&self) -> (bool, Option<&str>) {
        match self {
            Visibility::All => (false, None),
            Visibility::ApprovedOrOwnedBy(owner) => (true, Some(owner.as_str())),
            Visibility::ApprovedOnly => (true, None),
        }
    }
}

/// Repository for database operations
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Borrow a pooled connection for reads and best-effort writes
    pub async fn connection(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Run `work` inside one transaction.
    ///
    /// Commits when the closure returns `Ok`, rolls back otherwise. Nothing
    /// written by a failed unit is visible afterwards.
    pub async fn unit_of_work<T, F>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> UnitFuture<'c, T> + Send,
    {
        let mut tx = self.pool.begin().await?;

        match work(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!("Rollback failed after {}: {}", e, rollback);
                }
                Err(e)
            }
        }
    }

    /// Run `work` as a unit of work, retrying when it loses a race.
    ///
    /// Only errors that report [`AppError::is_retryable`] are retried; each
    /// attempt re-reads state from scratch in a fresh transaction.
    pub async fn unit_of_work_retrying<T, F>(&self, attempts: u32, work: F) -> Result<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut SqliteConnection) -> UnitFuture<'c, T> + Send + Sync,
    {
        let attempts = attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.unit_of_work(|conn| work(conn)).await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::debug!("Unit of work attempt {} lost a race: {}", attempt, e);
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Unit of work gave up after {} attempts: {}", attempt, e);
                    return Err(match e {
                        AppError::ConcurrentUpdate(msg) => AppError::Conflict(msg),
                        other => other,
                    });
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::create_pool;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_test_repo() -> (Repository, TempDir) {
        let temp = TempDir::new().unwrap();
        let pool = create_pool(&temp.path().join("repo.db")).await.unwrap();
        (Repository::new(pool), temp)
    }

    async fn count_activity(repo: &Repository) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM activity_records")
            .fetch_one(repo.pool())
            .await
            .unwrap()
    }

    fn insert_activity<'a>(
        conn: &'a mut SqliteConnection,
        id: &'static str,
    ) -> UnitFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO activity_records (id, account_id, kind, detail, created_at)
                 VALUES (?, 'a', 'login', '{}', '2026-01-01')",
            )
            .bind(id)
            .execute(conn)
            .await?;
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_unit_of_work_commits() {
        let (repo, _temp) = create_test_repo().await;

        repo.unit_of_work(|conn| insert_activity(conn, "r1"))
            .await
            .unwrap();

        assert_eq!(count_activity(&repo).await, 1);
    }

    #[tokio::test]
    async fn test_unit_of_work_rolls_back_on_error() {
        let (repo, _temp) = create_test_repo().await;

        let result: Result<()> = repo
            .unit_of_work(|conn| {
                Box::pin(async move {
                    insert_activity(conn, "r1").await?;
                    Err(AppError::InvalidState("abort".into()))
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::InvalidState(_))));
        assert_eq!(count_activity(&repo).await, 0);
    }

    #[tokio::test]
    async fn test_retry_reports_conflict_when_exhausted() {
        let (repo, _temp) = create_test_repo().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = repo
            .unit_of_work_retrying(3, move |_conn| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Err(AppError::ConcurrentUpdate("stale".into())) })
            })
            .await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_non_retryable_errors() {
        let (repo, _temp) = create_test_repo().await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = repo
            .unit_of_work_retrying(5, move |_conn| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Err(AppError::Forbidden("no".into())) })
            })
            .await;

        assert!(matches!(result, Err(AppError::Forbidden(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
