//! Activity recorder
//!
//! Best-effort audit trail. A failed write is logged and dropped; it never
//! fails or rolls back the operation being described.

use crate::database::models::{ActivityKind, ActivityRecord, PageRequest, Paged};
use crate::database::repository::activity as store;
use crate::database::Repository;
use crate::error::Result;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::{Connection, SqliteConnection};

#[derive(Clone)]
pub struct ActivityRecorder {
    repo: Repository,
}

impl ActivityRecorder {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Append a record on its own connection, outside any unit of work
    pub async fn record(&self, account_id: &str, kind: ActivityKind, detail: Value) {
        let written = async {
            let mut conn = self.repo.connection().await?;
            store::insert_record(&mut conn, account_id, kind, &detail).await
        }
        .await;

        if let Err(e) = written {
            tracing::warn!("Dropped {:?} activity for {}: {}", kind, account_id, e);
        }
    }

    /// Append a record inside the caller's unit of work.
    ///
    /// The write runs under a savepoint; on failure only the savepoint is
    /// rolled back and the surrounding transaction carries on.
    pub async fn record_in(
        conn: &mut SqliteConnection,
        account_id: &str,
        kind: ActivityKind,
        detail: Value,
    ) {
        let written = async {
            let mut savepoint = conn.begin().await?;
            store::insert_record(&mut *savepoint, account_id, kind, &detail).await?;
            savepoint.commit().await?;
            Ok::<_, crate::error::AppError>(())
        }
        .await;

        if let Err(e) = written {
            tracing::warn!("Dropped {:?} activity for {}: {}", kind, account_id, e);
        }
    }

    pub async fn list_for_account(
        &self,
        account_id: &str,
        kind: Option<ActivityKind>,
        page: PageRequest,
    ) -> Result<Paged<ActivityRecord>> {
        let mut conn = self.repo.connection().await?;
        let (records, total) = store::list_for_account(&mut conn, account_id, kind, page).await?;
        Ok(Paged::new(records, total, page))
    }

    /// Delete records older than the retention window; returns how many went
    pub async fn purge_expired(&self, retention_days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut conn = self.repo.connection().await?;
        let purged = store::delete_older_than(&mut conn, cutoff).await?;

        tracing::info!(
            "Purged {} activity records older than {} days",
            purged,
            retention_days
        );
        Ok(purged)
    }
}
