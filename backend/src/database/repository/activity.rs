//! Activity record persistence

use crate::database::models::{ActivityKind, ActivityRecord, PageRequest};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqliteConnection;
use uuid::Uuid;

pub async fn insert_record(
    conn: &mut SqliteConnection,
    account_id: &str,
    kind: ActivityKind,
    detail: &Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO activity_records (id, account_id, kind, detail, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(account_id)
    .bind(kind)
    .bind(Json(detail))
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn delete_older_than(conn: &mut SqliteConnection, cutoff: DateTime<Utc>) -> Result<u64> {
    let rows = sqlx::query("DELETE FROM activity_records WHERE created_at < ?")
        .bind(cutoff)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    Ok(rows)
}

pub async fn list_for_account(
    conn: &mut SqliteConnection,
    account_id: &str,
    kind: Option<ActivityKind>,
    page: PageRequest,
) -> Result<(Vec<ActivityRecord>, i64)> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM activity_records WHERE account_id = ? AND (? IS NULL OR kind = ?)",
    )
    .bind(account_id)
    .bind(kind)
    .bind(kind)
    .fetch_one(&mut *conn)
    .await?;

    let records = sqlx::query_as::<_, ActivityRecord>(
        r#"
        SELECT * FROM activity_records
        WHERE account_id = ? AND (? IS NULL OR kind = ?)
        ORDER BY created_at DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(account_id)
    .bind(kind)
    .bind(kind)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    Ok((records, total))
}
