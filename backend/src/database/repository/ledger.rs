//! Ledger persistence
//!
//! [`apply_entry`] is the only writer of `accounts.balance`. It reads the
//! balance, swaps it with a compare-and-swap update and appends the entry
//! that explains the change, all on the caller's transaction.

use crate::database::models::{
    EntryDetail, EntryKind, EntryStatus, KindTotal, LedgerEntry, LedgerFilter, PageRequest,
};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

pub async fn current_balance(conn: &mut SqliteConnection, account_id: &str) -> Result<i64> {
    sqlx::query_scalar("SELECT balance FROM accounts WHERE id = ?")
        .bind(account_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("Account", account_id))
}

/// Move `amount` into (or out of, when negative) an account and record it.
///
/// Fails with `InsufficientFunds` when the balance would go negative and with
/// `ConcurrentUpdate` when the balance changed after it was read.
pub async fn apply_entry(
    conn: &mut SqliteConnection,
    account_id: &str,
    kind: EntryKind,
    amount: i64,
    description: &str,
    detail: &EntryDetail,
) -> Result<LedgerEntry> {
    let balance_before = current_balance(conn, account_id).await?;
    let balance_after = balance_before + amount;

    if balance_after < 0 {
        return Err(AppError::InsufficientFunds {
            required: -amount,
            current: balance_before,
            deficit: -balance_after,
        });
    }

    let now = Utc::now();

    let swapped = sqlx::query(
        "UPDATE accounts SET balance = ?, updated_at = ? WHERE id = ? AND balance = ?",
    )
    .bind(balance_after)
    .bind(now)
    .bind(account_id)
    .bind(balance_before)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if swapped == 0 {
        return Err(AppError::ConcurrentUpdate(format!(
            "Balance of account {} changed during update",
            account_id
        )));
    }

    let id = Uuid::new_v4().to_string();

    let entry = sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO ledger_entries (id, account_id, kind, amount, balance_before, balance_after,
                                    description, document_id, attachment_id, library_file_id,
                                    external_ref, payment_method, reference_entry_id, status,
                                    created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(&id)
    .bind(account_id)
    .bind(kind)
    .bind(amount)
    .bind(balance_before)
    .bind(balance_after)
    .bind(description)
    .bind(&detail.document_id)
    .bind(&detail.attachment_id)
    .bind(&detail.library_file_id)
    .bind(&detail.external_ref)
    .bind(&detail.payment_method)
    .bind(&detail.reference_entry_id)
    .bind(EntryStatus::Completed)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    tracing::debug!(
        "Ledger entry {} ({:?}) on {}: {} -> {}",
        id,
        kind,
        account_id,
        balance_before,
        balance_after
    );
    Ok(entry)
}

pub async fn get_entry(conn: &mut SqliteConnection, id: &str) -> Result<LedgerEntry> {
    sqlx::query_as::<_, LedgerEntry>("SELECT * FROM ledger_entries WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("LedgerEntry", id))
}

pub async fn find_document_purchase(
    conn: &mut SqliteConnection,
    account_id: &str,
    document_id: &str,
) -> Result<Option<LedgerEntry>> {
    let entry = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT * FROM ledger_entries
        WHERE account_id = ? AND document_id = ? AND kind = 'purchase' AND status = 'completed'
        LIMIT 1
        "#,
    )
    .bind(account_id)
    .bind(document_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(entry)
}

pub async fn find_file_purchase(
    conn: &mut SqliteConnection,
    account_id: &str,
    library_file_id: &str,
) -> Result<Option<LedgerEntry>> {
    let entry = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT * FROM ledger_entries
        WHERE account_id = ? AND library_file_id = ? AND kind = 'purchase' AND status = 'completed'
        LIMIT 1
        "#,
    )
    .bind(account_id)
    .bind(library_file_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(entry)
}

pub async fn find_refund_of(
    conn: &mut SqliteConnection,
    entry_id: &str,
) -> Result<Option<LedgerEntry>> {
    let entry = sqlx::query_as::<_, LedgerEntry>(
        "SELECT * FROM ledger_entries WHERE reference_entry_id = ? AND kind = 'refund' LIMIT 1",
    )
    .bind(entry_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(entry)
}

/// Entries of one account, or of every account when `account_id` is `None`
pub async fn list_entries(
    conn: &mut SqliteConnection,
    account_id: Option<&str>,
    filter: &LedgerFilter,
    page: PageRequest,
) -> Result<(Vec<LedgerEntry>, i64)> {
    const WHERE: &str = r#"
        WHERE (? IS NULL OR account_id = ?)
          AND (? IS NULL OR kind = ?)
          AND (? IS NULL OR status = ?)
          AND (? IS NULL OR created_at >= ?)
          AND (? IS NULL OR created_at <= ?)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM ledger_entries {}", WHERE))
        .bind(account_id)
        .bind(account_id)
        .bind(filter.kind)
        .bind(filter.kind)
        .bind(filter.status)
        .bind(filter.status)
        .bind(filter.from)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.to)
        .fetch_one(&mut *conn)
        .await?;

    let entries = sqlx::query_as::<_, LedgerEntry>(&format!(
        "SELECT * FROM ledger_entries {} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        WHERE
    ))
    .bind(account_id)
    .bind(account_id)
    .bind(filter.kind)
    .bind(filter.kind)
    .bind(filter.status)
    .bind(filter.status)
    .bind(filter.from)
    .bind(filter.from)
    .bind(filter.to)
    .bind(filter.to)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    Ok((entries, total))
}

/// Completed totals per entry kind, for one account or all of them
pub async fn totals_by_kind(
    conn: &mut SqliteConnection,
    account_id: Option<&str>,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<KindTotal>> {
    let totals = sqlx::query_as::<_, KindTotal>(
        r#"
        SELECT kind, SUM(amount) AS total, COUNT(*) AS count
        FROM ledger_entries
        WHERE status = 'completed'
          AND (? IS NULL OR account_id = ?)
          AND (? IS NULL OR created_at >= ?)
        GROUP BY kind
        ORDER BY kind
        "#,
    )
    .bind(account_id)
    .bind(account_id)
    .bind(since)
    .bind(since)
    .fetch_all(&mut *conn)
    .await?;

    Ok(totals)
}

/// Sum of every completed entry of an account
pub async fn ledger_sum(conn: &mut SqliteConnection, account_id: &str) -> Result<i64> {
    let sum: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE account_id = ? AND status = 'completed'",
    )
    .bind(account_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(sum)
}
