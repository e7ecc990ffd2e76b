//! Library file persistence

use super::Visibility;
use crate::database::models::{LibraryFile, PageRequest};
use crate::error::{AppError, Result};
use crate::storage::StoredObject;
use chrono::Utc;
use sqlx::SqliteConnection;

pub struct NewLibraryFile<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub original_name: &'a str,
    pub mime_type: &'a str,
    pub object: &'a StoredObject,
    pub price: i64,
    pub category_id: Option<&'a str>,
    pub uploader_id: &'a str,
    /// Set when the uploader's role publishes without review
    pub approver_id: Option<&'a str>,
}

pub async fn insert_file(conn: &mut SqliteConnection, file: NewLibraryFile<'_>) -> Result<LibraryFile> {
    let now = Utc::now();
    let approved_at = file.approver_id.map(|_| now);

    let record = sqlx::query_as::<_, LibraryFile>(
        r#"
        INSERT INTO library_files (id, name, description, object_id, original_name, mime_type,
                                   size, checksum, price, category_id, uploader_id, is_approved,
                                   approver_id, approved_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(file.id)
    .bind(file.name)
    .bind(file.description)
    .bind(&file.object.id)
    .bind(file.original_name)
    .bind(file.mime_type)
    .bind(file.object.size)
    .bind(&file.object.checksum)
    .bind(file.price)
    .bind(file.category_id)
    .bind(file.uploader_id)
    .bind(file.approver_id.is_some())
    .bind(file.approver_id)
    .bind(approved_at)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    tracing::debug!("Created library file: {}", file.id);
    Ok(record)
}

pub async fn find_file(conn: &mut SqliteConnection, id: &str) -> Result<Option<LibraryFile>> {
    let file = sqlx::query_as::<_, LibraryFile>("SELECT * FROM library_files WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(file)
}

pub async fn get_file(conn: &mut SqliteConnection, id: &str) -> Result<LibraryFile> {
    find_file(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found("LibraryFile", id))
}

/// Approve a pending file; returns false when it was already approved
pub async fn approve_file(conn: &mut SqliteConnection, id: &str, approver_id: &str) -> Result<bool> {
    let now = Utc::now();

    let rows = sqlx::query(
        r#"
        UPDATE library_files
        SET is_approved = 1, approver_id = ?, approved_at = ?, updated_at = ?
        WHERE id = ? AND is_approved = 0
        "#,
    )
    .bind(approver_id)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(rows == 1)
}

pub async fn increment_download_count(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("UPDATE library_files SET download_count = download_count + 1 WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Delete a file row and its ratings; the blob is released by the caller
pub async fn delete_file(conn: &mut SqliteConnection, id: &str) -> Result<LibraryFile> {
    let file = get_file(conn, id).await?;

    sqlx::query("DELETE FROM ratings WHERE target_kind = 'file' AND target_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM library_files WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    tracing::debug!("Deleted library file: {}", id);
    Ok(file)
}

pub async fn list_files(
    conn: &mut SqliteConnection,
    visibility: &Visibility,
    category_id: Option<&str>,
    page: PageRequest,
) -> Result<(Vec<LibraryFile>, i64)> {
    let (restricted, owner) = visibility.bounds();

    const WHERE: &str = r#"
        WHERE (? = 0 OR is_approved = 1 OR uploader_id = ?)
          AND (? IS NULL OR category_id = ?)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM library_files {}", WHERE))
        .bind(restricted)
        .bind(owner)
        .bind(category_id)
        .bind(category_id)
        .fetch_one(&mut *conn)
        .await?;

    let files = sqlx::query_as::<_, LibraryFile>(&format!(
        "SELECT * FROM library_files {} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        WHERE
    ))
    .bind(restricted)
    .bind(owner)
    .bind(category_id)
    .bind(category_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    Ok((files, total))
}
