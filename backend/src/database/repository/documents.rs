//! Document and attachment persistence

use super::Visibility;
use crate::database::models::{
    ApprovalStatus, CreateDocumentRequest, Document, DocumentFilter, FileAttachment,
    LocalizedKeywords, LocalizedText, PageRequest, Pricing,
};
use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::SqliteConnection;

fn price_columns(pricing: Pricing) -> (bool, i64, i64) {
    match pricing {
        Pricing::Free => (true, 0, 0),
        Pricing::Priced {
            view_price,
            download_price,
        } => (false, view_price, download_price),
    }
}

pub struct NewDocument<'a> {
    pub id: &'a str,
    pub uploader_id: &'a str,
    pub status: ApprovalStatus,
    pub approver_id: Option<&'a str>,
    pub request: &'a CreateDocumentRequest,
}

pub async fn insert_document(conn: &mut SqliteConnection, doc: NewDocument<'_>) -> Result<Document> {
    let now = Utc::now();
    let req = doc.request;
    let (is_free, view_price, download_price) = price_columns(req.pricing);
    let decided_at = doc.approver_id.map(|_| now);

    let document = sqlx::query_as::<_, Document>(
        r#"
        INSERT INTO documents (id, category_id, uploader_id, title, summary, keywords,
                               primary_language, custom_fields, is_free, view_price,
                               download_price, status, approver_id, decided_at,
                               created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(doc.id)
    .bind(&req.category_id)
    .bind(doc.uploader_id)
    .bind(Json(&req.title))
    .bind(Json(&req.summary))
    .bind(Json(&req.keywords))
    .bind(&req.primary_language)
    .bind(Json(&req.custom_fields))
    .bind(is_free)
    .bind(view_price)
    .bind(download_price)
    .bind(doc.status)
    .bind(doc.approver_id)
    .bind(decided_at)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    tracing::debug!("Created document: {} ({:?})", doc.id, doc.status);
    Ok(document)
}

pub async fn insert_attachment(
    conn: &mut SqliteConnection,
    attachment: &FileAttachment,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO document_files (id, document_id, object_id, original_name, display_name,
                                    mime_type, size, checksum, uploader_id, uploaded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&attachment.id)
    .bind(&attachment.document_id)
    .bind(&attachment.object_id)
    .bind(&attachment.original_name)
    .bind(&attachment.display_name)
    .bind(&attachment.mime_type)
    .bind(attachment.size)
    .bind(&attachment.checksum)
    .bind(&attachment.uploader_id)
    .bind(attachment.uploaded_at)
    .execute(&mut *conn)
    .await?;

    tracing::debug!(
        "Attached file {} to document {}",
        attachment.id,
        attachment.document_id
    );
    Ok(())
}

pub async fn list_attachments(
    conn: &mut SqliteConnection,
    document_id: &str,
) -> Result<Vec<FileAttachment>> {
    let files = sqlx::query_as::<_, FileAttachment>(
        "SELECT * FROM document_files WHERE document_id = ? ORDER BY uploaded_at ASC, id ASC",
    )
    .bind(document_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(files)
}

pub async fn find_document(conn: &mut SqliteConnection, id: &str) -> Result<Option<Document>> {
    let document = sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    match document {
        Some(mut document) => {
            document.files = list_attachments(conn, id).await?;
            Ok(Some(document))
        }
        None => Ok(None),
    }
}

pub async fn get_document(conn: &mut SqliteConnection, id: &str) -> Result<Document> {
    find_document(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found("Document", id))
}

/// Metadata changes; `None` leaves the column untouched
#[derive(Debug, Default)]
pub struct DocumentChanges {
    pub category_id: Option<String>,
    pub title: Option<LocalizedText>,
    pub summary: Option<LocalizedText>,
    pub keywords: Option<LocalizedKeywords>,
    pub custom_fields: Option<Map<String, Value>>,
    pub pricing: Option<Pricing>,
}

pub async fn update_document(
    conn: &mut SqliteConnection,
    id: &str,
    changes: &DocumentChanges,
) -> Result<Document> {
    let now = Utc::now();
    let prices = changes.pricing.map(price_columns);

    let rows = sqlx::query(
        r#"
        UPDATE documents
        SET category_id = COALESCE(?, category_id),
            title = COALESCE(?, title),
            summary = COALESCE(?, summary),
            keywords = COALESCE(?, keywords),
            custom_fields = COALESCE(?, custom_fields),
            is_free = COALESCE(?, is_free),
            view_price = COALESCE(?, view_price),
            download_price = COALESCE(?, download_price),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&changes.category_id)
    .bind(changes.title.as_ref().map(Json))
    .bind(changes.summary.as_ref().map(Json))
    .bind(changes.keywords.as_ref().map(Json))
    .bind(changes.custom_fields.as_ref().map(Json))
    .bind(prices.map(|p| p.0))
    .bind(prices.map(|p| p.1))
    .bind(prices.map(|p| p.2))
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(AppError::not_found("Document", id));
    }

    tracing::debug!("Updated document: {}", id);
    get_document(conn, id).await
}

/// Apply a moderation decision; only a pending document changes
pub async fn record_decision(
    conn: &mut SqliteConnection,
    id: &str,
    status: ApprovalStatus,
    approver_id: &str,
    rejection_reason: Option<&str>,
    decided_at: DateTime<Utc>,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE documents
        SET status = ?, approver_id = ?, decided_at = ?, rejection_reason = ?, updated_at = ?
        WHERE id = ? AND status = 'pending'
        "#,
    )
    .bind(status)
    .bind(approver_id)
    .bind(decided_at)
    .bind(rejection_reason)
    .bind(decided_at)
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(rows == 1)
}

/// Move a rejected document back into the queue
pub async fn reopen_rejected(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    let now = Utc::now();

    let rows = sqlx::query(
        r#"
        UPDATE documents
        SET status = 'pending', approver_id = NULL, decided_at = NULL,
            rejection_reason = NULL, updated_at = ?
        WHERE id = ? AND status = 'rejected'
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(rows == 1)
}

/// Delete a document with its attachments, comments and ratings.
/// Returns the attachments so their blobs can be released afterwards.
pub async fn delete_document(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Vec<FileAttachment>> {
    let files = list_attachments(conn, id).await?;

    sqlx::query("DELETE FROM ratings WHERE target_kind = 'document' AND target_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;

    let rows = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if rows == 0 {
        return Err(AppError::not_found("Document", id));
    }

    tracing::debug!("Deleted document: {} ({} files)", id, files.len());
    Ok(files)
}

pub async fn increment_view_count(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET view_count = view_count + 1 WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn increment_download_count(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("UPDATE documents SET download_count = download_count + 1 WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn list_documents(
    conn: &mut SqliteConnection,
    visibility: &Visibility,
    filter: &DocumentFilter,
    page: PageRequest,
) -> Result<(Vec<Document>, i64)> {
    let (approved_only, owner) = visibility.bounds();

    const WHERE: &str = r#"
        WHERE (? = 0 OR status = 'approved' OR uploader_id = ?)
          AND (? IS NULL OR category_id = ?)
          AND (? IS NULL OR status = ?)
          AND (? IS NULL OR uploader_id = ?)
          AND (? IS NULL OR is_free = ?)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM documents {}", WHERE))
        .bind(approved_only)
        .bind(owner)
        .bind(&filter.category_id)
        .bind(&filter.category_id)
        .bind(filter.status)
        .bind(filter.status)
        .bind(&filter.uploader_id)
        .bind(&filter.uploader_id)
        .bind(filter.free_only)
        .bind(filter.free_only)
        .fetch_one(&mut *conn)
        .await?;

    let mut documents = sqlx::query_as::<_, Document>(&format!(
        "SELECT * FROM documents {} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        WHERE
    ))
    .bind(approved_only)
    .bind(owner)
    .bind(&filter.category_id)
    .bind(&filter.category_id)
    .bind(filter.status)
    .bind(filter.status)
    .bind(&filter.uploader_id)
    .bind(&filter.uploader_id)
    .bind(filter.free_only)
    .bind(filter.free_only)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    for document in &mut documents {
        document.files = list_attachments(conn, &document.id).await?;
    }

    Ok((documents, total))
}
