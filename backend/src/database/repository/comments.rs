//! Comment and like persistence
//!
//! Threads are flat rows linked by `parent_id`; replies are fetched with an
//! indexed query instead of being nested.

use crate::database::models::{Comment, CommentStatus, PageRequest};
use crate::error::{AppError, Result};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

const SELECT_COMMENT: &str = r#"
    SELECT c.*,
        (SELECT COUNT(*) FROM comment_likes l WHERE l.comment_id = c.id) AS like_count,
        (SELECT COUNT(*) FROM comments r WHERE r.parent_id = c.id AND r.status = 'active') AS reply_count
    FROM comments c
"#;

pub async fn insert_comment(
    conn: &mut SqliteConnection,
    document_id: &str,
    author_id: &str,
    parent_id: Option<&str>,
    content: &str,
) -> Result<Comment> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO comments (id, document_id, author_id, parent_id, content, status,
                              created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(document_id)
    .bind(author_id)
    .bind(parent_id)
    .bind(content)
    .bind(CommentStatus::Active)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    tracing::debug!("Created comment: {} on document {}", id, document_id);
    get_comment(conn, &id).await
}

pub async fn find_comment(conn: &mut SqliteConnection, id: &str) -> Result<Option<Comment>> {
    let comment = sqlx::query_as::<_, Comment>(&format!("{} WHERE c.id = ?", SELECT_COMMENT))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(comment)
}

pub async fn get_comment(conn: &mut SqliteConnection, id: &str) -> Result<Comment> {
    find_comment(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found("Comment", id))
}

pub async fn update_content(conn: &mut SqliteConnection, id: &str, content: &str) -> Result<Comment> {
    let now = Utc::now();

    sqlx::query(
        r#"
        UPDATE comments
        SET content = ?, is_edited = 1, edited_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(content)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    get_comment(conn, id).await
}

/// Change status; approval also stamps the moderator
pub async fn set_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: CommentStatus,
    approver_id: Option<&str>,
) -> Result<Comment> {
    let now = Utc::now();
    let approved_at = approver_id.map(|_| now);

    sqlx::query(
        r#"
        UPDATE comments
        SET status = ?,
            approver_id = COALESCE(?, approver_id),
            approved_at = COALESCE(?, approved_at),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status)
    .bind(approver_id)
    .bind(approved_at)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    get_comment(conn, id).await
}

pub async fn list_top_level(
    conn: &mut SqliteConnection,
    document_id: &str,
    page: PageRequest,
) -> Result<(Vec<Comment>, i64)> {
    let total: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM comments
        WHERE document_id = ? AND parent_id IS NULL AND status = 'active'
        "#,
    )
    .bind(document_id)
    .fetch_one(&mut *conn)
    .await?;

    let comments = sqlx::query_as::<_, Comment>(&format!(
        r#"{}
        WHERE c.document_id = ? AND c.parent_id IS NULL AND c.status = 'active'
        ORDER BY c.created_at DESC, c.id DESC
        LIMIT ? OFFSET ?
        "#,
        SELECT_COMMENT
    ))
    .bind(document_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    Ok((comments, total))
}

pub async fn list_replies(conn: &mut SqliteConnection, parent_id: &str) -> Result<Vec<Comment>> {
    let replies = sqlx::query_as::<_, Comment>(&format!(
        "{} WHERE c.parent_id = ? AND c.status = 'active' ORDER BY c.created_at ASC, c.id ASC",
        SELECT_COMMENT
    ))
    .bind(parent_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(replies)
}

/// Flip the like of one account; returns whether the comment is now liked
pub async fn toggle_like(
    conn: &mut SqliteConnection,
    comment_id: &str,
    account_id: &str,
) -> Result<bool> {
    let removed = sqlx::query("DELETE FROM comment_likes WHERE comment_id = ? AND account_id = ?")
        .bind(comment_id)
        .bind(account_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if removed > 0 {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO comment_likes (comment_id, account_id, created_at) VALUES (?, ?, ?)",
    )
    .bind(comment_id)
    .bind(account_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(true)
}

pub async fn like_count(conn: &mut SqliteConnection, comment_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comment_likes WHERE comment_id = ?")
        .bind(comment_id)
        .fetch_one(&mut *conn)
        .await?;

    Ok(count)
}
