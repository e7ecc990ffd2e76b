//! Category persistence

use crate::database::models::{Category, CreateCategoryRequest, UpdateCategoryRequest};
use crate::error::{AppError, Result};
use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use uuid::Uuid;

pub async fn insert_category(
    conn: &mut SqliteConnection,
    req: &CreateCategoryRequest,
) -> Result<Category> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let category = sqlx::query_as::<_, Category>(
        r#"
        INSERT INTO categories (id, code, name, description, parent_id, sort_order, is_active,
                                custom_fields_config, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(&id)
    .bind(req.code.trim())
    .bind(Json(&req.name))
    .bind(req.description.as_ref().map(Json))
    .bind(&req.parent_id)
    .bind(req.sort_order)
    .bind(Json(&req.custom_fields_config))
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from(e).on_unique_violation("Category code already exists"))?;

    tracing::debug!("Created category: {} ({})", id, category.code);
    Ok(category)
}

pub async fn find_category(conn: &mut SqliteConnection, id: &str) -> Result<Option<Category>> {
    let category = sqlx::query_as::<_, Category>("SELECT * FROM categories WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(category)
}

pub async fn get_category(conn: &mut SqliteConnection, id: &str) -> Result<Category> {
    find_category(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found("Category", id))
}

pub async fn update_category(
    conn: &mut SqliteConnection,
    id: &str,
    req: &UpdateCategoryRequest,
) -> Result<Category> {
    let now = Utc::now();
    let reparent = req.parent_id.is_some();
    let parent_id = req.parent_id.clone().flatten();

    let category = sqlx::query_as::<_, Category>(
        r#"
        UPDATE categories
        SET code = COALESCE(?, code),
            name = COALESCE(?, name),
            description = COALESCE(?, description),
            parent_id = CASE WHEN ? THEN ? ELSE parent_id END,
            sort_order = COALESCE(?, sort_order),
            is_active = COALESCE(?, is_active),
            custom_fields_config = COALESCE(?, custom_fields_config),
            updated_at = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(req.code.as_deref().map(str::trim))
    .bind(req.name.as_ref().map(Json))
    .bind(req.description.as_ref().map(Json))
    .bind(reparent)
    .bind(parent_id)
    .bind(req.sort_order)
    .bind(req.is_active)
    .bind(req.custom_fields_config.as_ref().map(Json))
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from(e).on_unique_violation("Category code already exists"))?
    .ok_or_else(|| AppError::not_found("Category", id))?;

    tracing::debug!("Updated category: {}", id);
    Ok(category)
}

pub async fn delete_category(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let rows = sqlx::query("DELETE FROM categories WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if rows == 0 {
        return Err(AppError::not_found("Category", id));
    }

    tracing::debug!("Deleted category: {}", id);
    Ok(())
}

/// Rows that still point at a category: (children, documents, library files)
pub async fn count_references(conn: &mut SqliteConnection, id: &str) -> Result<(i64, i64, i64)> {
    let counts: (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM categories WHERE parent_id = ?),
            (SELECT COUNT(*) FROM documents WHERE category_id = ?),
            (SELECT COUNT(*) FROM library_files WHERE category_id = ?)
        "#,
    )
    .bind(id)
    .bind(id)
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(counts)
}

/// Parent chain of a category, nearest first
pub async fn ancestor_ids(conn: &mut SqliteConnection, id: &str) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
        WITH RECURSIVE chain(id, parent_id, depth) AS (
            SELECT id, parent_id, 0 FROM categories WHERE id = ?
            UNION ALL
            SELECT c.id, c.parent_id, chain.depth + 1
            FROM categories c JOIN chain ON c.id = chain.parent_id
            WHERE chain.depth < 64
        )
        SELECT id FROM chain WHERE depth > 0 ORDER BY depth
        "#,
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ids)
}

pub async fn list_categories(
    conn: &mut SqliteConnection,
    include_inactive: bool,
) -> Result<Vec<Category>> {
    let categories = sqlx::query_as::<_, Category>(
        r#"
        SELECT * FROM categories
        WHERE ? OR is_active = 1
        ORDER BY sort_order ASC, code ASC
        "#,
    )
    .bind(include_inactive)
    .fetch_all(&mut *conn)
    .await?;

    Ok(categories)
}

/// Approved document count per category
pub async fn approved_document_counts(
    conn: &mut SqliteConnection,
) -> Result<HashMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT category_id, COUNT(*) FROM documents WHERE status = 'approved' GROUP BY category_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().collect())
}
