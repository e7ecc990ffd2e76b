//! Account persistence
//!
//! The `balance` column is written only by [`super::ledger`]; nothing here
//! touches it after the initial zero.

use crate::database::models::{Account, PageRequest, RegisterRequest, Role, UpdateProfileRequest};
use crate::error::{AppError, Result};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

pub async fn insert_account(
    conn: &mut SqliteConnection,
    req: &RegisterRequest,
    password_hash: &str,
    role: Role,
) -> Result<Account> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let account = sqlx::query_as::<_, Account>(
        r#"
        INSERT INTO accounts (id, username, email, password_hash, full_name, phone, address,
                              role, is_active, balance, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, 0, ?, ?)
        RETURNING *
        "#,
    )
    .bind(&id)
    .bind(req.username.trim())
    .bind(req.email.trim().to_lowercase())
    .bind(password_hash)
    .bind(req.full_name.trim())
    .bind(&req.phone)
    .bind(&req.address)
    .bind(role)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from(e).on_unique_violation("Username or email already exists"))?;

    tracing::debug!("Created account: {}", id);
    Ok(account)
}

pub async fn find_account(conn: &mut SqliteConnection, id: &str) -> Result<Option<Account>> {
    let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(account)
}

pub async fn get_account(conn: &mut SqliteConnection, id: &str) -> Result<Account> {
    find_account(conn, id)
        .await?
        .ok_or_else(|| AppError::not_found("Account", id))
}

/// Look up by username or email, case-insensitively for email
pub async fn find_by_login(conn: &mut SqliteConnection, login: &str) -> Result<Option<Account>> {
    let login = login.trim();

    let account = sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE username = ? OR email = ? LIMIT 1",
    )
    .bind(login)
    .bind(login.to_lowercase())
    .fetch_optional(&mut *conn)
    .await?;

    Ok(account)
}

pub async fn username_or_email_taken(
    conn: &mut SqliteConnection,
    username: &str,
    email: &str,
) -> Result<(bool, bool)> {
    let (username_taken, email_taken): (bool, bool) = sqlx::query_as(
        r#"
        SELECT
            EXISTS(SELECT 1 FROM accounts WHERE username = ?),
            EXISTS(SELECT 1 FROM accounts WHERE email = ?)
        "#,
    )
    .bind(username.trim())
    .bind(email.trim().to_lowercase())
    .fetch_one(&mut *conn)
    .await?;

    Ok((username_taken, email_taken))
}

pub async fn touch_last_login(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let now = Utc::now();

    sqlx::query("UPDATE accounts SET last_login_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn update_profile(
    conn: &mut SqliteConnection,
    id: &str,
    req: &UpdateProfileRequest,
) -> Result<Account> {
    let now = Utc::now();

    let account = sqlx::query_as::<_, Account>(
        r#"
        UPDATE accounts
        SET full_name = COALESCE(?, full_name),
            phone = COALESCE(?, phone),
            address = COALESCE(?, address),
            updated_at = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(req.full_name.as_deref().map(str::trim))
    .bind(&req.phone)
    .bind(&req.address)
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found("Account", id))?;

    tracing::debug!("Updated profile: {}", id);
    Ok(account)
}

pub async fn set_role_and_status(
    conn: &mut SqliteConnection,
    id: &str,
    role: Option<Role>,
    is_active: Option<bool>,
) -> Result<Account> {
    let now = Utc::now();

    let account = sqlx::query_as::<_, Account>(
        r#"
        UPDATE accounts
        SET role = COALESCE(?, role),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(role)
    .bind(is_active)
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found("Account", id))?;

    Ok(account)
}

pub async fn list_accounts(
    conn: &mut SqliteConnection,
    role: Option<Role>,
    page: PageRequest,
) -> Result<(Vec<Account>, i64)> {
    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM accounts WHERE (? IS NULL OR role = ?)")
            .bind(role)
            .bind(role)
            .fetch_one(&mut *conn)
            .await?;

    let accounts = sqlx::query_as::<_, Account>(
        r#"
        SELECT * FROM accounts
        WHERE (? IS NULL OR role = ?)
        ORDER BY created_at DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(role)
    .bind(role)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    Ok((accounts, total))
}
