//! Rating persistence and aggregate maintenance

use crate::database::models::{
    PageRequest, Rating, RatingAggregate, RatingStatus, RatingTarget, RatingTargetKind,
};
use crate::error::{AppError, Result};
use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

pub async fn insert_rating(
    conn: &mut SqliteConnection,
    target: &RatingTarget,
    account_id: &str,
    score: i64,
    review: Option<&str>,
) -> Result<Rating> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    let rating = sqlx::query_as::<_, Rating>(
        r#"
        INSERT INTO ratings (id, target_kind, target_id, account_id, score, review, status,
                             created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(&id)
    .bind(target.kind())
    .bind(target.id())
    .bind(account_id)
    .bind(score)
    .bind(review)
    .bind(RatingStatus::Active)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from(e).on_unique_violation("Account has already rated this item"))?;

    tracing::debug!("Created rating: {} on {:?}", id, target);
    Ok(rating)
}

pub async fn get_rating(conn: &mut SqliteConnection, id: &str) -> Result<Rating> {
    sqlx::query_as::<_, Rating>("SELECT * FROM ratings WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found("Rating", id))
}

pub async fn find_by_account(
    conn: &mut SqliteConnection,
    target: &RatingTarget,
    account_id: &str,
) -> Result<Option<Rating>> {
    let rating = sqlx::query_as::<_, Rating>(
        "SELECT * FROM ratings WHERE target_kind = ? AND target_id = ? AND account_id = ?",
    )
    .bind(target.kind())
    .bind(target.id())
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(rating)
}

pub async fn update_rating(
    conn: &mut SqliteConnection,
    id: &str,
    score: Option<i64>,
    review: Option<&str>,
) -> Result<Rating> {
    let now = Utc::now();

    sqlx::query_as::<_, Rating>(
        r#"
        UPDATE ratings
        SET score = COALESCE(?, score), review = COALESCE(?, review), updated_at = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(score)
    .bind(review)
    .bind(now)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found("Rating", id))
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: RatingStatus,
) -> Result<Rating> {
    sqlx::query_as::<_, Rating>(
        "UPDATE ratings SET status = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(status)
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found("Rating", id))
}

pub async fn delete_rating(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    let rows = sqlx::query("DELETE FROM ratings WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if rows == 0 {
        return Err(AppError::not_found("Rating", id));
    }

    Ok(())
}

/// Mean and count over active ratings, mean rounded to one decimal
pub async fn compute_aggregate(
    conn: &mut SqliteConnection,
    target: &RatingTarget,
) -> Result<RatingAggregate> {
    let (count, average): (i64, Option<f64>) = sqlx::query_as(
        r#"
        SELECT COUNT(*), AVG(score) FROM ratings
        WHERE target_kind = ? AND target_id = ? AND status = 'active'
        "#,
    )
    .bind(target.kind())
    .bind(target.id())
    .fetch_one(&mut *conn)
    .await?;

    let average = match (count, average) {
        (0, _) | (_, None) => 0.0,
        (_, Some(avg)) => (avg * 10.0).round() / 10.0,
    };

    Ok(RatingAggregate { average, count })
}

pub async fn store_aggregate(
    conn: &mut SqliteConnection,
    target: &RatingTarget,
    aggregate: RatingAggregate,
) -> Result<()> {
    let table = match target.kind() {
        RatingTargetKind::Document => "documents",
        RatingTargetKind::File => "library_files",
    };

    let rows = sqlx::query(&format!(
        "UPDATE {} SET rating_average = ?, rating_count = ? WHERE id = ?",
        table
    ))
    .bind(aggregate.average)
    .bind(aggregate.count)
    .bind(target.id())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(AppError::not_found(
            match target.kind() {
                RatingTargetKind::Document => "Document",
                RatingTargetKind::File => "LibraryFile",
            },
            target.id(),
        ));
    }

    Ok(())
}

pub async fn list_active(
    conn: &mut SqliteConnection,
    target: &RatingTarget,
    page: PageRequest,
) -> Result<(Vec<Rating>, i64)> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ratings WHERE target_kind = ? AND target_id = ? AND status = 'active'",
    )
    .bind(target.kind())
    .bind(target.id())
    .fetch_one(&mut *conn)
    .await?;

    let ratings = sqlx::query_as::<_, Rating>(
        r#"
        SELECT * FROM ratings
        WHERE target_kind = ? AND target_id = ? AND status = 'active'
        ORDER BY created_at DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(target.kind())
    .bind(target.id())
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&mut *conn)
    .await?;

    Ok((ratings, total))
}

/// Active rating counts indexed by score - 1
pub async fn distribution(conn: &mut SqliteConnection, target: &RatingTarget) -> Result<[i64; 5]> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT score, COUNT(*) FROM ratings
        WHERE target_kind = ? AND target_id = ? AND status = 'active'
        GROUP BY score
        "#,
    )
    .bind(target.kind())
    .bind(target.id())
    .fetch_all(&mut *conn)
    .await?;

    let mut buckets = [0i64; 5];
    for (score, count) in rows {
        if let Some(bucket) = usize::try_from(score - 1).ok().and_then(|i| buckets.get_mut(i)) {
            *bucket = count;
        }
    }

    Ok(buckets)
}
