//! Rating aggregator
//!
//! Ratings attach to documents and library files. Every mutation recomputes
//! the target's `{average, count}` inside the same unit of work, so callers
//! read the new aggregate as soon as the call returns.

use crate::config::{MAX_RATING_SCORE, MAX_RATING_TEXT_LENGTH, MIN_RATING_SCORE};
use crate::database::models::{
    ActivityKind, PageRequest, Paged, Rating, RatingAggregate, RatingStatus, RatingTarget,
};
use crate::database::repository::{documents, library_files, ratings};
use crate::database::Repository;
use crate::error::{AppError, FieldError, Result};
use crate::services::access::{self, Actor};
use crate::services::activity::ActivityRecorder;
use crate::services::entitlement;
use serde::Serialize;
use serde_json::json;
use sqlx::SqliteConnection;

/// A rating mutation together with the aggregate it produced
#[derive(Debug, Clone, Serialize)]
pub struct RatingChange {
    pub rating: Rating,
    pub aggregate: RatingAggregate,
}

#[derive(Clone)]
pub struct RatingService {
    repo: Repository,
}

impl RatingService {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Rate a document or file the actor has access to
    pub async fn rate(
        &self,
        actor: &Actor,
        target: RatingTarget,
        score: i64,
        review: Option<String>,
    ) -> Result<RatingChange> {
        validate_input(Some(score), review.as_deref())?;

        let actor = actor.clone();
        let change = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    ensure_entitled(conn, &actor, &target).await?;

                    let rating = ratings::insert_rating(
                        conn,
                        &target,
                        &actor.account_id,
                        score,
                        review.as_deref(),
                    )
                    .await?;
                    let aggregate = refresh(conn, &target).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::Rate,
                        json!({ "rating_id": rating.id, "target_id": target.id(), "score": score }),
                    )
                    .await;

                    Ok(RatingChange { rating, aggregate })
                })
            })
            .await?;

        tracing::info!(
            "Rating {} on {:?}: average {} over {}",
            change.rating.id,
            change.rating.target(),
            change.aggregate.average,
            change.aggregate.count
        );
        Ok(change)
    }

    pub async fn update(
        &self,
        actor: &Actor,
        rating_id: &str,
        score: Option<i64>,
        review: Option<String>,
    ) -> Result<RatingChange> {
        validate_input(score, review.as_deref())?;

        let actor = actor.clone();
        let id = rating_id.to_string();

        self.repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = ratings::get_rating(conn, &id).await?;
                    access::ensure_edit(&current, &actor, "rating")?;

                    let rating =
                        ratings::update_rating(conn, &id, score, review.as_deref()).await?;
                    let aggregate = refresh(conn, &rating.target()).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::UpdateRating,
                        json!({ "rating_id": id, "score": rating.score }),
                    )
                    .await;

                    Ok(RatingChange { rating, aggregate })
                })
            })
            .await
    }

    /// Remove a rating; returns the recomputed aggregate of its target
    pub async fn delete(&self, actor: &Actor, rating_id: &str) -> Result<RatingAggregate> {
        let actor = actor.clone();
        let id = rating_id.to_string();

        self.repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = ratings::get_rating(conn, &id).await?;
                    access::ensure_delete(&current, &actor, "rating")?;

                    ratings::delete_rating(conn, &id).await?;
                    let aggregate = refresh(conn, &current.target()).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::DeleteRating,
                        json!({ "rating_id": id, "target_id": current.target_id }),
                    )
                    .await;

                    Ok(aggregate)
                })
            })
            .await
    }

    /// Flip a rating between active and hidden; hidden ratings leave the aggregate
    pub async fn toggle_visibility(&self, actor: &Actor, rating_id: &str) -> Result<RatingChange> {
        access::ensure_moderator(actor)?;

        let admin_id = actor.account_id.clone();
        let id = rating_id.to_string();

        self.repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = ratings::get_rating(conn, &id).await?;
                    let status = match current.status {
                        RatingStatus::Active => RatingStatus::Hidden,
                        RatingStatus::Hidden => RatingStatus::Active,
                    };

                    let rating = ratings::set_status(conn, &id, status).await?;
                    let aggregate = refresh(conn, &rating.target()).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &admin_id,
                        ActivityKind::ToggleRating,
                        json!({ "rating_id": id, "status": status }),
                    )
                    .await;

                    Ok(RatingChange { rating, aggregate })
                })
            })
            .await
    }

    /// Rebuild and store the aggregate of one target from its active ratings
    pub async fn recompute(&self, target: &RatingTarget) -> Result<RatingAggregate> {
        let target = target.clone();
        self.repo
            .unit_of_work(move |conn| Box::pin(async move { refresh(conn, &target).await }))
            .await
    }

    pub async fn list(&self, target: &RatingTarget, page: PageRequest) -> Result<Paged<Rating>> {
        let mut conn = self.repo.connection().await?;
        let (items, total) = ratings::list_active(&mut conn, target, page).await?;
        Ok(Paged::new(items, total, page))
    }

    /// Active rating counts for scores 1 through 5
    pub async fn distribution(&self, target: &RatingTarget) -> Result<[i64; 5]> {
        let mut conn = self.repo.connection().await?;
        ratings::distribution(&mut conn, target).await
    }

    pub async fn rating_of(&self, account_id: &str, target: &RatingTarget) -> Result<Option<Rating>> {
        let mut conn = self.repo.connection().await?;
        ratings::find_by_account(&mut conn, target, account_id).await
    }
}

async fn refresh(conn: &mut SqliteConnection, target: &RatingTarget) -> Result<RatingAggregate> {
    let aggregate = ratings::compute_aggregate(conn, target).await?;
    ratings::store_aggregate(conn, target, aggregate).await?;
    Ok(aggregate)
}

/// Raters must be able to see the target and must hold access to it
async fn ensure_entitled(
    conn: &mut SqliteConnection,
    actor: &Actor,
    target: &RatingTarget,
) -> Result<()> {
    let entitled = match target {
        RatingTarget::Document(id) => {
            let document = documents::get_document(conn, id).await?;
            access::ensure_view(&document, Some(actor), "document")?;
            entitlement::holds_document(conn, actor, &document).await?
        }
        RatingTarget::File(id) => {
            let file = library_files::get_file(conn, id).await?;
            access::ensure_view(&file, Some(actor), "file")?;
            entitlement::holds_file(conn, actor, &file).await?
        }
    };

    if entitled {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Purchase access before rating this item".to_string(),
        ))
    }
}

fn validate_input(score: Option<i64>, review: Option<&str>) -> Result<()> {
    let mut errors = Vec::new();

    if let Some(score) = score {
        if !(MIN_RATING_SCORE..=MAX_RATING_SCORE).contains(&score) {
            errors.push(FieldError::new(
                "score",
                format!(
                    "Score must be between {} and {}",
                    MIN_RATING_SCORE, MAX_RATING_SCORE
                ),
            ));
        }
    }

    if let Some(review) = review {
        if review.chars().count() > MAX_RATING_TEXT_LENGTH {
            errors.push(FieldError::new(
                "review",
                format!(
                    "Review must be at most {} characters",
                    MAX_RATING_TEXT_LENGTH
                ),
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::ValidationFailed(errors))
    }
}
