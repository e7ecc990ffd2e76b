//! Comment service
//!
//! Comments hang off documents with one level of threading: a reply points
//! at a top-level comment of the same document. Deletion is soft so reply
//! counts and likes stay attached to the row.

use crate::config::MAX_COMMENT_LENGTH;
use crate::database::models::{
    ActivityKind, Comment, CommentStatus, LikeToggle, PageRequest, Paged,
};
use crate::database::repository::{comments, documents};
use crate::database::Repository;
use crate::error::{AppError, Result};
use crate::services::access::{self, Actor};
use crate::services::activity::ActivityRecorder;
use serde_json::json;
use sqlx::SqliteConnection;

#[derive(Clone)]
pub struct CommentService {
    repo: Repository,
}

impl CommentService {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Comment on a document, or reply to one of its top-level comments
    pub async fn create(
        &self,
        actor: &Actor,
        document_id: &str,
        parent_id: Option<&str>,
        content: &str,
    ) -> Result<Comment> {
        let content = checked_content(content)?;
        let actor = actor.clone();
        let document_id = document_id.to_string();
        let parent_id = parent_id.map(str::to_string);

        let comment = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let document = documents::get_document(conn, &document_id).await?;
                    access::ensure_view(&document, Some(&actor), "document")?;

                    if let Some(parent_id) = &parent_id {
                        let parent = comments::get_comment(conn, parent_id).await?;
                        if parent.document_id != document_id {
                            return Err(AppError::InvalidState(
                                "Reply must belong to the same document".to_string(),
                            ));
                        }
                        if parent.parent_id.is_some() {
                            return Err(AppError::InvalidState(
                                "Replies cannot be nested".to_string(),
                            ));
                        }
                        if parent.status != CommentStatus::Active {
                            return Err(AppError::InvalidState(
                                "Cannot reply to an inactive comment".to_string(),
                            ));
                        }
                    }

                    let comment = comments::insert_comment(
                        conn,
                        &document_id,
                        &actor.account_id,
                        parent_id.as_deref(),
                        &content,
                    )
                    .await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::Comment,
                        json!({
                            "comment_id": comment.id,
                            "document_id": document_id,
                            "parent_id": parent_id,
                        }),
                    )
                    .await;

                    Ok(comment)
                })
            })
            .await?;

        tracing::info!("Comment {} added to document {}", comment.id, comment.document_id);
        Ok(comment)
    }

    /// Active top-level comments of a document, newest first
    pub async fn list(
        &self,
        actor: Option<&Actor>,
        document_id: &str,
        page: PageRequest,
    ) -> Result<Paged<Comment>> {
        let mut conn = self.repo.connection().await?;
        let document = documents::get_document(&mut conn, document_id).await?;
        access::ensure_view(&document, actor, "document")?;

        let (items, total) = comments::list_top_level(&mut conn, document_id, page).await?;
        Ok(Paged::new(items, total, page))
    }

    /// Active replies to a comment, oldest first
    pub async fn replies(&self, actor: Option<&Actor>, comment_id: &str) -> Result<Vec<Comment>> {
        let mut conn = self.repo.connection().await?;
        let parent = comments::get_comment(&mut conn, comment_id).await?;
        let document = documents::get_document(&mut conn, &parent.document_id).await?;
        access::ensure_view(&document, actor, "document")?;

        comments::list_replies(&mut conn, comment_id).await
    }

    pub async fn update(&self, actor: &Actor, comment_id: &str, content: &str) -> Result<Comment> {
        let content = checked_content(content)?;
        let actor = actor.clone();
        let id = comment_id.to_string();

        self.repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = live_comment(conn, &id).await?;
                    access::ensure_edit(&current, &actor, "comment")?;

                    let updated = comments::update_content(conn, &id, &content).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::UpdateComment,
                        json!({ "comment_id": id }),
                    )
                    .await;

                    Ok(updated)
                })
            })
            .await
    }

    /// Soft delete; the row stays with status `deleted`
    pub async fn delete(&self, actor: &Actor, comment_id: &str) -> Result<Comment> {
        let actor = actor.clone();
        let id = comment_id.to_string();

        let comment = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = live_comment(conn, &id).await?;
                    access::ensure_delete(&current, &actor, "comment")?;

                    let deleted =
                        comments::set_status(conn, &id, CommentStatus::Deleted, None).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::DeleteComment,
                        json!({ "comment_id": id, "document_id": deleted.document_id }),
                    )
                    .await;

                    Ok(deleted)
                })
            })
            .await?;

        tracing::info!("Comment {} deleted", comment.id);
        Ok(comment)
    }

    /// Like or unlike; calling twice restores the original state
    pub async fn toggle_like(&self, actor: &Actor, comment_id: &str) -> Result<LikeToggle> {
        let account_id = actor.account_id.clone();
        let id = comment_id.to_string();

        self.repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let comment = comments::get_comment(conn, &id).await?;
                    if comment.status != CommentStatus::Active {
                        return Err(AppError::InvalidState(
                            "Only active comments can be liked".to_string(),
                        ));
                    }

                    let liked = comments::toggle_like(conn, &id, &account_id).await?;
                    let total_likes = comments::like_count(conn, &id).await?;
                    Ok(LikeToggle { liked, total_likes })
                })
            })
            .await
    }
}

fn checked_content(content: &str) -> Result<String> {
    let content = content.trim();
    if content.is_empty() {
        return Err(AppError::invalid_field("content", "Comment cannot be empty"));
    }
    if content.chars().count() > MAX_COMMENT_LENGTH {
        return Err(AppError::invalid_field(
            "content",
            format!("Comment cannot exceed {} characters", MAX_COMMENT_LENGTH),
        ));
    }
    Ok(content.to_string())
}

async fn live_comment(conn: &mut SqliteConnection, id: &str) -> Result<Comment> {
    let comment = comments::get_comment(conn, id).await?;
    if comment.status == CommentStatus::Deleted {
        return Err(AppError::InvalidState("Comment is deleted".to_string()));
    }
    Ok(comment)
}
