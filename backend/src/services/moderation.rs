//! Moderation workflow
//!
//! Documents move `pending -> approved | rejected`. Only administrators
//! decide, and only while a document is pending. A rejected document goes
//! back to the queue only when its owner explicitly re-submits it; editing
//! alone never changes its status. Library files and comments have their own
//! smaller machines with the same authority rules.

use crate::database::models::{
    ActivityKind, ApprovalStatus, Comment, CommentStatus, Document, DocumentFilter, LibraryFile,
    PageRequest, Paged, Role,
};
use crate::database::repository::{comments, documents, library_files, Visibility};
use crate::database::Repository;
use crate::error::{AppError, Result};
use crate::services::access::{self, Actor};
use crate::services::activity::ActivityRecorder;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// An administrator's verdict on a pending document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject { reason: String },
}

#[derive(Clone)]
pub struct ModerationService {
    repo: Repository,
}

impl ModerationService {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Status a document submitted by `role` starts in.
    ///
    /// Only the submitter's role matters; nothing on the document itself
    /// changes the outcome.
    pub fn submit(role: Role) -> ApprovalStatus {
        access::initial_status(role)
    }

    /// Approve or reject a pending document
    pub async fn decide(
        &self,
        actor: &Actor,
        document_id: &str,
        decision: Decision,
    ) -> Result<Document> {
        access::ensure_moderator(actor)?;

        let (status, reason) = match &decision {
            Decision::Approve => (ApprovalStatus::Approved, None),
            Decision::Reject { reason } => {
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(AppError::invalid_field(
                        "reason",
                        "A rejection reason is required",
                    ));
                }
                (ApprovalStatus::Rejected, Some(reason.to_string()))
            }
        };

        let admin_id = actor.account_id.clone();
        let id = document_id.to_string();

        let document = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = documents::get_document(conn, &id).await?;
                    if current.status != ApprovalStatus::Pending {
                        return Err(not_pending(current.status));
                    }

                    let changed = documents::record_decision(
                        conn,
                        &id,
                        status,
                        &admin_id,
                        reason.as_deref(),
                        Utc::now(),
                    )
                    .await?;
                    if !changed {
                        return Err(AppError::InvalidState(
                            "Document was decided concurrently".to_string(),
                        ));
                    }

                    let kind = match status {
                        ApprovalStatus::Rejected => ActivityKind::RejectDocument,
                        _ => ActivityKind::ApproveDocument,
                    };
                    ActivityRecorder::record_in(
                        conn,
                        &admin_id,
                        kind,
                        json!({ "document_id": id, "reason": reason }),
                    )
                    .await;

                    documents::get_document(conn, &id).await
                })
            })
            .await?;

        tracing::info!(
            "Document {} {:?} by {}",
            document.id,
            document.status,
            actor.account_id
        );
        Ok(document)
    }

    /// Send a rejected document back to the review queue
    pub async fn resubmit(&self, actor: &Actor, document_id: &str) -> Result<Document> {
        let actor_id = actor.account_id.clone();
        let owner = actor.clone();
        let id = document_id.to_string();

        let document = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = documents::get_document(conn, &id).await?;
                    access::ensure_edit(&current, &owner, "document")?;

                    if current.status != ApprovalStatus::Rejected {
                        return Err(AppError::InvalidState(
                            "Only rejected documents can be re-submitted".to_string(),
                        ));
                    }

                    if !documents::reopen_rejected(conn, &id).await? {
                        return Err(AppError::InvalidState(
                            "Document changed status concurrently".to_string(),
                        ));
                    }

                    ActivityRecorder::record_in(
                        conn,
                        &actor_id,
                        ActivityKind::ResubmitDocument,
                        json!({ "document_id": id }),
                    )
                    .await;

                    documents::get_document(conn, &id).await
                })
            })
            .await?;

        tracing::info!("Document {} re-submitted for review", document.id);
        Ok(document)
    }

    /// Pending documents waiting for a decision, oldest last
    pub async fn queue(&self, actor: &Actor, page: PageRequest) -> Result<Paged<Document>> {
        access::ensure_moderator(actor)?;

        let filter = DocumentFilter {
            status: Some(ApprovalStatus::Pending),
            ..DocumentFilter::default()
        };
        let mut conn = self.repo.connection().await?;
        let (items, total) =
            documents::list_documents(&mut conn, &Visibility::All, &filter, page).await?;
        Ok(Paged::new(items, total, page))
    }

    pub async fn approve_file(&self, actor: &Actor, file_id: &str) -> Result<LibraryFile> {
        access::ensure_moderator(actor)?;

        let admin_id = actor.account_id.clone();
        let id = file_id.to_string();

        let file = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    library_files::get_file(conn, &id).await?;
                    if !library_files::approve_file(conn, &id, &admin_id).await? {
                        return Err(AppError::InvalidState(
                            "File is already approved".to_string(),
                        ));
                    }

                    ActivityRecorder::record_in(
                        conn,
                        &admin_id,
                        ActivityKind::ApproveFile,
                        json!({ "library_file_id": id }),
                    )
                    .await;

                    library_files::get_file(conn, &id).await
                })
            })
            .await?;

        tracing::info!("Library file {} approved by {}", file.id, actor.account_id);
        Ok(file)
    }

    /// Mark a comment active and stamp the approving administrator
    pub async fn approve_comment(&self, actor: &Actor, comment_id: &str) -> Result<Comment> {
        self.moderate_comment(actor, comment_id, CommentStatus::Active)
            .await
    }

    pub async fn hide_comment(&self, actor: &Actor, comment_id: &str) -> Result<Comment> {
        self.moderate_comment(actor, comment_id, CommentStatus::Hidden)
            .await
    }

    async fn moderate_comment(
        &self,
        actor: &Actor,
        comment_id: &str,
        status: CommentStatus,
    ) -> Result<Comment> {
        access::ensure_moderator(actor)?;

        let admin_id = actor.account_id.clone();
        let id = comment_id.to_string();

        let comment = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = comments::get_comment(conn, &id).await?;
                    if current.status == CommentStatus::Deleted {
                        return Err(AppError::InvalidState(
                            "Deleted comments cannot be moderated".to_string(),
                        ));
                    }

                    let (approver, kind) = match status {
                        CommentStatus::Active => (Some(admin_id.as_str()), ActivityKind::ApproveComment),
                        _ => (None, ActivityKind::HideComment),
                    };
                    let updated = comments::set_status(conn, &id, status, approver).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &admin_id,
                        kind,
                        json!({ "comment_id": id, "document_id": updated.document_id }),
                    )
                    .await;

                    Ok(updated)
                })
            })
            .await?;

        tracing::info!("Comment {} set to {:?}", comment.id, comment.status);
        Ok(comment)
    }
}

fn not_pending(status: ApprovalStatus) -> AppError {
    let state = match status {
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Rejected => "rejected",
        ApprovalStatus::Pending => "pending",
    };
    AppError::InvalidState(format!("Document is already {}", state))
}
