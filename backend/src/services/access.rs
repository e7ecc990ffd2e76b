//! Role and ownership rules
//!
//! Every moderated entity is judged by the same three inputs: the actor's
//! role, whether the actor owns the entity, and the entity's approval status.
//! Services call these predicates instead of branching on roles themselves.

use crate::database::models::{
    ApprovalStatus, Comment, Document, LibraryFile, Rating, Role,
};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};

/// The authenticated caller of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub account_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(account_id: impl Into<String>, role: Role) -> Self {
        Self {
            account_id: account_id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Anything with an owning account
pub trait Owned {
    fn owner_id(&self) -> &str;
}

/// Anything that goes through approval
pub trait Moderated: Owned {
    fn approval_status(&self) -> ApprovalStatus;
}

impl Owned for Document {
    fn owner_id(&self) -> &str {
        &self.uploader_id
    }
}

impl Moderated for Document {
    fn approval_status(&self) -> ApprovalStatus {
        self.status
    }
}

impl Owned for LibraryFile {
    fn owner_id(&self) -> &str {
        &self.uploader_id
    }
}

impl Moderated for LibraryFile {
    fn approval_status(&self) -> ApprovalStatus {
        LibraryFile::approval_status(self)
    }
}

impl Owned for Comment {
    fn owner_id(&self) -> &str {
        &self.author_id
    }
}

impl Owned for Rating {
    fn owner_id(&self) -> &str {
        &self.account_id
    }
}

fn owns<E: Owned + ?Sized>(entity: &E, actor: &Actor) -> bool {
    entity.owner_id() == actor.account_id
}

/// Admins see everything, owners see their own, everyone else sees approved only
pub fn can_view<E: Moderated + ?Sized>(entity: &E, actor: Option<&Actor>) -> bool {
    if entity.approval_status() == ApprovalStatus::Approved {
        return true;
    }

    match actor {
        Some(actor) => actor.is_admin() || owns(entity, actor),
        None => false,
    }
}

pub fn can_edit<E: Owned + ?Sized>(entity: &E, actor: &Actor) -> bool {
    actor.is_admin() || owns(entity, actor)
}

pub fn can_delete<E: Owned + ?Sized>(entity: &E, actor: &Actor) -> bool {
    can_edit(entity, actor)
}

/// Approve, reject, hide and refund are admin transitions
pub fn can_moderate(actor: &Actor) -> bool {
    actor.is_admin()
}

/// Status a newly submitted entity starts in
pub fn initial_status(role: Role) -> ApprovalStatus {
    match role {
        Role::Admin => ApprovalStatus::Approved,
        Role::Teacher | Role::User => ApprovalStatus::Pending,
    }
}

pub fn ensure_view<E: Moderated + ?Sized>(entity: &E, actor: Option<&Actor>, what: &str) -> Result<()> {
    if can_view(entity, actor) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!("Not allowed to view this {}", what)))
    }
}

pub fn ensure_edit<E: Owned + ?Sized>(entity: &E, actor: &Actor, what: &str) -> Result<()> {
    if can_edit(entity, actor) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!("Not allowed to modify this {}", what)))
    }
}

pub fn ensure_delete<E: Owned + ?Sized>(entity: &E, actor: &Actor, what: &str) -> Result<()> {
    if can_delete(entity, actor) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!("Not allowed to delete this {}", what)))
    }
}

pub fn ensure_moderator(actor: &Actor) -> Result<()> {
    if can_moderate(actor) {
        Ok(())
    } else {
        Err(AppError::Forbidden("Administrator role required".to_string()))
    }
}
