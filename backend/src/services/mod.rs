//! Services module
//!
//! Business logic that coordinates the repository, the object store and the
//! activity recorder. Every operation takes the calling [`Actor`] explicitly.

pub mod access;
pub mod accounts;
pub mod activity;
pub mod categories;
pub mod comments;
pub mod documents;
pub mod entitlement;
pub mod library_files;
pub mod moderation;
pub mod ratings;
pub mod retention;
pub mod validator;

pub use access::Actor;
pub use accounts::AccountService;
pub use activity::ActivityRecorder;
pub use categories::CategoryService;
pub use comments::CommentService;
pub use documents::DocumentService;
pub use entitlement::EntitlementEngine;
pub use library_files::LibraryFileService;
pub use moderation::ModerationService;
pub use ratings::RatingService;
pub use retention::RetentionService;
