//! Database models
//!
//! Rust structs representing database entities.
//! Status and kind columns are TEXT in SQLite and typed enums here; nested
//! metadata lives in JSON columns wrapped in [`Json`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;

// ===== Accounts =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    User,
}

/// A registered account and its wallet balance
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub role: Role,
    pub is_active: bool,
    /// Spendable balance in the smallest currency unit
    pub balance: i64,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

// ===== Localized text =====

/// Text in the two library languages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedText {
    pub vi: String,
    #[serde(default)]
    pub en: String,
}

impl LocalizedText {
    pub fn new(vi: impl Into<String>, en: impl Into<String>) -> Self {
        Self {
            vi: vi.into(),
            en: en.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedKeywords {
    #[serde(default)]
    pub vi: Vec<String>,
    #[serde(default)]
    pub en: Vec<String>,
}

// ===== Custom field schema =====

/// Declared type of a custom field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
    /// Value must be one of the field's `options`
    Select,
    /// Unknown kinds are accepted without a type check
    #[serde(other)]
    Any,
}

/// Extra constraints declared for a custom field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<FieldConstraints>,
}

impl FieldSpec {
    pub fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            options: Vec::new(),
            validation: None,
        }
    }

    pub fn with_validation(mut self, validation: FieldConstraints) -> Self {
        self.validation = Some(validation);
        self
    }
}

/// Per-category schema for document custom fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldsConfig {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
    #[serde(default, rename = "fieldTypes")]
    pub field_types: BTreeMap<String, FieldSpec>,
}

// ===== Categories =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Category {
    pub id: String,
    pub code: String,
    pub name: Json<LocalizedText>,
    pub description: Option<Json<LocalizedText>>,
    pub parent_id: Option<String>,
    pub sort_order: i64,
    pub is_active: bool,
    pub custom_fields_config: Json<CustomFieldsConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCategoryRequest {
    pub code: String,
    pub name: LocalizedText,
    pub description: Option<LocalizedText>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub custom_fields_config: CustomFieldsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateCategoryRequest {
    pub code: Option<String>,
    pub name: Option<LocalizedText>,
    pub description: Option<LocalizedText>,
    /// `Some(None)` detaches the category from its parent
    pub parent_id: Option<Option<String>>,
    pub sort_order: Option<i64>,
    pub is_active: Option<bool>,
    pub custom_fields_config: Option<CustomFieldsConfig>,
}

/// A category with its descendants, ordered by sort order then name
#[derive(Debug, Clone, Serialize)]
pub struct CategoryNode {
    #[serde(flatten)]
    pub category: Category,
    pub document_count: i64,
    pub children: Vec<CategoryNode>,
}

// ===== Documents =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// How a document is paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pricing {
    Free,
    Priced { view_price: i64, download_price: i64 },
}

/// A binary file attached to a document; bytes live in the object store
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileAttachment {
    pub id: String,
    pub document_id: String,
    pub object_id: String,
    pub original_name: String,
    pub display_name: String,
    pub mime_type: String,
    pub size: i64,
    /// SHA-256 of the uploaded bytes
    pub checksum: String,
    pub uploader_id: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub id: String,
    pub category_id: String,
    pub uploader_id: String,
    pub title: Json<LocalizedText>,
    pub summary: Json<LocalizedText>,
    pub keywords: Json<LocalizedKeywords>,
    pub primary_language: String,
    pub custom_fields: Json<Map<String, Value>>,
    pub is_free: bool,
    pub view_price: i64,
    pub download_price: i64,
    pub status: ApprovalStatus,
    pub approver_id: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub view_count: i64,
    pub download_count: i64,
    pub rating_average: f64,
    pub rating_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    pub files: Vec<FileAttachment>,
}

impl Document {
    pub fn pricing(&self) -> Pricing {
        if self.is_free {
            Pricing::Free
        } else {
            Pricing::Priced {
                view_price: self.view_price,
                download_price: self.download_price,
            }
        }
    }

    pub fn file(&self, file_id: &str) -> Option<&FileAttachment> {
        self.files.iter().find(|f| f.id == file_id)
    }
}

/// Raw bytes handed in by the caller for upload
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CreateDocumentRequest {
    pub category_id: String,
    pub title: LocalizedText,
    pub summary: LocalizedText,
    pub keywords: LocalizedKeywords,
    pub primary_language: String,
    pub custom_fields: Map<String, Value>,
    pub pricing: Pricing,
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateDocumentRequest {
    pub category_id: Option<String>,
    pub title: Option<LocalizedText>,
    pub summary: Option<LocalizedText>,
    pub keywords: Option<LocalizedKeywords>,
    pub custom_fields: Option<Map<String, Value>>,
    pub pricing: Option<Pricing>,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub category_id: Option<String>,
    pub status: Option<ApprovalStatus>,
    pub uploader_id: Option<String>,
    pub free_only: Option<bool>,
}

// ===== Library files =====

/// A standalone priced file with its own approval flag
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LibraryFile {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub object_id: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub checksum: String,
    pub price: i64,
    pub category_id: Option<String>,
    pub uploader_id: String,
    pub is_approved: bool,
    pub approver_id: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub download_count: i64,
    pub rating_average: f64,
    pub rating_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LibraryFile {
    pub fn approval_status(&self) -> ApprovalStatus {
        if self.is_approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Pending
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateLibraryFileRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    pub category_id: Option<String>,
    pub file: UploadedFile,
}

// ===== Ledger =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EntryKind {
    Deposit,
    Purchase,
    Refund,
    Bonus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// One immutable monetary event; `balance_after = balance_before + amount`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: String,
    pub account_id: String,
    pub kind: EntryKind,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub description: String,
    pub document_id: Option<String>,
    pub attachment_id: Option<String>,
    pub library_file_id: Option<String>,
    pub external_ref: Option<String>,
    pub payment_method: Option<String>,
    pub reference_entry_id: Option<String>,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

/// What a ledger entry points at besides the account
#[derive(Debug, Clone, Default)]
pub struct EntryDetail {
    pub document_id: Option<String>,
    pub attachment_id: Option<String>,
    pub library_file_id: Option<String>,
    pub external_ref: Option<String>,
    pub payment_method: Option<String>,
    pub reference_entry_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub kind: Option<EntryKind>,
    pub status: Option<EntryStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct KindTotal {
    pub kind: EntryKind,
    pub total: i64,
    pub count: i64,
}

// ===== Comments =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CommentStatus {
    Active,
    Hidden,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Comment {
    pub id: String,
    pub document_id: String,
    pub author_id: String,
    pub parent_id: Option<String>,
    pub content: String,
    pub status: CommentStatus,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub approver_id: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub like_count: i64,
    pub reply_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LikeToggle {
    pub liked: bool,
    pub total_likes: i64,
}

// ===== Ratings =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RatingTargetKind {
    Document,
    File,
}

/// The rated entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RatingTarget {
    Document(String),
    File(String),
}

impl RatingTarget {
    pub fn kind(&self) -> RatingTargetKind {
        match self {
            RatingTarget::Document(_) => RatingTargetKind::Document,
            RatingTarget::File(_) => RatingTargetKind::File,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RatingTarget::Document(id) | RatingTarget::File(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RatingStatus {
    Active,
    Hidden,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Rating {
    pub id: String,
    pub target_kind: RatingTargetKind,
    pub target_id: String,
    pub account_id: String,
    pub score: i64,
    pub review: Option<String>,
    pub status: RatingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rating {
    pub fn target(&self) -> RatingTarget {
        match self.target_kind {
            RatingTargetKind::Document => RatingTarget::Document(self.target_id.clone()),
            RatingTargetKind::File => RatingTarget::File(self.target_id.clone()),
        }
    }
}

/// Derived rating figures stored on the rated entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatingAggregate {
    pub average: f64,
    pub count: i64,
}

// ===== Activity =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ActivityKind {
    Register,
    Login,
    UpdateProfile,
    UpdateAccount,
    Deposit,
    Purchase,
    Refund,
    Bonus,
    CreateCategory,
    UpdateCategory,
    DeleteCategory,
    UploadDocument,
    ViewDocument,
    UpdateDocument,
    DeleteDocument,
    ApproveDocument,
    RejectDocument,
    ResubmitDocument,
    Download,
    UploadFile,
    ApproveFile,
    DeleteFile,
    Comment,
    UpdateComment,
    DeleteComment,
    ApproveComment,
    HideComment,
    Rate,
    UpdateRating,
    DeleteRating,
    ToggleRating,
}

/// Append-only audit record; never consulted for business decisions
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityRecord {
    pub id: String,
    pub account_id: String,
    pub kind: ActivityKind,
    pub detail: Json<Value>,
    pub created_at: DateTime<Utc>,
}

// ===== Paging =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: crate::config::DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page, per_page }
    }

    /// Clamp to a valid page and size
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, crate::config::MAX_PAGE_SIZE),
        }
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.normalized().per_page)
    }

    pub fn offset(&self) -> i64 {
        let page = self.normalized();
        i64::from(page.page - 1) * i64::from(page.per_page)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

impl<T> Paged<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        let request = request.normalized();
        Self {
            items,
            total,
            page: request.page,
            per_page: request.per_page,
        }
    }

    pub fn total_pages(&self) -> i64 {
        let per_page = i64::from(self.per_page);
        (self.total + per_page - 1) / per_page
    }
}
