//! Shared fixtures for unit tests: a file-backed database in a temp dir plus
//! shortcuts for seeding accounts, categories, documents and money.

use crate::database::models::{
    Account, ApprovalStatus, Category, CreateCategoryRequest, CreateDocumentRequest,
    CustomFieldsConfig, Document, EntryDetail, EntryKind, FileAttachment, LibraryFile,
    LocalizedKeywords, LocalizedText, Pricing, RegisterRequest, Role,
};
use crate::database::repository::{accounts, categories, documents, ledger, library_files};
use crate::database::{create_pool, Repository};
use crate::services::access::Actor;
use crate::storage::{BlobStore, ObjectStore};
use chrono::Utc;
use serde_json::Map;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

pub struct Fixture {
    pub repo: Repository,
    pub store: Arc<BlobStore>,
    pub temp: TempDir,
}

pub async fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let pool = create_pool(&temp.path().join("doclib.db")).await.unwrap();
    let store = BlobStore::new(temp.path().join("blobs"));
    store.initialize().await.unwrap();

    Fixture {
        repo: Repository::new(pool),
        store: Arc::new(store),
        temp,
    }
}

pub fn actor(account: &Account) -> Actor {
    Actor::new(account.id.clone(), account.role)
}

pub fn register_request(username: &str) -> RegisterRequest {
    RegisterRequest {
        username: username.to_string(),
        email: format!("{}@example.com", username),
        password: "correct horse battery".to_string(),
        full_name: format!("{} Tester", username),
        phone: None,
        address: None,
    }
}

pub fn document_request(category_id: &str, pricing: Pricing) -> CreateDocumentRequest {
    CreateDocumentRequest {
        category_id: category_id.to_string(),
        title: LocalizedText::new("Giáo trình", "Textbook"),
        summary: LocalizedText::new("Tóm tắt", "Summary"),
        keywords: LocalizedKeywords::default(),
        primary_language: "vi".to_string(),
        custom_fields: Map::new(),
        pricing,
        files: Vec::new(),
    }
}

pub fn priced(download_price: i64) -> Pricing {
    Pricing::Priced {
        view_price: 0,
        download_price,
    }
}

impl Fixture {
    pub async fn account(&self, username: &str, role: Role) -> Account {
        let mut conn = self.repo.connection().await.unwrap();
        accounts::insert_account(&mut conn, &register_request(username), "not-a-hash", role)
            .await
            .unwrap()
    }

    /// Deposit straight through the ledger
    pub async fn fund(&self, account_id: &str, amount: i64) {
        let account_id = account_id.to_string();
        self.repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    ledger::apply_entry(
                        conn,
                        &account_id,
                        EntryKind::Deposit,
                        amount,
                        "Seed deposit",
                        &EntryDetail::default(),
                    )
                    .await
                })
            })
            .await
            .unwrap();
    }

    pub async fn balance(&self, account_id: &str) -> i64 {
        let mut conn = self.repo.connection().await.unwrap();
        ledger::current_balance(&mut conn, account_id).await.unwrap()
    }

    pub async fn category(&self, code: &str, config: CustomFieldsConfig) -> Category {
        let mut conn = self.repo.connection().await.unwrap();
        let req = CreateCategoryRequest {
            code: code.to_string(),
            name: LocalizedText::new(code, code),
            description: None,
            parent_id: None,
            sort_order: 0,
            custom_fields_config: config,
        };
        categories::insert_category(&mut conn, &req).await.unwrap()
    }

    /// A document with one stored attachment
    pub async fn document(
        &self,
        uploader: &Account,
        category_id: &str,
        pricing: Pricing,
        status: ApprovalStatus,
    ) -> Document {
        let object = self
            .store
            .put(b"%PDF-1.7 fixture", "fixture.pdf", "application/pdf")
            .await
            .unwrap();

        let mut conn = self.repo.connection().await.unwrap();
        let id = Uuid::new_v4().to_string();
        let req = document_request(category_id, pricing);
        documents::insert_document(
            &mut conn,
            documents::NewDocument {
                id: &id,
                uploader_id: &uploader.id,
                status,
                approver_id: None,
                request: &req,
            },
        )
        .await
        .unwrap();

        let attachment = FileAttachment {
            id: Uuid::new_v4().to_string(),
            document_id: id.clone(),
            object_id: object.id.clone(),
            original_name: "fixture.pdf".to_string(),
            display_name: "fixture.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size: object.size,
            checksum: object.checksum.clone(),
            uploader_id: uploader.id.clone(),
            uploaded_at: Utc::now(),
        };
        documents::insert_attachment(&mut conn, &attachment)
            .await
            .unwrap();

        documents::get_document(&mut conn, &id).await.unwrap()
    }

    pub async fn library_file(&self, uploader: &Account, price: i64, approved: bool) -> LibraryFile {
        let object = self
            .store
            .put(b"slides", "slides.pptx", "application/octet-stream")
            .await
            .unwrap();

        let mut conn = self.repo.connection().await.unwrap();
        let id = Uuid::new_v4().to_string();
        library_files::insert_file(
            &mut conn,
            library_files::NewLibraryFile {
                id: &id,
                name: "Slides",
                description: None,
                original_name: "slides.pptx",
                mime_type: "application/octet-stream",
                object: &object,
                price,
                category_id: None,
                uploader_id: &uploader.id,
                approver_id: approved.then_some(uploader.id.as_str()),
            },
        )
        .await
        .unwrap()
    }
}
