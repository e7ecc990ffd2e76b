//! Document service
//!
//! Ties records, the object store, moderation and the entitlement engine
//! together. Attachments are uploaded before the record is inserted, so a
//! failed upload never leaves a document behind; blobs of a failed insert or
//! a deleted document are released best-effort.

use crate::database::models::{
    ActivityKind, Category, CreateDocumentRequest, Document, DocumentFilter, FileAttachment,
    PageRequest, Paged, Pricing, UpdateDocumentRequest, UploadedFile,
};
use crate::database::repository::{categories, documents, Visibility};
use crate::database::Repository;
use crate::error::{AppError, FieldError, Result};
use crate::services::access::{self, Actor};
use crate::services::activity::ActivityRecorder;
use crate::services::entitlement::{AccessBasis, ChargeOutcome, EntitlementEngine};
use crate::services::moderation::ModerationService;
use crate::services::validator;
use crate::storage::{self, ObjectStore, ObjectStream, StoredObject};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const LANGUAGES: [&str; 2] = ["vi", "en"];

/// An opened attachment plus how access to it was granted
pub struct Download {
    pub attachment: FileAttachment,
    pub outcome: ChargeOutcome,
    pub stream: ObjectStream,
}

#[derive(Clone)]
pub struct DocumentService {
    repo: Repository,
    store: Arc<dyn ObjectStore>,
    entitlement: EntitlementEngine,
    activity: ActivityRecorder,
    store_timeout: Duration,
    max_upload_bytes: u64,
}

impl DocumentService {
    pub fn new(
        repo: Repository,
        store: Arc<dyn ObjectStore>,
        entitlement: EntitlementEngine,
        activity: ActivityRecorder,
        store_timeout: Duration,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            repo,
            store,
            entitlement,
            activity,
            store_timeout,
            max_upload_bytes,
        }
    }

    /// Create a document with its attachments
    pub async fn create(&self, actor: &Actor, req: CreateDocumentRequest) -> Result<Document> {
        let category = self.category(&req.category_id).await?;

        let mut errors = self.check_request(&req);
        if !category.is_active {
            errors.push(FieldError::new("category_id", "Category is not active"));
        }
        errors.extend(validator::validate(
            &category.custom_fields_config,
            &req.custom_fields,
        ));
        if !errors.is_empty() {
            return Err(AppError::ValidationFailed(errors));
        }

        let uploaded = self.upload_all(&req.files).await?;
        let object_ids: Vec<String> = uploaded.iter().map(|(_, o)| o.id.clone()).collect();

        let id = Uuid::new_v4().to_string();
        let status = ModerationService::submit(actor.role);
        let uploader_id = actor.account_id.clone();
        let approver_id = actor.is_admin().then(|| actor.account_id.clone());

        let inserted = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    documents::insert_document(
                        conn,
                        documents::NewDocument {
                            id: &id,
                            uploader_id: &uploader_id,
                            status,
                            approver_id: approver_id.as_deref(),
                            request: &req,
                        },
                    )
                    .await?;

                    let now = Utc::now();
                    for (file, object) in &uploaded {
                        let name = storage::sanitize_filename(&file.name);
                        let attachment = FileAttachment {
                            id: Uuid::new_v4().to_string(),
                            document_id: id.clone(),
                            object_id: object.id.clone(),
                            original_name: name.clone(),
                            display_name: name,
                            mime_type: file.mime_type.clone(),
                            size: object.size,
                            checksum: object.checksum.clone(),
                            uploader_id: uploader_id.clone(),
                            uploaded_at: now,
                        };
                        documents::insert_attachment(conn, &attachment).await?;
                    }

                    ActivityRecorder::record_in(
                        conn,
                        &uploader_id,
                        ActivityKind::UploadDocument,
                        json!({ "document_id": id, "files": uploaded.len(), "status": status }),
                    )
                    .await;

                    documents::get_document(conn, &id).await
                })
            })
            .await;

        match inserted {
            Ok(document) => {
                tracing::info!(
                    "Created document {} with {} files ({:?})",
                    document.id,
                    document.files.len(),
                    document.status
                );
                Ok(document)
            }
            Err(e) => {
                tracing::warn!("Document insert failed, releasing uploads: {}", e);
                storage::release(self.store.as_ref(), &object_ids).await;
                Err(e)
            }
        }
    }

    /// Fetch a document the caller may see and count the view
    pub async fn get(&self, actor: Option<&Actor>, document_id: &str) -> Result<Document> {
        let mut conn = self.repo.connection().await?;
        let mut document = documents::get_document(&mut conn, document_id).await?;
        access::ensure_view(&document, actor, "document")?;

        match documents::increment_view_count(&mut conn, document_id).await {
            Ok(()) => document.view_count += 1,
            Err(e) => tracing::warn!("Failed to count view of {}: {}", document_id, e),
        }
        drop(conn);

        if let Some(actor) = actor {
            self.activity
                .record(
                    &actor.account_id,
                    ActivityKind::ViewDocument,
                    json!({ "document_id": document_id }),
                )
                .await;
        }

        Ok(document)
    }

    /// Listing restricted to what the caller may see
    pub async fn list(
        &self,
        actor: Option<&Actor>,
        filter: &DocumentFilter,
        page: PageRequest,
    ) -> Result<Paged<Document>> {
        let visibility = match actor {
            Some(actor) if actor.is_admin() => Visibility::All,
            Some(actor) => Visibility::ApprovedOrOwnedBy(actor.account_id.clone()),
            None => Visibility::ApprovedOnly,
        };

        let mut conn = self.repo.connection().await?;
        let (items, total) = documents::list_documents(&mut conn, &visibility, filter, page).await?;
        Ok(Paged::new(items, total, page))
    }

    /// Edit metadata. Status is left alone; a rejected document needs an
    /// explicit re-submit to return to the queue.
    pub async fn update(
        &self,
        actor: &Actor,
        document_id: &str,
        req: UpdateDocumentRequest,
    ) -> Result<Document> {
        let mut errors = Vec::new();
        if let Some(title) = &req.title {
            check_title(&title.vi, &mut errors);
        }
        if let Some(pricing) = req.pricing {
            check_pricing(pricing, &mut errors);
        }
        if !errors.is_empty() {
            return Err(AppError::ValidationFailed(errors));
        }

        let actor = actor.clone();
        let id = document_id.to_string();

        let document = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = documents::get_document(conn, &id).await?;
                    access::ensure_edit(&current, &actor, "document")?;

                    if req.category_id.is_some() || req.custom_fields.is_some() {
                        let category_id = req.category_id.as_deref().unwrap_or(&current.category_id);
                        let category = categories::get_category(conn, category_id).await?;
                        let fields = req.custom_fields.as_ref().unwrap_or(&current.custom_fields.0);
                        validator::ensure_valid(&category.custom_fields_config, fields)?;
                    }

                    let changes = documents::DocumentChanges {
                        category_id: req.category_id,
                        title: req.title,
                        summary: req.summary,
                        keywords: req.keywords,
                        custom_fields: req.custom_fields,
                        pricing: req.pricing,
                    };
                    let document = documents::update_document(conn, &id, &changes).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::UpdateDocument,
                        json!({ "document_id": id }),
                    )
                    .await;

                    Ok(document)
                })
            })
            .await?;

        tracing::info!("Updated document {}", document.id);
        Ok(document)
    }

    /// Delete the record, then release its blobs
    pub async fn delete(&self, actor: &Actor, document_id: &str) -> Result<()> {
        let actor = actor.clone();
        let id = document_id.to_string();

        let files = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = documents::get_document(conn, &id).await?;
                    access::ensure_delete(&current, &actor, "document")?;

                    let files = documents::delete_document(conn, &id).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::DeleteDocument,
                        json!({ "document_id": id, "files": files.len() }),
                    )
                    .await;

                    Ok(files)
                })
            })
            .await?;

        let object_ids: Vec<String> = files.into_iter().map(|f| f.object_id).collect();
        storage::release(self.store.as_ref(), &object_ids).await;

        tracing::info!("Deleted document {}", document_id);
        Ok(())
    }

    /// Open an attachment, charging the caller when a purchase is needed.
    /// Without `file_id` the first attachment is used.
    pub async fn download(
        &self,
        actor: &Actor,
        document_id: &str,
        file_id: Option<&str>,
    ) -> Result<Download> {
        let mut conn = self.repo.connection().await?;
        let document = documents::get_document(&mut conn, document_id).await?;
        drop(conn);
        access::ensure_view(&document, Some(actor), "document")?;

        let attachment = match file_id {
            Some(file_id) => document.file(file_id),
            None => document.files.first(),
        }
        .cloned()
        .ok_or_else(|| {
            AppError::not_found("FileAttachment", file_id.unwrap_or(document_id))
        })?;

        let outcome = if access::can_edit(&document, actor) {
            ChargeOutcome::granted(AccessBasis::Owner)
        } else {
            self.entitlement
                .check_and_charge(&actor.account_id, document_id, Some(&attachment.id))
                .await?
        };

        if outcome.basis != AccessBasis::Purchased {
            self.count_download(document_id).await;
        }

        self.activity
            .record(
                &actor.account_id,
                ActivityKind::Download,
                json!({
                    "document_id": document_id,
                    "file_id": attachment.id,
                    "basis": outcome.basis,
                    "charged": outcome.charged(),
                }),
            )
            .await;

        let stream =
            storage::get_within(self.store.as_ref(), self.store_timeout, &attachment.object_id)
                .await?;

        Ok(Download {
            attachment,
            outcome,
            stream,
        })
    }

    async fn count_download(&self, document_id: &str) {
        let counted = async {
            let mut conn = self.repo.connection().await?;
            documents::increment_download_count(&mut conn, document_id).await
        }
        .await;

        if let Err(e) = counted {
            tracing::warn!("Failed to count download of {}: {}", document_id, e);
        }
    }

    async fn category(&self, category_id: &str) -> Result<Category> {
        let mut conn = self.repo.connection().await?;
        categories::get_category(&mut conn, category_id).await
    }

    fn check_request(&self, req: &CreateDocumentRequest) -> Vec<FieldError> {
        let mut errors = Vec::new();

        check_title(&req.title.vi, &mut errors);
        if !LANGUAGES.contains(&req.primary_language.as_str()) {
            errors.push(FieldError::new(
                "primary_language",
                format!("Language must be one of: {}", LANGUAGES.join(", ")),
            ));
        }
        check_pricing(req.pricing, &mut errors);

        for (index, file) in req.files.iter().enumerate() {
            if storage::sanitize_filename(&file.name).trim().is_empty() {
                errors.push(FieldError::new(
                    format!("files[{}]", index),
                    "File name is required",
                ));
            }
            if file.data.len() as u64 > self.max_upload_bytes {
                errors.push(FieldError::new(
                    format!("files[{}]", index),
                    format!("File exceeds {} bytes", self.max_upload_bytes),
                ));
            }
        }

        errors
    }

    /// Upload every file or none: a failure releases what was already stored
    async fn upload_all(
        &self,
        files: &[UploadedFile],
    ) -> Result<Vec<(UploadedFile, StoredObject)>> {
        let mut uploaded: Vec<(UploadedFile, StoredObject)> = Vec::with_capacity(files.len());

        for file in files {
            let stored = storage::put_within(
                self.store.as_ref(),
                self.store_timeout,
                &file.data,
                &storage::sanitize_filename(&file.name),
                &file.mime_type,
            )
            .await;

            match stored {
                Ok(object) => uploaded.push((file.clone(), object)),
                Err(e) => {
                    tracing::warn!("Upload of {} failed: {}", file.name, e);
                    let ids: Vec<String> = uploaded.iter().map(|(_, o)| o.id.clone()).collect();
                    storage::release(self.store.as_ref(), &ids).await;
                    return Err(e);
                }
            }
        }

        Ok(uploaded)
    }
}

fn check_title(title: &str, errors: &mut Vec<FieldError>) {
    if title.trim().is_empty() {
        errors.push(FieldError::new("title.vi", "Title is required"));
    }
}

fn check_pricing(pricing: Pricing, errors: &mut Vec<FieldError>) {
    if let Pricing::Priced {
        view_price,
        download_price,
    } = pricing
    {
        if view_price < 0 || download_price < 0 {
            errors.push(FieldError::new("pricing", "Prices cannot be negative"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ApprovalStatus, Role};
    use crate::error::ErrorKind;
    use crate::storage::BlobStore;
    use crate::test_support::{actor, document_request, fixture, priced, Fixture};
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;

    fn service_with(fx: &Fixture, store: Arc<dyn ObjectStore>) -> DocumentService {
        DocumentService::new(
            fx.repo.clone(),
            store,
            EntitlementEngine::new(fx.repo.clone(), 5),
            ActivityRecorder::new(fx.repo.clone()),
            Duration::from_secs(5),
            1024,
        )
    }

    fn service(fx: &Fixture) -> DocumentService {
        service_with(fx, fx.store.clone())
    }

    fn custom_fields(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    fn pdf(name: &str) -> UploadedFile {
        UploadedFile {
            name: name.to_string(),
            mime_type: "application/pdf".to_string(),
            data: b"%PDF-1.7 body".to_vec(),
        }
    }

    fn thesis_config() -> crate::database::models::CustomFieldsConfig {
        serde_json::from_value(json!({
            "required": ["author"],
            "fieldTypes": { "year": { "type": "number", "validation": { "min": 1900 } } }
        }))
        .unwrap()
    }

    /// Accepts the first `ok` puts and fails after that
    struct FlakyStore {
        inner: BlobStore,
        ok: usize,
        puts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(&self, data: &[u8], name: &str, mime_type: &str) -> Result<StoredObject> {
            let n = self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n >= self.ok {
                return Err(AppError::ExternalStore("disk full".to_string()));
            }
            self.inner.put(data, name, mime_type).await
        }

        async fn get(&self, id: &str) -> Result<ObjectStream> {
            self.inner.get(id).await
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.inner.delete(id).await
        }
    }

    async fn blob_count(fx: &Fixture) -> usize {
        let mut count = 0;
        let mut dirs = vec![fx.store.root().to_path_buf()];
        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
            while let Some(entry) = entries.next_entry().await.unwrap() {
                let path = entry.path();
                if path.is_dir() {
                    dirs.push(path);
                } else if path.extension().is_none() {
                    count += 1;
                }
            }
        }
        count
    }

    #[tokio::test]
    async fn test_create_status_depends_on_role() {
        let fx = fixture().await;
        let admin = fx.account("admin", Role::Admin).await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let category = fx.category("lectures", Default::default()).await;
        let service = service(&fx);

        let mut req = document_request(&category.id, Pricing::Free);
        req.files = vec![pdf("chapter-1.pdf"), pdf("chapter-2.pdf")];

        let by_teacher = service.create(&actor(&teacher), req.clone()).await.unwrap();
        assert_eq!(by_teacher.status, ApprovalStatus::Pending);
        assert_eq!(by_teacher.files.len(), 2);
        assert!(by_teacher.approver_id.is_none());

        let by_admin = service.create(&actor(&admin), req).await.unwrap();
        assert_eq!(by_admin.status, ApprovalStatus::Approved);
        assert_eq!(by_admin.approver_id.as_deref(), Some(admin.id.as_str()));
    }

    #[tokio::test]
    async fn test_create_reports_all_field_errors_and_uploads_nothing() {
        let fx = fixture().await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let category = fx.category("thesis", thesis_config()).await;
        let service = service(&fx);

        let mut req = document_request(&category.id, priced(-1));
        req.title.vi = " ".to_string();
        req.custom_fields = custom_fields(json!({ "year": 1800 }));
        req.files = vec![pdf("ok.pdf")];

        match service.create(&actor(&teacher), req).await {
            Err(AppError::ValidationFailed(errors)) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
                assert_eq!(
                    fields,
                    vec!["title.vi", "pricing", "customFields.author", "customFields.year"]
                );
            }
            other => panic!("expected validation failure, got {:?}", other.map(|d| d.id)),
        }
        assert_eq!(blob_count(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_failed_upload_creates_no_document() {
        let fx = fixture().await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let category = fx.category("lectures", Default::default()).await;
        let flaky = Arc::new(FlakyStore {
            inner: (*fx.store).clone(),
            ok: 1,
            puts: Default::default(),
        });
        let service = service_with(&fx, flaky);

        let mut req = document_request(&category.id, Pricing::Free);
        req.files = vec![pdf("one.pdf"), pdf("two.pdf")];

        let err = service.create(&actor(&teacher), req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalStoreFailure);

        let listed = service
            .list(Some(&actor(&teacher)), &DocumentFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(listed.total, 0);
        assert_eq!(blob_count(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_visibility_by_role() {
        let fx = fixture().await;
        let admin = fx.account("admin", Role::Admin).await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let other = fx.account("other", Role::Teacher).await;
        let category = fx.category("lectures", Default::default()).await;
        let approved = fx
            .document(&teacher, &category.id, Pricing::Free, ApprovalStatus::Approved)
            .await;
        let pending = fx
            .document(&teacher, &category.id, Pricing::Free, ApprovalStatus::Pending)
            .await;
        let service = service(&fx);
        let all = DocumentFilter::default();

        let anonymous = service.list(None, &all, PageRequest::default()).await.unwrap();
        assert_eq!(anonymous.total, 1);
        let stranger = service
            .list(Some(&actor(&other)), &all, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(stranger.total, 1);
        let owner = service
            .list(Some(&actor(&teacher)), &all, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(owner.total, 2);
        let moderator = service
            .list(Some(&actor(&admin)), &all, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(moderator.total, 2);

        assert!(matches!(
            service.get(Some(&actor(&other)), &pending.id).await,
            Err(AppError::Forbidden(_))
        ));
        let viewed = service.get(None, &approved.id).await.unwrap();
        assert_eq!(viewed.view_count, 1);
    }

    #[tokio::test]
    async fn test_update_revalidates_and_keeps_status() {
        let fx = fixture().await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let other = fx.account("other", Role::User).await;
        let loose = fx.category("loose", Default::default()).await;
        let strict = fx.category("strict", thesis_config()).await;
        let doc = fx
            .document(&teacher, &loose.id, Pricing::Free, ApprovalStatus::Rejected)
            .await;
        let service = service(&fx);

        let move_to_strict = UpdateDocumentRequest {
            category_id: Some(strict.id.clone()),
            ..Default::default()
        };
        let result = service
            .update(&actor(&teacher), &doc.id, move_to_strict)
            .await;
        assert!(matches!(result, Err(AppError::ValidationFailed(_))));

        let denied = service
            .update(&actor(&other), &doc.id, UpdateDocumentRequest::default())
            .await;
        assert!(matches!(denied, Err(AppError::Forbidden(_))));

        let fixed = UpdateDocumentRequest {
            category_id: Some(strict.id.clone()),
            custom_fields: Some(custom_fields(json!({ "author": "Lan", "year": 2020 }))),
            pricing: Some(priced(15)),
            ..Default::default()
        };
        let updated = service.update(&actor(&teacher), &doc.id, fixed).await.unwrap();
        assert_eq!(updated.category_id, strict.id);
        assert_eq!(updated.download_price, 15);
        assert!(!updated.is_free);
        assert_eq!(updated.status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_blobs() {
        let fx = fixture().await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let other = fx.account("other", Role::User).await;
        let category = fx.category("lectures", Default::default()).await;
        let doc = fx
            .document(&teacher, &category.id, Pricing::Free, ApprovalStatus::Approved)
            .await;
        let service = service(&fx);

        let denied = service.delete(&actor(&other), &doc.id).await;
        assert!(matches!(denied, Err(AppError::Forbidden(_))));

        service.delete(&actor(&teacher), &doc.id).await.unwrap();

        assert!(matches!(
            service.get(None, &doc.id).await,
            Err(AppError::NotFound { .. })
        ));
        assert!(!fx.store.exists(&doc.files[0].object_id).await);
    }

    #[tokio::test]
    async fn test_download_charges_then_streams() {
        let fx = fixture().await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let student = fx.account("student", Role::User).await;
        let category = fx.category("lectures", Default::default()).await;
        let doc = fx
            .document(&teacher, &category.id, priced(30), ApprovalStatus::Approved)
            .await;
        fx.fund(&student.id, 50).await;
        let service = service(&fx);

        let mut first = service
            .download(&actor(&student), &doc.id, None)
            .await
            .unwrap();
        assert_eq!(first.outcome.basis, AccessBasis::Purchased);
        let mut body = Vec::new();
        first.stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"%PDF-1.7 fixture");

        let again = service
            .download(&actor(&student), &doc.id, Some(&doc.files[0].id))
            .await
            .unwrap();
        assert_eq!(again.outcome.basis, AccessBasis::AlreadyPurchased);
        assert_eq!(fx.balance(&student.id).await, 20);

        let own = service
            .download(&actor(&teacher), &doc.id, None)
            .await
            .unwrap();
        assert_eq!(own.outcome.basis, AccessBasis::Owner);

        let stored = service.get(None, &doc.id).await.unwrap();
        assert_eq!(stored.download_count, 3);
    }
}
