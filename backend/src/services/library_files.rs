//! Library file service
//!
//! Standalone priced files outside the document model. Any account may
//! upload; files from administrators are published immediately, everything
//! else waits for approval.

use crate::database::models::{ActivityKind, CreateLibraryFileRequest, LibraryFile, PageRequest, Paged};
use crate::database::repository::{categories, library_files, Visibility};
use crate::database::Repository;
use crate::error::{AppError, FieldError, Result};
use crate::services::access::{self, Actor};
use crate::services::activity::ActivityRecorder;
use crate::services::entitlement::{AccessBasis, ChargeOutcome, EntitlementEngine};
use crate::storage::{self, ObjectStore, ObjectStream};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct FileDownload {
    pub file: LibraryFile,
    pub outcome: ChargeOutcome,
    pub stream: ObjectStream,
}

#[derive(Clone)]
pub struct LibraryFileService {
    repo: Repository,
    store: Arc<dyn ObjectStore>,
    entitlement: EntitlementEngine,
    activity: ActivityRecorder,
    store_timeout: Duration,
    max_upload_bytes: u64,
}

impl LibraryFileService {
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

    pub async fn upload(&self, actor: &Actor, req: CreateLibraryFileRequest) -> Result<LibraryFile> {
        let mut errors = Vec::new();
        if req.name.trim().is_empty() {
            errors.push(FieldError::new("name", "Name is required"));
        }
        if req.price < 0 {
            errors.push(FieldError::new("price", "Price cannot be negative"));
        }
        if req.file.data.is_empty() {
            errors.push(FieldError::new("file", "File is empty"));
        } else if req.file.data.len() as u64 > self.max_upload_bytes {
            errors.push(FieldError::new(
                "file",
                format!("File exceeds {} bytes", self.max_upload_bytes),
            ));
        }
        if !errors.is_empty() {
            return Err(AppError::ValidationFailed(errors));
        }

        if let Some(category_id) = &req.category_id {
            let mut conn = self.repo.connection().await?;
            categories::get_category(&mut conn, category_id).await?;
        }

        let original_name = storage::sanitize_filename(&req.file.name);
        let object = storage::put_within(
            self.store.as_ref(),
            self.store_timeout,
            &req.file.data,
            &original_name,
            &req.file.mime_type,
        )
        .await?;
        let object_id = object.id.clone();

        let actor = actor.clone();
        let inserted = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let id = Uuid::new_v4().to_string();
                    let approver_id = actor.is_admin().then_some(actor.account_id.as_str());

                    let file = library_files::insert_file(
                        conn,
                        library_files::NewLibraryFile {
                            id: &id,
                            name: req.name.trim(),
                            description: req.description.as_deref(),
                            original_name: &original_name,
                            mime_type: &req.file.mime_type,
                            object: &object,
                            price: req.price,
                            category_id: req.category_id.as_deref(),
                            uploader_id: &actor.account_id,
                            approver_id,
                        },
                    )
                    .await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::UploadFile,
                        json!({ "library_file_id": id, "size": file.size }),
                    )
                    .await;

                    Ok(file)
                })
            })
            .await;

        match inserted {
            Ok(file) => {
                tracing::info!(
                    "Uploaded library file {} ({} bytes, approved: {})",
                    file.id,
                    file.size,
                    file.is_approved
                );
                Ok(file)
            }
            Err(e) => {
                storage::release(self.store.as_ref(), &[object_id]).await;
                Err(e)
            }
        }
    }

    pub async fn get(&self, actor: Option<&Actor>, file_id: &str) -> Result<LibraryFile> {
        let mut conn = self.repo.connection().await?;
        let file = library_files::get_file(&mut conn, file_id).await?;
        access::ensure_view(&file, actor, "file")?;
        Ok(file)
    }

    pub async fn list(
        &self,
        actor: Option<&Actor>,
        category_id: Option<&str>,
        page: PageRequest,
    ) -> Result<Paged<LibraryFile>> {
        let visibility = match actor {
            Some(actor) if actor.is_admin() => Visibility::All,
            Some(actor) => Visibility::ApprovedOrOwnedBy(actor.account_id.clone()),
            None => Visibility::ApprovedOnly,
        };

        let mut conn = self.repo.connection().await?;
        let (items, total) =
            library_files::list_files(&mut conn, &visibility, category_id, page).await?;
        Ok(Paged::new(items, total, page))
    }

    /// Open a file, charging its price unless the caller already holds it
    pub async fn download(&self, actor: &Actor, file_id: &str) -> Result<FileDownload> {
        let file = self.get(Some(actor), file_id).await?;

        let outcome = if access::can_edit(&file, actor) {
            ChargeOutcome::granted(AccessBasis::Owner)
        } else {
            self.entitlement
                .check_and_charge_file(&actor.account_id, file_id)
                .await?
        };

        if outcome.basis != AccessBasis::Purchased {
            let mut conn = self.repo.connection().await?;
            if let Err(e) = library_files::increment_download_count(&mut conn, file_id).await {
                tracing::warn!("Failed to count download of {}: {}", file_id, e);
            }
        }

        self.activity
            .record(
                &actor.account_id,
                ActivityKind::Download,
                json!({
                    "library_file_id": file_id,
                    "basis": outcome.basis,
                    "charged": outcome.charged(),
                }),
            )
            .await;

        let stream =
            storage::get_within(self.store.as_ref(), self.store_timeout, &file.object_id).await?;

        Ok(FileDownload {
            file,
            outcome,
            stream,
        })
    }

    /// Remove the record and its ratings, then release the blob
    pub async fn delete(&self, actor: &Actor, file_id: &str) -> Result<()> {
        let actor = actor.clone();
        let id = file_id.to_string();

        let file = self
            .repo
            .unit_of_work(move |conn| {
                Box::pin(async move {
                    let current = library_files::get_file(conn, &id).await?;
                    access::ensure_delete(&current, &actor, "file")?;

                    let file = library_files::delete_file(conn, &id).await?;

                    ActivityRecorder::record_in(
                        conn,
                        &actor.account_id,
                        ActivityKind::DeleteFile,
                        json!({ "library_file_id": id }),
                    )
                    .await;

                    Ok(file)
                })
            })
            .await?;

        storage::release(self.store.as_ref(), &[file.object_id]).await;

        tracing::info!("Deleted library file {}", file.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{Role, UploadedFile};
    use crate::services::moderation::ModerationService;
    use crate::test_support::{actor, fixture, Fixture};
    use tokio::io::AsyncReadExt;

    fn service(fx: &Fixture) -> LibraryFileService {
        LibraryFileService::new(
            fx.repo.clone(),
            fx.store.clone(),
            EntitlementEngine::new(fx.repo.clone(), 5),
            ActivityRecorder::new(fx.repo.clone()),
            Duration::from_secs(5),
            1024,
        )
    }

    fn request(price: i64) -> CreateLibraryFileRequest {
        CreateLibraryFileRequest {
            name: "Đề thi mẫu".to_string(),
            description: Some("Sample exam".to_string()),
            price,
            category_id: None,
            file: UploadedFile {
                name: "de-thi.docx".to_string(),
                mime_type: "application/octet-stream".to_string(),
                data: b"exam body".to_vec(),
            },
        }
    }

    #[tokio::test]
    async fn test_upload_needs_approval_unless_admin() {
        let fx = fixture().await;
        let admin = fx.account("admin", Role::Admin).await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let student = fx.account("student", Role::User).await;
        let service = service(&fx);

        let pending = service.upload(&actor(&teacher), request(10)).await.unwrap();
        assert!(!pending.is_approved);
        assert_eq!(pending.checksum.len(), 64);

        let published = service.upload(&actor(&admin), request(10)).await.unwrap();
        assert!(published.is_approved);

        let hidden = service.get(Some(&actor(&student)), &pending.id).await;
        assert!(matches!(hidden, Err(AppError::Forbidden(_))));

        let anonymous = service.list(None, None, PageRequest::default()).await.unwrap();
        assert_eq!(anonymous.total, 1);
        let owner = service
            .list(Some(&actor(&teacher)), None, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(owner.total, 2);

        ModerationService::new(fx.repo.clone())
            .approve_file(&actor(&admin), &pending.id)
            .await
            .unwrap();
        assert!(service.get(Some(&actor(&student)), &pending.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let fx = fixture().await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let service = service(&fx);

        let mut bad = request(-5);
        bad.name = " ".to_string();
        bad.file.data = vec![0; 2048];

        match service.upload(&actor(&teacher), bad).await {
            Err(AppError::ValidationFailed(errors)) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
                assert_eq!(fields, vec!["name", "price", "file"]);
            }
            other => panic!("expected validation failure, got {:?}", other.map(|f| f.id)),
        }

        let mut unknown_category = request(0);
        unknown_category.category_id = Some("missing".to_string());
        let result = service.upload(&actor(&teacher), unknown_category).await;
        assert!(matches!(result, Err(AppError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_download_charges_once() {
        let fx = fixture().await;
        let admin = fx.account("admin", Role::Admin).await;
        let student = fx.account("student", Role::User).await;
        fx.fund(&student.id, 30).await;
        let service = service(&fx);
        let file = service.upload(&actor(&admin), request(20)).await.unwrap();

        let mut first = service.download(&actor(&student), &file.id).await.unwrap();
        assert_eq!(first.outcome.basis, AccessBasis::Purchased);
        let mut body = Vec::new();
        first.stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"exam body");

        let second = service.download(&actor(&student), &file.id).await.unwrap();
        assert_eq!(second.outcome.basis, AccessBasis::AlreadyPurchased);
        assert_eq!(fx.balance(&student.id).await, 10);

        let stored = service.get(None, &file.id).await.unwrap();
        assert_eq!(stored.download_count, 2);
    }

    #[tokio::test]
    async fn test_delete_releases_blob() {
        let fx = fixture().await;
        let teacher = fx.account("teacher", Role::Teacher).await;
        let student = fx.account("student", Role::User).await;
        let service = service(&fx);
        let file = service.upload(&actor(&teacher), request(0)).await.unwrap();

        let denied = service.delete(&actor(&student), &file.id).await;
        assert!(matches!(denied, Err(AppError::Forbidden(_))));

        service.delete(&actor(&teacher), &file.id).await.unwrap();
        assert!(!fx.store.exists(&file.object_id).await);
        assert!(matches!(
            service.get(None, &file.id).await,
            Err(AppError::NotFound { .. })
        ));
    }
}
