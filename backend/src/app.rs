//! Application state and initialization
//!
//! Builds every service from one [`AppConfig`]. Services are cheap clones
//! sharing the pool and the object store, so callers may hand them out freely.

use crate::config::AppConfig;
use crate::database::{create_pool, Repository};
use crate::error::Result;
use crate::services::{
    AccountService, ActivityRecorder, CategoryService, CommentService, DocumentService,
    EntitlementEngine, LibraryFileService, ModerationService, RatingService, RetentionService,
};
use crate::storage::{BlobStore, ObjectStore};
use std::sync::Arc;
use std::time::Duration;

/// Central application state holding all services
pub struct App {
    pub config: AppConfig,
    pub repo: Repository,
    pub store: Arc<dyn ObjectStore>,
    pub activity: ActivityRecorder,
    pub accounts: AccountService,
    pub entitlement: EntitlementEngine,
    pub moderation: ModerationService,
    pub categories: CategoryService,
    pub documents: DocumentService,
    pub library_files: LibraryFileService,
    pub comments: CommentService,
    pub ratings: RatingService,
    pub retention: RetentionService,
}

impl App {
    /// Validate the config, open the database and blob root, wire services
    pub async fn build(config: AppConfig) -> Result<Self> {
        tracing::info!("Initializing application");
        config.validate()?;

        if let Some(parent) = config.database_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = create_pool(&config.database_path).await?;
        let repo = Repository::new(pool);

        let blob_store = BlobStore::new(config.blob_root.clone());
        blob_store.initialize().await?;
        let store: Arc<dyn ObjectStore> = Arc::new(blob_store);

        Self::with_store(config, repo, store).await
    }

    /// Wire services around an existing repository and object store
    pub async fn with_store(
        config: AppConfig,
        repo: Repository,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let store_timeout = Duration::from_secs(config.object_store_timeout_secs);
        let activity = ActivityRecorder::new(repo.clone());
        let entitlement = EntitlementEngine::new(repo.clone(), config.max_charge_attempts);

        let documents = DocumentService::new(
            repo.clone(),
            Arc::clone(&store),
            entitlement.clone(),
            activity.clone(),
            store_timeout,
            config.max_upload_bytes,
        );
        let library_files = LibraryFileService::new(
            repo.clone(),
            Arc::clone(&store),
            entitlement.clone(),
            activity.clone(),
            store_timeout,
            config.max_upload_bytes,
        );
        let retention =
            RetentionService::new(activity.clone(), config.activity_retention_days).await?;

        let app = Self {
            accounts: AccountService::new(repo.clone(), activity.clone()),
            moderation: ModerationService::new(repo.clone()),
            categories: CategoryService::new(repo.clone()),
            comments: CommentService::new(repo.clone()),
            ratings: RatingService::new(repo.clone()),
            documents,
            library_files,
            retention,
            entitlement,
            activity,
            store,
            repo,
            config,
        };

        tracing::info!("Application initialized successfully");
        Ok(app)
    }

    /// Schedule and start the activity purge job
    pub async fn start_background_jobs(&self) -> Result<()> {
        self.retention
            .schedule(&self.config.retention_schedule)
            .await?;
        self.retention.start().await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.retention.shutdown().await?;
        self.repo.pool().close().await;
        tracing::info!("Application shut down");
        Ok(())
    }
}
