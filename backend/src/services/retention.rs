//! Activity retention
//!
//! Runs the activity purge on a cron schedule. Only one purge job exists at a
//! time; rescheduling replaces it.

use crate::error::{AppError, Result};
use crate::services::activity::ActivityRecorder;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub struct RetentionService {
    scheduler: Arc<RwLock<JobScheduler>>,
    recorder: ActivityRecorder,
    retention_days: u32,
    current_job_id: Arc<RwLock<Option<Uuid>>>,
}

impl RetentionService {
    pub async fn new(recorder: ActivityRecorder, retention_days: u32) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            recorder,
            retention_days,
            current_job_id: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn start(&self) -> Result<()> {
        let scheduler = self.scheduler.read().await;
        scheduler
            .start()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to start scheduler: {}", e)))?;
        tracing::info!("Retention scheduler started");
        Ok(())
    }

    /// Install the purge job for a six-field cron expression
    pub async fn schedule(&self, cron_expr: &str) -> Result<()> {
        self.cancel().await?;

        let recorder = self.recorder.clone();
        let retention_days = self.retention_days;

        let job = Job::new_async(cron_expr.to_string(), move |_uuid, _l| {
            let recorder = recorder.clone();
            Box::pin(async move {
                tracing::info!("Running scheduled activity purge");
                if let Err(e) = recorder.purge_expired(retention_days).await {
                    tracing::error!("Activity purge failed: {}", e);
                }
            })
        })
        .map_err(|e| AppError::Scheduler(format!("Invalid retention schedule '{}': {}", cron_expr, e)))?;

        let job_id = job.guid();

        let scheduler = self.scheduler.write().await;
        scheduler
            .add(job)
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to schedule purge: {}", e)))?;

        *self.current_job_id.write().await = Some(job_id);

        tracing::info!(
            "Activity purge scheduled ({}), keeping {} days",
            cron_expr,
            retention_days
        );
        Ok(())
    }

    pub async fn cancel(&self) -> Result<()> {
        let mut current_job = self.current_job_id.write().await;

        if let Some(job_id) = *current_job {
            let scheduler = self.scheduler.write().await;
            scheduler
                .remove(&job_id)
                .await
                .map_err(|e| AppError::Scheduler(format!("Failed to remove job: {}", e)))?;

            *current_job = None;
            tracing::info!("Activity purge schedule cancelled");
        }

        Ok(())
    }

    /// Purge immediately, outside the schedule
    pub async fn run_once(&self) -> Result<u64> {
        self.recorder.purge_expired(self.retention_days).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.write().await;
        scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::Scheduler(format!("Failed to shutdown scheduler: {}", e)))?;
        tracing::info!("Retention scheduler shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::ActivityKind;
    use crate::test_support::fixture;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_schedule_accepts_cron_and_rejects_garbage() {
        let fx = fixture().await;
        let service = RetentionService::new(ActivityRecorder::new(fx.repo.clone()), 90)
            .await
            .unwrap();

        service.schedule("0 30 3 * * *").await.unwrap();
        assert!(service.current_job_id.read().await.is_some());

        // Replacing keeps a single job
        service.schedule("0 0 4 * * *").await.unwrap();

        let result = service.schedule("every now and then").await;
        assert!(matches!(result, Err(AppError::Scheduler(_))));

        service.cancel().await.unwrap();
        assert!(service.current_job_id.read().await.is_none());
    }

    #[tokio::test]
    async fn test_run_once_purges_expired_records() {
        let fx = fixture().await;
        let recorder = ActivityRecorder::new(fx.repo.clone());

        sqlx::query(
            "INSERT INTO activity_records (id, account_id, kind, detail, created_at) VALUES ('stale', 'a', 'login', '{}', ?)",
        )
        .bind(Utc::now() - Duration::days(31))
        .execute(fx.repo.pool())
        .await
        .unwrap();
        recorder.record("a", ActivityKind::Login, json!({})).await;

        let service = RetentionService::new(recorder, 30).await.unwrap();
        assert_eq!(service.run_once().await.unwrap(), 1);
        assert_eq!(service.run_once().await.unwrap(), 0);
    }
}
