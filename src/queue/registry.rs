//! Handler registry: maps a job type to the code that processes it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::HandlerError;
use crate::queue::model::{JobRecord, JobType};

/// Processes jobs of one type.
///
/// The dispatcher may invoke a handler once per allowed attempt, so bodies
/// must tolerate re-execution. No deadline is enforced by the caller; a
/// handler that can hang must time itself out.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, job: &JobRecord) -> Result<(), HandlerError> {
        (self.0)(job.clone()).await
    }
}

/// Registry of job handlers.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler, replacing any previous one for the same type.
    pub async fn register(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        if self
            .handlers
            .write()
            .await
            .insert(job_type.clone(), handler)
            .is_some()
        {
            tracing::warn!(job_type = %job_type, "Replaced existing job handler");
        } else {
            tracing::debug!(job_type = %job_type, "Registered job handler");
        }
    }

    /// Register a handler (sync version for startup).
    pub fn register_sync(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        if let Ok(mut handlers) = self.handlers.try_write() {
            tracing::debug!(job_type = %job_type, "Registered job handler");
            handlers.insert(job_type, handler);
        }
    }

    /// Register an async closure as the handler for `job_type`.
    pub async fn register_fn<F, Fut>(&self, job_type: JobType, f: F)
    where
        F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler::new(f))).await;
    }

    /// Unregister a handler.
    pub async fn unregister(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.write().await.remove(job_type)
    }

    /// Get the handler for a job type.
    pub async fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(job_type).cloned()
    }

    pub async fn has(&self, job_type: &JobType) -> bool {
        self.handlers.read().await.contains_key(job_type)
    }

    /// List registered job types.
    pub async fn job_types(&self) -> Vec<JobType> {
        self.handlers.read().await.keys().cloned().collect()
    }

    /// Get the number of registered handlers.
    pub fn count(&self) -> usize {
        self.handlers.try_read().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::NewJob;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn job(job_type: JobType) -> JobRecord {
        JobRecord::from_new(Uuid::new_v4(), NewJob::new("u", job_type), Utc::now())
    }

    #[tokio::test]
    async fn registered_closure_is_invoked() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry
            .register_fn(JobType::DailySummary, move |_job| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        let handler = registry.get(&JobType::DailySummary).await.unwrap();
        handler.handle(&job(JobType::DailySummary)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn lookup_misses_unknown_types() {
        let registry = HandlerRegistry::new();
        registry
            .register_fn(JobType::EntryAnalysis, |_job| async { Ok(()) })
            .await;
        assert!(registry.has(&JobType::EntryAnalysis).await);
        assert!(registry.get(&JobType::Other("nope".into())).await.is_none());
        assert!(registry.get(&JobType::WeeklyAnalysis).await.is_none());
    }

    #[tokio::test]
    async fn register_replaces_and_unregister_removes() {
        let registry = HandlerRegistry::new();
        registry
            .register_fn(JobType::StreakUpdate, |_job| async { Ok(()) })
            .await;
        registry
            .register_fn(JobType::StreakUpdate, |_job| async {
                Err(HandlerError::permanent("replaced"))
            })
            .await;
        assert_eq!(registry.count(), 1);

        let handler = registry.get(&JobType::StreakUpdate).await.unwrap();
        let err = handler.handle(&job(JobType::StreakUpdate)).await.unwrap_err();
        assert_eq!(err, HandlerError::permanent("replaced"));

        assert!(registry.unregister(&JobType::StreakUpdate).await.is_some());
        assert!(registry.job_types().await.is_empty());
    }
}
