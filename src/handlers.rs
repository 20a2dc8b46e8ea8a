//! Placeholder handlers for the built-in AI job types.
//!
//! They log and succeed. Real analysis (fetching the entry, calling the
//! model, storing results) is plugged in by replacing these registrations.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::HandlerError;
use crate::queue::{HandlerRegistry, JobHandler, JobRecord, JobType};

/// Handler that records the job and reports success.
pub struct LoggingHandler {
    label: &'static str,
}

impl LoggingHandler {
    pub fn for_type(job_type: &JobType) -> Self {
        let label = match job_type {
            JobType::EntryAnalysis => "entry analysis",
            JobType::DailySummary => "daily summary",
            JobType::WeeklyAnalysis => "weekly analysis",
            JobType::MonthlyAnalysis => "monthly analysis",
            JobType::StreakUpdate => "streak update",
            JobType::GrowthCalculation => "growth calculation",
            JobType::Other(_) => "custom job",
        };
        Self { label }
    }
}

#[async_trait]
impl JobHandler for LoggingHandler {
    async fn handle(&self, job: &JobRecord) -> Result<(), HandlerError> {
        info!(
            job_id = %job.id,
            owner_id = %job.owner_id,
            subject = job.subject_ref.as_deref().unwrap_or("-"),
            "Processing {}",
            self.label
        );
        Ok(())
    }
}

/// Register a [`LoggingHandler`] for every built-in job type.
pub fn register_default_handlers(registry: &HandlerRegistry) {
    for job_type in JobType::KNOWN {
        let handler = Arc::new(LoggingHandler::for_type(&job_type));
        registry.register_sync(job_type, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NewJob;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn defaults_cover_every_known_type() {
        let registry = HandlerRegistry::new();
        register_default_handlers(&registry);
        assert_eq!(registry.count(), JobType::KNOWN.len());

        for job_type in JobType::KNOWN {
            let handler = registry.get(&job_type).await.unwrap();
            let job = JobRecord::from_new(Uuid::new_v4(), NewJob::new("u", job_type), Utc::now());
            assert!(handler.handle(&job).await.is_ok());
        }
        assert!(!registry.has(&JobType::Other("x".into())).await);
    }
}
