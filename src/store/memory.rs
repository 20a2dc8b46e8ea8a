//! In-memory `JobStore`: no persistence across restarts.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::DatabaseError;
use crate::queue::model::{JobId, JobRecord, NewJob};
use crate::store::traits::{JobFilter, JobOrder, JobStore, JobUpdate};

/// Job store backed by a `HashMap`.
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Stamp `created_at`/`updated_at` and default due times from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Replace a record wholesale. Lets tests plant states producers can't.
    pub async fn put(&self, job: JobRecord) {
        self.jobs.write().await.insert(job.id, job);
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch_order(a: &JobRecord, b: &JobRecord) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| match (a.scheduled_at, b.scheduled_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.created_at.cmp(&b.created_at))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobId, DatabaseError> {
        let id = Uuid::new_v4();
        let record = JobRecord::from_new(id, job, self.clock.now());
        self.jobs.write().await.insert(id, record);
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, DatabaseError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn query_jobs(
        &self,
        filter: &JobFilter,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<JobRecord> = jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();

        match order {
            JobOrder::PriorityThenSchedule => matched.sort_by(dispatch_order),
            JobOrder::Created => matched.sort_by_key(|job| job.created_at),
        }
        matched.truncate(limit);
        Ok(matched)
    }

    async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<(), DatabaseError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| DatabaseError::NotFound {
            entity: "job".to_string(),
            id: id.to_string(),
        })?;
        if let Some(expected) = update.expected_status
            && job.status != expected
        {
            return Err(DatabaseError::Conflict {
                entity: "job".to_string(),
                id: id.to_string(),
                expected: expected.to_string(),
                actual: job.status.to_string(),
            });
        }
        update.apply_to(job, now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::model::{JobStatus, JobType};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn insert_and_get() {
        let store = MemoryJobStore::new();
        let id = store
            .insert_job(NewJob::entry_analysis("user_1", "entry_1"))
            .await
            .unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.owner_id, "user_1");
        assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_orders_by_priority_then_age() {
        let t = Utc::now();
        let clock = Arc::new(ManualClock::new(t));
        let store = MemoryJobStore::with_clock(clock);

        let a = store
            .insert_job(NewJob::new("u", JobType::DailySummary).with_priority(8).scheduled_at(t))
            .await
            .unwrap();
        let b = store
            .insert_job(
                NewJob::new("u", JobType::DailySummary)
                    .with_priority(8)
                    .scheduled_at(t - Duration::seconds(10)),
            )
            .await
            .unwrap();
        let c = store
            .insert_job(
                NewJob::new("u", JobType::DailySummary)
                    .with_priority(5)
                    .scheduled_at(t - Duration::seconds(100)),
            )
            .await
            .unwrap();

        let jobs = store
            .query_jobs(&JobFilter::due(t), JobOrder::PriorityThenSchedule, 10)
            .await
            .unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![b, a, c]);

        let limited = store
            .query_jobs(&JobFilter::due(t), JobOrder::PriorityThenSchedule, 2)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn update_unknown_job_is_an_error() {
        let store = MemoryJobStore::new();
        let err = store
            .update_job(Uuid::new_v4(), &JobUpdate::complete(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn guarded_update_rejects_stale_status() {
        let store = MemoryJobStore::new();
        let id = store
            .insert_job(NewJob::new("u", JobType::StreakUpdate))
            .await
            .unwrap();
        let now = Utc::now();

        store
            .update_job(id, &JobUpdate::start(now).expecting(JobStatus::Pending))
            .await
            .unwrap();

        // A second claim sees the job already taken.
        let err = store
            .update_job(id, &JobUpdate::start(now).expecting(JobStatus::Pending))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Conflict { ref actual, .. } if actual == "processing"
        ));
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }
}
