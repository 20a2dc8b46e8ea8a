//! `JobStore` trait: the persistence contract the dispatcher depends on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::queue::model::{JobId, JobRecord, JobStatus, NewJob};

/// Field set applied by [`JobStore::update_job`].
///
/// `None` leaves a field untouched. The whole set is applied or none of it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    /// Only apply while the stored status still equals this.
    pub expected_status: Option<JobStatus>,
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl JobUpdate {
    /// Claim: `pending -> processing`.
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            started_at: Some(now),
            ..Default::default()
        }
    }

    pub fn complete(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            completed_at: Some(now),
            ..Default::default()
        }
    }

    /// Re-arm a failed attempt for a later cycle.
    pub fn retry(attempts: u32, next_run: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            attempts: Some(attempts),
            scheduled_at: Some(next_run),
            ..Default::default()
        }
    }

    /// Terminal failure. `attempts` is `None` when the failure did not
    /// consume an attempt (unknown type, malformed data).
    pub fn fail(attempts: Option<u32>, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            attempts,
            completed_at: Some(now),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Builder: guard the write on the current stored status.
    pub fn expecting(mut self, status: JobStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    /// Apply the set fields to an in-memory record.
    pub fn apply_to(&self, job: &mut JobRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(at) = self.scheduled_at {
            job.scheduled_at = Some(at);
        }
        if let Some(at) = self.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(ref msg) = self.error_message {
            job.error_message = Some(msg.clone());
        }
        job.updated_at = now;
    }
}

/// Selection criteria for [`JobStore::query_jobs`]. All set criteria must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// `scheduled_at <= t`, or a `scheduled_at` that cannot be read.
    pub scheduled_before: Option<DateTime<Utc>>,
    /// `started_at <= t`
    pub started_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    /// Pending jobs whose due time has arrived.
    ///
    /// Jobs with an unreadable due time are included so the dispatcher can
    /// fail them instead of leaving them pending forever.
    pub fn due(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            scheduled_before: Some(now),
            ..Default::default()
        }
    }

    /// Jobs claimed at or before `cutoff` and never finalized.
    pub fn stale_processing(cutoff: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            started_before: Some(cutoff),
            ..Default::default()
        }
    }

    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Evaluate the filter against a record.
    pub fn matches(&self, job: &JobRecord) -> bool {
        if let Some(status) = self.status
            && job.status != status
        {
            return false;
        }
        if let Some(cutoff) = self.scheduled_before
            && job.scheduled_at.is_some_and(|at| at > cutoff)
        {
            return false;
        }
        if let Some(cutoff) = self.started_before
            && !job.started_at.is_some_and(|at| at <= cutoff)
        {
            return false;
        }
        true
    }
}

/// Result ordering for [`JobStore::query_jobs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    /// Dispatch order: `priority desc, scheduled_at asc`.
    #[default]
    PriorityThenSchedule,
    /// `created_at asc`.
    Created,
}

/// Backend-agnostic job persistence.
///
/// Implementations must give read-your-writes on the next query and must not
/// lose updates to the same record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create tables/indexes if needed.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Insert a new pending job. Returns the assigned id.
    async fn insert_job(&self, job: NewJob) -> Result<JobId, DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, DatabaseError>;

    /// Select up to `limit` jobs matching `filter`, in `order`.
    async fn query_jobs(
        &self,
        filter: &JobFilter,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError>;

    /// Apply `update` to one job. Unknown ids are an error.
    ///
    /// With `expected_status` set the check and the write are one atomic
    /// step; a mismatch returns [`DatabaseError::Conflict`] and changes
    /// nothing. This is what keeps two dispatchers sharing a store from
    /// claiming the same job.
    async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::model::JobType;
    use chrono::Duration;
    use uuid::Uuid;

    fn record(now: DateTime<Utc>) -> JobRecord {
        JobRecord::from_new(Uuid::new_v4(), NewJob::new("u", JobType::EntryAnalysis), now)
    }

    #[test]
    fn due_filter_excludes_future_and_non_pending() {
        let now = Utc::now();
        let filter = JobFilter::due(now);

        let mut job = record(now);
        assert!(filter.matches(&job));

        job.scheduled_at = Some(now + Duration::seconds(1));
        assert!(!filter.matches(&job));

        // Unreadable schedules are surfaced rather than hidden.
        job.scheduled_at = None;
        assert!(filter.matches(&job));

        let mut job = record(now);
        job.status = JobStatus::Processing;
        assert!(!filter.matches(&job));
    }

    #[test]
    fn stale_filter_uses_started_at() {
        let now = Utc::now();
        let filter = JobFilter::stale_processing(now - Duration::minutes(10));

        let mut job = record(now);
        job.status = JobStatus::Processing;
        job.started_at = Some(now - Duration::minutes(11));
        assert!(filter.matches(&job));

        job.started_at = Some(now - Duration::minutes(1));
        assert!(!filter.matches(&job));
    }

    #[test]
    fn update_applies_only_set_fields() {
        let now = Utc::now();
        let mut job = record(now);
        let later = now + Duration::minutes(5);

        JobUpdate::retry(2, later).apply_to(&mut job, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.scheduled_at, Some(later));
        assert!(job.error_message.is_none());

        JobUpdate::fail(None, "boom", later).apply_to(&mut job, later);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.completed_at, Some(later));
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert_eq!(job.updated_at, later);
    }
}
