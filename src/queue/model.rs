//! Job data model: records, status lifecycle and producer requests.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Store-assigned job identifier.
pub type JobId = Uuid;

/// Priority given to jobs that do not ask for one (1–10 scale, medium).
pub const DEFAULT_PRIORITY: i32 = 5;

/// Lifecycle status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its due time and rate-limit capacity.
    Pending,
    /// Claimed by the dispatcher; the handler is running.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Attempts exhausted or the job cannot run at all.
    Failed,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    ///
    /// `Processing -> Pending` is the retry re-arm. Any non-terminal state
    /// may jump straight to `Failed`.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Tag selecting the handler for a job.
///
/// Tags outside the known set are kept verbatim in `Other` so a record with
/// an unrecognized type can still be loaded and failed by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    EntryAnalysis,
    DailySummary,
    WeeklyAnalysis,
    MonthlyAnalysis,
    StreakUpdate,
    GrowthCalculation,
    Other(String),
}

impl JobType {
    /// All built-in job types.
    pub const KNOWN: [JobType; 6] = [
        JobType::EntryAnalysis,
        JobType::DailySummary,
        JobType::WeeklyAnalysis,
        JobType::MonthlyAnalysis,
        JobType::StreakUpdate,
        JobType::GrowthCalculation,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::EntryAnalysis => "entry_analysis",
            Self::DailySummary => "daily_summary",
            Self::WeeklyAnalysis => "weekly_analysis",
            Self::MonthlyAnalysis => "monthly_analysis",
            Self::StreakUpdate => "streak_update",
            Self::GrowthCalculation => "growth_calculation",
            Self::Other(tag) => tag,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for JobType {
    fn from(s: &str) -> Self {
        match s {
            "entry_analysis" => Self::EntryAnalysis,
            "daily_summary" => Self::DailySummary,
            "weekly_analysis" => Self::WeeklyAnalysis,
            "monthly_analysis" => Self::MonthlyAnalysis,
            "streak_update" => Self::StreakUpdate,
            "growth_calculation" => Self::GrowthCalculation,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for JobType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<JobType> for String {
    fn from(t: JobType) -> Self {
        t.as_str().to_string()
    }
}

/// One persisted unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Who triggered the job.
    pub owner_id: String,
    pub job_type: JobType,
    /// Domain object the job concerns (e.g. a journal entry id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_ref: Option<String>,
    pub status: JobStatus,
    /// Higher runs first among due jobs.
    pub priority: i32,
    pub attempts: u32,
    /// Earliest run time. `None` means the stored value could not be read.
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Units charged against the rate limiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Materialize a record from a producer request.
    pub fn from_new(id: JobId, job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id: job.owner_id,
            job_type: job.job_type,
            subject_ref: job.subject_ref,
            status: JobStatus::Pending,
            priority: job.priority,
            attempts: 0,
            scheduled_at: Some(job.scheduled_at.unwrap_or(now)),
            started_at: None,
            completed_at: None,
            error_message: None,
            estimated_cost: job.estimated_cost,
            created_at: now,
            updated_at: now,
        }
    }

    /// Units to reserve; zero or missing estimates use `default`.
    pub fn cost(&self, default: f64) -> f64 {
        match self.estimated_cost {
            Some(cost) if cost != 0.0 => cost,
            _ => default,
        }
    }

    /// Whether the job is visible to the scheduler at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at.is_some_and(|at| at <= now)
    }
}

/// Producer-side job request, passed to `JobStore::insert_job`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub job_type: JobType,
    pub subject_ref: Option<String>,
    pub priority: i32,
    pub estimated_cost: Option<f64>,
    /// Defaults to the insert time.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(owner_id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            owner_id: owner_id.into(),
            job_type,
            subject_ref: None,
            priority: DEFAULT_PRIORITY,
            estimated_cost: None,
            scheduled_at: None,
        }
    }

    /// Analysis of a single journal entry: medium priority, ~1000 tokens.
    pub fn entry_analysis(owner_id: impl Into<String>, entry_id: impl Into<String>) -> Self {
        Self::new(owner_id, JobType::EntryAnalysis)
            .with_subject(entry_id)
            .with_estimated_cost(1000.0)
    }

    /// Builder: set the subject reference.
    pub fn with_subject(mut self, subject_ref: impl Into<String>) -> Self {
        self.subject_ref = Some(subject_ref.into());
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder: set the rate-limit cost estimate.
    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    /// Builder: do not run before `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}
