//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC strings so that SQL string comparison and
//! ordering agree with time order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::DatabaseError;
use crate::queue::model::{JobId, JobRecord, JobStatus, JobType, NewJob};
use crate::store::migrations;
use crate::store::traits::{JobFilter, JobOrder, JobStore, JobUpdate};

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db, Arc::new(SystemClock))?;
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Self::new_memory_with_clock(Arc::new(SystemClock)).await
    }

    /// In-memory database stamping bookkeeping times from `clock`.
    pub async fn new_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::from_database(db, clock)?;
        store.init_schema().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase, clock: Arc<dyn Clock>) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            clock,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: `2026-01-02T03:04:05.000000Z`.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string. `None` when unreadable.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ndt.and_utc());
    }
    None
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).and_then(|s| parse_datetime(&s))
}

/// Shape of every timestamp this backend writes. Anything else in
/// `scheduled_at` is treated as unreadable.
const CANONICAL_TIMESTAMP_GLOB: &str = "[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]T[0-9][0-9]:[0-9][0-9]:[0-9][0-9].[0-9][0-9][0-9][0-9][0-9][0-9]Z";

/// Column list for job SELECT queries (14 columns).
const JOB_COLUMNS: &str = "id, owner_id, job_type, subject_ref, status, priority, attempts, error_message, scheduled_at, started_at, completed_at, estimated_tokens, created_at, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<JobRecord, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("job.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job.id parse: {e}")))?;

    let owner_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("job.owner_id: {e}")))?;
    let job_type_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("job.job_type: {e}")))?;
    let subject_ref: Option<String> = row.get::<String>(3).ok().filter(|s| !s.is_empty());

    let status_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("job.status: {e}")))?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("job.status: {e}")))?;

    let priority: i64 = row.get(5).unwrap_or(0);
    let priority = i32::try_from(priority)
        .map_err(|_| DatabaseError::Serialization(format!("job.priority out of range: {priority}")))?;
    let attempts: i64 = row.get(6).unwrap_or(0);
    let attempts = u32::try_from(attempts)
        .map_err(|_| DatabaseError::Serialization(format!("job.attempts out of range: {attempts}")))?;
    let error_message: Option<String> = row.get::<String>(7).ok().filter(|s| !s.is_empty());

    let scheduled_at = parse_optional_datetime(row.get::<String>(8).ok());
    let started_at = parse_optional_datetime(row.get::<String>(9).ok());
    let completed_at = parse_optional_datetime(row.get::<String>(10).ok());
    let estimated_cost: Option<f64> = row.get::<f64>(11).ok();

    let created_str: String = row
        .get(12)
        .map_err(|e| DatabaseError::Query(format!("job.created_at: {e}")))?;
    let updated_str: String = row
        .get(13)
        .map_err(|e| DatabaseError::Query(format!("job.updated_at: {e}")))?;

    Ok(JobRecord {
        id,
        owner_id,
        job_type: JobType::from(job_type_str),
        subject_ref,
        status,
        priority,
        attempts,
        scheduled_at,
        started_at,
        completed_at,
        error_message,
        estimated_cost,
        created_at: parse_datetime(&created_str).unwrap_or(DateTime::<Utc>::MIN_UTC),
        updated_at: parse_datetime(&updated_str).unwrap_or(DateTime::<Utc>::MIN_UTC),
    })
}

/// Build the WHERE clause and its positional parameters.
fn filter_clause(filter: &JobFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(status) = filter.status {
        values.push(Value::Text(status.as_str().to_string()));
        clauses.push(format!("status = ?{}", values.len()));
    }
    if let Some(at) = filter.scheduled_before {
        // Unreadable values must still reach the dispatcher so it can fail
        // them; text comparison alone would hide any that sort after `at`.
        values.push(Value::Text(fmt_datetime(&at)));
        clauses.push(format!(
            "(scheduled_at <= ?{} OR scheduled_at IS NULL OR scheduled_at NOT GLOB '{CANONICAL_TIMESTAMP_GLOB}')",
            values.len()
        ));
    }
    if let Some(at) = filter.started_before {
        values.push(Value::Text(fmt_datetime(&at)));
        clauses.push(format!(
            "started_at IS NOT NULL AND started_at <= ?{}",
            values.len()
        ));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), values)
    }
}

fn order_clause(order: JobOrder) -> &'static str {
    match order {
        JobOrder::PriorityThenSchedule => {
            " ORDER BY priority DESC, scheduled_at ASC, created_at ASC"
        }
        JobOrder::Created => " ORDER BY created_at ASC",
    }
}

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_job(&self, job: NewJob) -> Result<JobId, DatabaseError> {
        let id = Uuid::new_v4();
        let record = JobRecord::from_new(id, job, self.clock.now());
        let now = fmt_datetime(&record.created_at);

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO ai_processing_queue ({JOB_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    record.id.to_string(),
                    record.owner_id.as_str(),
                    record.job_type.as_str(),
                    record.subject_ref.clone(),
                    record.status.as_str(),
                    record.priority as i64,
                    record.attempts as i64,
                    record.error_message.clone(),
                    record.scheduled_at.map(|d| fmt_datetime(&d)),
                    Option::<String>::None,
                    Option::<String>::None,
                    record.estimated_cost,
                    now.clone(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(id = %id, job_type = %record.job_type, "Job enqueued");
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM ai_processing_queue WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job row: {e}"))),
        }
    }

    async fn query_jobs(
        &self,
        filter: &JobFilter,
        order: JobOrder,
        limit: usize,
    ) -> Result<Vec<JobRecord>, DatabaseError> {
        let (where_sql, mut values) = filter_clause(filter);
        values.push(Value::Integer(limit as i64));
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM ai_processing_queue{where_sql}{} LIMIT ?{}",
            order_clause(order),
            values.len()
        );

        let mut rows = self
            .conn()
            .query(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("query_jobs: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => jobs.push(row_to_job(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("query_jobs row: {e}"))),
            }
        }
        Ok(jobs)
    }

    async fn update_job(&self, id: JobId, update: &JobUpdate) -> Result<(), DatabaseError> {
        let mut sets = Vec::new();
        let mut values = Vec::new();

        let mut set = |column: &str, value: Value| {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        };

        if let Some(status) = update.status {
            set("status", Value::Text(status.as_str().to_string()));
        }
        if let Some(attempts) = update.attempts {
            set("attempts", Value::Integer(attempts as i64));
        }
        if let Some(at) = update.scheduled_at {
            set("scheduled_at", Value::Text(fmt_datetime(&at)));
        }
        if let Some(at) = update.started_at {
            set("started_at", Value::Text(fmt_datetime(&at)));
        }
        if let Some(at) = update.completed_at {
            set("completed_at", Value::Text(fmt_datetime(&at)));
        }
        if let Some(ref msg) = update.error_message {
            set("error_message", Value::Text(msg.clone()));
        }
        set("updated_at", Value::Text(fmt_datetime(&self.clock.now())));

        values.push(Value::Text(id.to_string()));
        let mut sql = format!(
            "UPDATE ai_processing_queue SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len()
        );
        if let Some(expected) = update.expected_status {
            values.push(Value::Text(expected.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }

        let affected = self
            .conn()
            .execute(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job: {e}")))?;

        if affected == 0 {
            if let Some(expected) = update.expected_status
                && let Some(current) = self.get_job(id).await?
            {
                return Err(DatabaseError::Conflict {
                    entity: "job".to_string(),
                    id: id.to_string(),
                    expected: expected.to_string(),
                    actual: current.status.to_string(),
                });
            }
            return Err(DatabaseError::NotFound {
                entity: "job".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
