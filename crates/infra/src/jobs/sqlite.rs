//! SQLite-backed job store.
//!
//! ## Atomicity
//!
//! The pool is limited to a single connection, so every operation runs under
//! single-writer discipline. Multi-statement operations (`claim_next`,
//! `update_status`, `spawn_occurrence`) additionally run inside a transaction.
//! A partial unique index on `company_id WHERE status = 'processing'` backs the
//! per-company exclusion at the schema level.
//!
//! ## Timestamps
//!
//! All instants are stored as UTC epoch milliseconds (`INTEGER`), so ordering and
//! due-time comparisons in SQL are exact.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database | `Storage` |
//! | PoolClosed / PoolTimedOut / Io / Tls | `Unavailable` |
//! | ColumnDecode / Decode | `Decode` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use fiscalq_core::{CompanyId, JobId};
use fiscalq_queue::{FailureKind, Job, JobStatus, NewJob};

use super::store::{JobStore, JobStoreError};
use super::types::{JobFilter, JobStats, Transition};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        company_id      INTEGER NOT NULL,
        status          TEXT    NOT NULL,
        priority        INTEGER NOT NULL DEFAULT 0,
        created_at      INTEGER NOT NULL,
        processed_at    INTEGER NULL,
        scheduled_at    INTEGER NULL,
        claimed_at      INTEGER NULL,
        attempts        INTEGER NOT NULL DEFAULT 0,
        max_attempts    INTEGER NOT NULL,
        error_detail    TEXT    NULL,
        failure_kind    TEXT    NULL,
        execution_type  TEXT    NOT NULL DEFAULT 'immediate',
        recurrence      TEXT    NOT NULL DEFAULT 'none',
        schedule_active INTEGER NOT NULL DEFAULT 1,
        created_by      TEXT    NOT NULL DEFAULT 'manual',
        expanded        INTEGER NOT NULL DEFAULT 0,
        CHECK (attempts <= max_attempts)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_ready_idx
        ON jobs (status, priority DESC, created_at ASC)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS jobs_one_processing_per_company
        ON jobs (company_id) WHERE status = 'processing'
    "#,
];

const JOB_COLUMNS: &str = "id, company_id, status, priority, created_at, processed_at, \
    scheduled_at, claimed_at, attempts, max_attempts, error_detail, failure_kind, \
    execution_type, recurrence, schedule_active, created_by, expanded";

/// SQLite-backed job store.
///
/// Cheap to clone; clones share the same single-connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Connect to `database_url` (e.g. `sqlite://fiscalq.db` or `sqlite::memory:`)
    /// and create the schema if missing.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let options: SqliteConnectOptions = database_url
            .parse::<SqliteConnectOptions>()
            .map_err(|e| JobStoreError::Unavailable(format!("invalid database url: {e}")))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The caller is responsible for single-writer pooling.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, JobStoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn fetch_jobs(&self, operation: &str, sql: &str, now: Option<i64>) -> Result<Vec<Job>, JobStoreError> {
        let mut query = sqlx::query(sql);
        if let Some(now) = now {
            query = query.bind(now);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_job).collect()
    }
}

async fn fetch_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: JobId,
) -> Result<Job, JobStoreError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(id.get())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("fetch_job", e))?;

    match row {
        Some(row) => decode_job(&row),
        None => Err(JobStoreError::NotFound(id)),
    }
}

async fn insert_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job: NewJob,
) -> Result<Job, JobStoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO jobs (
            company_id, status, priority, created_at, scheduled_at, attempts,
            max_attempts, execution_type, recurrence, schedule_active, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(job.company_id.get())
    .bind(job.status.as_str())
    .bind(job.priority)
    .bind(to_millis(job.created_at))
    .bind(job.scheduled_at.map(to_millis))
    .bind(i64::from(job.attempts))
    .bind(i64::from(job.max_attempts))
    .bind(job.execution_type.as_str())
    .bind(job.recurrence.as_str())
    .bind(job.schedule_active)
    .bind(job.created_by.as_str())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;

    Ok(job.with_id(JobId::new(result.last_insert_rowid())))
}

/// Write back every mutable column of `job`.
async fn write_in_tx(tx: &mut Transaction<'_, Sqlite>, job: &Job) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE jobs SET
            status = $2,
            processed_at = $3,
            scheduled_at = $4,
            claimed_at = $5,
            attempts = $6,
            error_detail = $7,
            failure_kind = $8,
            schedule_active = $9,
            expanded = $10
        WHERE id = $1
        "#,
    )
    .bind(job.id.get())
    .bind(job.status.as_str())
    .bind(job.processed_at.map(to_millis))
    .bind(job.scheduled_at.map(to_millis))
    .bind(job.claimed_at.map(to_millis))
    .bind(i64::from(job.attempts))
    .bind(job.error_detail.as_deref())
    .bind(job.failure_kind.map(|k| k.as_str()))
    .bind(job.schedule_active)
    .bind(job.expanded)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

async fn commit(tx: Transaction<'_, Sqlite>) -> Result<(), JobStoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(company_id = %job.company_id), err)]
    async fn insert(&self, job: NewJob) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let job = insert_in_tx(&mut tx, job).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self, transition), fields(expected = %transition.required_status()), err)]
    async fn update_status(&self, id: JobId, transition: Transition) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = fetch_in_tx(&mut tx, id).await?;

        let expected = transition.required_status();
        if job.status != expected {
            return Err(JobStoreError::Conflict {
                id,
                expected,
                actual: job.status,
            });
        }

        transition.apply(&mut job);
        write_in_tx(&mut tx, &job).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs AS j
            WHERE j.status = 'pending'
              AND (j.scheduled_at IS NULL OR j.scheduled_at <= $1)
              AND NOT EXISTS (
                  SELECT 1 FROM jobs AS p
                  WHERE p.company_id = j.company_id AND p.status = 'processing'
              )
            ORDER BY j.priority DESC, j.created_at ASC, j.id ASC
            LIMIT 1
            "#
        ))
        .bind(to_millis(now))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_select", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = decode_job(&row)?;

        let updated = sqlx::query(
            "UPDATE jobs SET status = 'processing', claimed_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(job.id.get())
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_update", e))?;

        if updated.rows_affected() != 1 {
            return Ok(None);
        }
        commit(tx).await?;

        job.status = JobStatus::Processing;
        job.claimed_at = Some(now);
        debug!(job_id = %job.id, company_id = %job.company_id, "claimed job row");
        Ok(Some(job))
    }

    #[instrument(skip(self), err)]
    async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_jobs(
            "list_ready",
            &format!(
                r#"
                SELECT {JOB_COLUMNS} FROM jobs
                WHERE status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= $1)
                ORDER BY priority DESC, created_at ASC, id ASC
                "#
            ),
            Some(to_millis(now)),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_jobs(
            "list_due_schedules",
            &format!(
                r#"
                SELECT {JOB_COLUMNS} FROM jobs
                WHERE execution_type = 'scheduled'
                  AND recurrence <> 'none'
                  AND schedule_active = 1
                  AND status IN ('completed', 'failed')
                  AND expanded = 0
                  AND (processed_at IS NULL OR processed_at <= $1)
                ORDER BY id ASC
                "#
            ),
            Some(to_millis(now)),
        )
        .await
    }

    #[instrument(skip(self, successor), err)]
    async fn spawn_occurrence(
        &self,
        parent: JobId,
        successor: NewJob,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self.begin().await?;

        let marked = sqlx::query("UPDATE jobs SET expanded = 1 WHERE id = $1 AND expanded = 0")
            .bind(parent.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_expanded", e))?;

        if marked.rows_affected() == 0 {
            // distinguish "already expanded" from "unknown id"
            fetch_in_tx(&mut tx, parent).await?;
            return Ok(None);
        }

        let job = insert_in_tx(&mut tx, successor).await?;
        commit(tx).await?;
        Ok(Some(job))
    }

    #[instrument(skip(self), err)]
    async fn set_schedule_active(&self, id: JobId, active: bool) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = fetch_in_tx(&mut tx, id).await?;
        job.schedule_active = active;
        write_in_tx(&mut tx, &job).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn has_active_job(&self, company_id: CompanyId) -> Result<bool, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE company_id = $1 AND status IN ('pending', 'processing')
            ) AS active
            "#,
        )
        .bind(company_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("has_active_job", e))?;

        let active: i64 = row
            .try_get("active")
            .map_err(|e| JobStoreError::Decode(format!("active: {e}")))?;
        Ok(active != 0)
    }

    #[instrument(skip(self), err)]
    async fn list_stalled(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        self.fetch_jobs(
            "list_stalled",
            &format!(
                r#"
                SELECT {JOB_COLUMNS} FROM jobs
                WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < $1)
                ORDER BY id ASC
                "#
            ),
            Some(to_millis(claimed_before)),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE ($1 IS NULL OR status = $1)
              AND ($2 IS NULL OR company_id = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.company_id.map(|c| c.get()))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Decode(format!("status: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| JobStoreError::Decode(format!("n: {e}")))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Decode(e.to_string()))?;
            stats.record(status, usize::try_from(n).unwrap_or_default());
        }
        Ok(stats)
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(column: &str, ms: i64) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| JobStoreError::Decode(format!("{column}: timestamp out of range: {ms}")))
}

fn opt_millis(column: &str, ms: Option<i64>) -> Result<Option<DateTime<Utc>>, JobStoreError> {
    ms.map(|ms| from_millis(column, ms)).transpose()
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, JobStoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| JobStoreError::Decode(format!("{name}: {e}")))
}

fn parsed<T>(row: &SqliteRow, name: &str) -> Result<T, JobStoreError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    let raw: String = column(row, name)?;
    raw.parse::<T>()
        .map_err(|e| JobStoreError::Decode(format!("{name}: {e}")))
}

fn count(row: &SqliteRow, name: &str) -> Result<u32, JobStoreError> {
    let raw: i64 = column(row, name)?;
    u32::try_from(raw).map_err(|_| JobStoreError::Decode(format!("{name}: out of range: {raw}")))
}

fn decode_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let failure_kind: Option<String> = column(row, "failure_kind")?;
    let failure_kind = failure_kind
        .map(|k| k.parse::<FailureKind>())
        .transpose()
        .map_err(|e: fiscalq_core::DomainError| JobStoreError::Decode(format!("failure_kind: {e}")))?;

    Ok(Job {
        id: JobId::new(column(row, "id")?),
        company_id: CompanyId::new(column(row, "company_id")?),
        status: parsed(row, "status")?,
        priority: column(row, "priority")?,
        created_at: from_millis("created_at", column(row, "created_at")?)?,
        processed_at: opt_millis("processed_at", column(row, "processed_at")?)?,
        scheduled_at: opt_millis("scheduled_at", column(row, "scheduled_at")?)?,
        claimed_at: opt_millis("claimed_at", column(row, "claimed_at")?)?,
        attempts: count(row, "attempts")?,
        max_attempts: count(row, "max_attempts")?,
        error_detail: column(row, "error_detail")?,
        failure_kind,
        execution_type: parsed(row, "execution_type")?,
        recurrence: parsed(row, "recurrence")?,
        schedule_active: column(row, "schedule_active")?,
        created_by: parsed(row, "created_by")?,
        expanded: column(row, "expanded")?,
    })
}

/// Map SQLx errors to JobStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => JobStoreError::Unavailable(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Decode(format!("decode error in {}: {}", operation, err))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
