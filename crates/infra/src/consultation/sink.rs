use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, instrument};

use fiscalq_core::{CompanyId, JobId};
use fiscalq_queue::{Job, Message};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("consultation sink error: {0}")]
    Storage(String),
}

/// Destination for messages retrieved by a successful consultation.
///
/// Kept apart from the job table: a job records *that* a consultation ran,
/// the sink keeps *what* it found.
///
/// Storing is keyed by job: a later batch for the same job replaces the earlier
/// one, so a consultation that re-runs after its outcome was lost leaves no
/// duplicates behind.
#[async_trait]
pub trait ConsultationSink: Send + Sync + 'static {
    async fn store(
        &self,
        job: &Job,
        messages: &[Message],
        retrieved_at: DateTime<Utc>,
    ) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: ConsultationSink + ?Sized> ConsultationSink for std::sync::Arc<T> {
    async fn store(
        &self,
        job: &Job,
        messages: &[Message],
        retrieved_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        (**self).store(job, messages, retrieved_at).await
    }
}

/// One stored batch, as kept by [`InMemoryConsultationSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredConsultation {
    pub job_id: JobId,
    pub company_id: CompanyId,
    pub retrieved_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryConsultationSink {
    inner: Mutex<Vec<StoredConsultation>>,
}

impl InMemoryConsultationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<StoredConsultation> {
        self.inner.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsultationSink for InMemoryConsultationSink {
    async fn store(
        &self,
        job: &Job,
        messages: &[Message],
        retrieved_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|stored| stored.job_id != job.id);
        inner.push(StoredConsultation {
            job_id: job.id,
            company_id: job.company_id,
            retrieved_at,
            messages: messages.to_vec(),
        });
        Ok(())
    }
}

/// Sink persisting messages to the `consultation_messages` table.
#[derive(Debug, Clone)]
pub struct SqliteConsultationSink {
    pool: SqlitePool,
}

impl SqliteConsultationSink {
    /// Use `pool` (normally the job store's) and create the table if missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, SinkError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consultation_messages (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id       INTEGER NOT NULL,
                company_id   INTEGER NOT NULL,
                subject      TEXT    NOT NULL,
                sender       TEXT    NULL,
                sent_at      INTEGER NULL,
                body         TEXT    NULL,
                retrieved_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| SinkError::Storage(e.to_string()))?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS consultation_messages_company_idx \
             ON consultation_messages (company_id, retrieved_at)",
            "CREATE INDEX IF NOT EXISTS consultation_messages_job_idx \
             ON consultation_messages (job_id)",
        ] {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| SinkError::Storage(e.to_string()))?;
        }

        Ok(Self { pool })
    }

    /// Messages stored for a company, oldest first.
    pub async fn messages_for(&self, company_id: CompanyId) -> Result<Vec<Message>, SinkError> {
        let rows = sqlx::query(
            r#"
            SELECT subject, sender, sent_at, body
            FROM consultation_messages
            WHERE company_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(company_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SinkError::Storage(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let sent_at: Option<i64> = row.try_get("sent_at").map_err(decode_err)?;
                Ok(Message {
                    subject: row.try_get("subject").map_err(decode_err)?,
                    sender: row.try_get("sender").map_err(decode_err)?,
                    sent_at: sent_at.and_then(DateTime::<Utc>::from_timestamp_millis),
                    body: row.try_get("body").map_err(decode_err)?,
                })
            })
            .collect()
    }
}

fn decode_err(e: sqlx::Error) -> SinkError {
    SinkError::Storage(format!("decode: {e}"))
}

#[async_trait]
impl ConsultationSink for SqliteConsultationSink {
    #[instrument(skip(self, job, messages), fields(job_id = %job.id, count = messages.len()), err)]
    async fn store(
        &self,
        job: &Job,
        messages: &[Message],
        retrieved_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SinkError::Storage(e.to_string()))?;

        let replaced = sqlx::query("DELETE FROM consultation_messages WHERE job_id = $1")
            .bind(job.id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| SinkError::Storage(e.to_string()))?
            .rows_affected();
        if replaced > 0 {
            debug!(job_id = %job.id, replaced, "replacing messages from an earlier run");
        }

        for message in messages {
            sqlx::query(
                r#"
                INSERT INTO consultation_messages
                    (job_id, company_id, subject, sender, sent_at, body, retrieved_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(job.id.get())
            .bind(job.company_id.get())
            .bind(&message.subject)
            .bind(message.sender.as_deref())
            .bind(message.sent_at.map(|at| at.timestamp_millis()))
            .bind(message.body.as_deref())
            .bind(retrieved_at.timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(|e| SinkError::Storage(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| SinkError::Storage(e.to_string()))
    }
}
