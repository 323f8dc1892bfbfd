//! Job store adapter.
//!
//! All status transitions the core performs go through this adapter:
//! the QUEUED→PROCESSING claim runs count + select + update in a single
//! transaction, and every PROCESSING→terminal transition is a guarded
//! `UPDATE … WHERE status = 'PROCESSING'` whose affected-row count reports
//! whether the transition applied. Timestamps are assigned by SQLite's own
//! clock so the store, not the caller, owns them.

use async_trait::async_trait;
use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::database::DbPool;
use crate::database::models::{JobRecord, JobStatus, NewJob};
use crate::{Error, Result};

const SQLITE_BUSY_MAX_RETRIES: usize = 8;
const SQLITE_BUSY_BASE_DELAY_MS: u64 = 10;
const SQLITE_BUSY_MAX_DELAY_MS: u64 = 250;

/// Store-clock timestamp expression (RFC 3339, millisecond precision, UTC).
const SERVER_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ','now')";

/// Column list shared by every SELECT that materializes a [`JobRecord`].
const JOB_COLUMNS: &str = "job_id, user_id, user_email, filename, file_hash, description, \
     recording_date, audio_path, transcription_path, audio_size, audio_duration_ms, \
     language, initial_prompt, num_speakers, min_speakers, max_speakers, status, \
     created_at, updated_at, process_started_at, process_ended_at, error_message, \
     batch_handle";

fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6") | Some("517")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_sqlite_busy_error(&err) || attempt >= SQLITE_BUSY_MAX_RETRIES {
                    return Err(err);
                }

                let exp_backoff_ms = SQLITE_BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt);
                let capped_ms = exp_backoff_ms.min(SQLITE_BUSY_MAX_DELAY_MS);
                let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
                let delay =
                    Duration::from_millis((capped_ms + jitter_ms).min(SQLITE_BUSY_MAX_DELAY_MS));

                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    SQLITE_BUSY_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Collection names come from configuration; only plain identifiers may be
/// interpolated into SQL.
fn validate_collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_first && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::config(format!(
            "Invalid jobs collection name: {:?}",
            name
        )))
    }
}

/// Job store trait.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job with status QUEUED and store-assigned timestamps.
    async fn create_job(&self, job: &NewJob) -> Result<()>;
    /// Fetch a job, failing with `NotFound` when it does not exist.
    async fn get_job(&self, job_id: &str) -> Result<JobRecord>;
    /// Fetch a job, returning `None` when it does not exist.
    async fn find_job(&self, job_id: &str) -> Result<Option<JobRecord>>;
    /// Count jobs currently in the given status.
    async fn count_by_status(&self, status: JobStatus) -> Result<u64>;
    /// List jobs in the given status, oldest first.
    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>>;
    /// Atomically claim up to `max_processing - |PROCESSING|` queued jobs,
    /// oldest first, flipping each to PROCESSING with a store-clock
    /// `process_started_at`. Returns the claimed records.
    async fn claim_queued_jobs(&self, max_processing: u32) -> Result<Vec<JobRecord>>;
    /// Record the executor handle on a claimed job. Best-effort bookkeeping;
    /// does not touch status.
    async fn set_batch_handle(&self, job_id: &str, handle: &str) -> Result<()>;
    /// PROCESSING→COMPLETED. Returns whether the transition applied (false
    /// when the job was not in PROCESSING).
    async fn complete_processing(&self, job_id: &str) -> Result<bool>;
    /// PROCESSING→FAILED with the given error message. Returns whether the
    /// transition applied.
    async fn fail_processing(&self, job_id: &str, error_message: Option<&str>) -> Result<bool>;
    /// PROCESSING→FAILED for every listed job still in PROCESSING, in one
    /// commit. Returns how many rows transitioned.
    async fn fail_timed_out(&self, job_ids: &[String], error_message: &str) -> Result<u64>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    pool: DbPool,
    collection: String,
}

impl SqliteJobStore {
    /// Create a store over the given pool and jobs collection (table) name.
    pub fn new(pool: DbPool, collection: impl Into<String>) -> Result<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        Ok(Self { pool, collection })
    }

    /// Create the jobs table and its indexes if they do not exist yet.
    pub async fn ensure_collection(&self) -> Result<()> {
        let t = &self.collection;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                job_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL DEFAULT '',
                user_email TEXT,
                filename TEXT NOT NULL DEFAULT '',
                file_hash TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                recording_date TEXT NOT NULL DEFAULT '',
                audio_path TEXT NOT NULL DEFAULT '',
                transcription_path TEXT NOT NULL DEFAULT '',
                audio_size INTEGER NOT NULL DEFAULT 0,
                audio_duration_ms INTEGER,
                language TEXT NOT NULL DEFAULT 'auto',
                initial_prompt TEXT NOT NULL DEFAULT '',
                num_speakers INTEGER,
                min_speakers INTEGER,
                max_speakers INTEGER,
                status TEXT NOT NULL DEFAULT 'QUEUED',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                process_started_at TEXT,
                process_ended_at TEXT,
                error_message TEXT,
                batch_handle TEXT
            )"
        );
        sqlx::query(&ddl).execute(&self.pool).await?;

        let status_idx =
            format!("CREATE INDEX IF NOT EXISTS idx_{t}_status ON {t} (status, created_at)");
        sqlx::query(&status_idx).execute(&self.pool).await?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &NewJob) -> Result<()> {
        let sql = format!(
            "INSERT INTO {t} (
                job_id, user_id, user_email, filename, file_hash, description,
                recording_date, audio_path, transcription_path, audio_size,
                audio_duration_ms, language, initial_prompt, num_speakers,
                min_speakers, max_speakers, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'QUEUED', {now}, {now})",
            t = self.collection,
            now = SERVER_NOW,
        );

        retry_on_sqlite_busy("create_job", || async {
            sqlx::query(&sql)
                .bind(&job.job_id)
                .bind(&job.user_id)
                .bind(&job.user_email)
                .bind(&job.filename)
                .bind(&job.file_hash)
                .bind(&job.description)
                .bind(&job.recording_date)
                .bind(&job.audio_path)
                .bind(&job.transcription_path)
                .bind(job.audio_size)
                .bind(job.audio_duration_ms)
                .bind(&job.language)
                .bind(&job.initial_prompt)
                .bind(job.num_speakers)
                .bind(job.min_speakers)
                .bind(job.max_speakers)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        self.find_job(job_id)
            .await?
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    async fn find_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {t} WHERE job_id = ?",
            t = self.collection
        );
        let job = sqlx::query_as(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {t} WHERE status = ?",
            t = self.collection
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {t} WHERE status = ? ORDER BY created_at ASC, rowid ASC",
            t = self.collection
        );
        let jobs = sqlx::query_as(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn claim_queued_jobs(&self, max_processing: u32) -> Result<Vec<JobRecord>> {
        let count_sql = format!(
            "SELECT COUNT(*) FROM {t} WHERE status = 'PROCESSING'",
            t = self.collection
        );
        let select_sql = format!(
            "SELECT {JOB_COLUMNS} FROM {t} WHERE status = 'QUEUED' \
             ORDER BY created_at ASC, rowid ASC LIMIT ?",
            t = self.collection
        );
        // The claim re-checks the status in its WHERE clause; a job canceled
        // between the select and the update is silently skipped.
        let claim_sql = format!(
            "UPDATE {t} SET status = 'PROCESSING', process_started_at = {now}, \
             updated_at = {now} WHERE job_id = ? AND status = 'QUEUED'",
            t = self.collection,
            now = SERVER_NOW,
        );

        retry_on_sqlite_busy("claim_queued_jobs", || async {
            // The processing count and the claim share one transaction. Under
            // WAL a concurrent claimer that committed after our snapshot makes
            // our first write fail busy, which sends the whole transaction
            // through the retry above with a fresh snapshot; the ceiling can
            // therefore never be over-admitted.
            let mut tx = self.pool.begin().await?;

            let processing: i64 = sqlx::query_scalar(&count_sql).fetch_one(&mut *tx).await?;
            let free = (max_processing as i64 - processing).max(0);
            if free == 0 {
                return Ok(Vec::new());
            }

            let candidates: Vec<JobRecord> = sqlx::query_as(&select_sql)
                .bind(free)
                .fetch_all(&mut *tx)
                .await?;
            if candidates.is_empty() {
                return Ok(Vec::new());
            }

            let mut claimed_ids = Vec::with_capacity(candidates.len());
            for job in &candidates {
                let result = sqlx::query(&claim_sql)
                    .bind(&job.job_id)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() == 1 {
                    claimed_ids.push(job.job_id.clone());
                }
            }

            if claimed_ids.is_empty() {
                return Ok(Vec::new());
            }

            // Re-read inside the transaction so the returned records carry
            // the store-assigned process_started_at.
            let placeholders = claimed_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            let reread_sql = format!(
                "SELECT {JOB_COLUMNS} FROM {t} WHERE job_id IN ({placeholders}) \
                 ORDER BY created_at ASC, rowid ASC",
                t = self.collection,
            );
            let mut query = sqlx::query_as(&reread_sql);
            for id in &claimed_ids {
                query = query.bind(id);
            }
            let claimed: Vec<JobRecord> = query.fetch_all(&mut *tx).await?;

            tx.commit().await?;
            Ok(claimed)
        })
        .await
    }

    async fn set_batch_handle(&self, job_id: &str, handle: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {t} SET batch_handle = ?, updated_at = {now} WHERE job_id = ?",
            t = self.collection,
            now = SERVER_NOW,
        );
        retry_on_sqlite_busy("set_batch_handle", || async {
            sqlx::query(&sql)
                .bind(handle)
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn complete_processing(&self, job_id: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {t} SET status = 'COMPLETED', process_ended_at = {now}, \
             updated_at = {now} WHERE job_id = ? AND status = 'PROCESSING'",
            t = self.collection,
            now = SERVER_NOW,
        );
        retry_on_sqlite_busy("complete_processing", || async {
            let result = sqlx::query(&sql).bind(job_id).execute(&self.pool).await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn fail_processing(&self, job_id: &str, error_message: Option<&str>) -> Result<bool> {
        let sql = format!(
            "UPDATE {t} SET status = 'FAILED', error_message = ?, process_ended_at = {now}, \
             updated_at = {now} WHERE job_id = ? AND status = 'PROCESSING'",
            t = self.collection,
            now = SERVER_NOW,
        );
        retry_on_sqlite_busy("fail_processing", || async {
            let result = sqlx::query(&sql)
                .bind(error_message)
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn fail_timed_out(&self, job_ids: &[String], error_message: &str) -> Result<u64> {
        if job_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = job_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "UPDATE {t} SET status = 'FAILED', error_message = ?, process_ended_at = {now}, \
             updated_at = {now} WHERE job_id IN ({placeholders}) AND status = 'PROCESSING'",
            t = self.collection,
            now = SERVER_NOW,
        );

        retry_on_sqlite_busy("fail_timed_out", || async {
            let mut query = sqlx::query(&sql).bind(error_message);
            for id in job_ids {
                query = query.bind(id);
            }
            let result = query.execute(&self.pool).await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
