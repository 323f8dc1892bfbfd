//! Job record models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job status.
///
/// QUEUED is the initial state. COMPLETED, FAILED and CANCELED are terminal;
/// once a job reaches one of them the core never writes its status again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be claimed by the queue controller.
    Queued,
    /// Claimed and handed to the batch executor.
    Processing,
    /// Worker reported success.
    Completed,
    /// Worker reported failure, submission failed, or the job timed out.
    Failed,
    /// Canceled by an external actor while still queued.
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    /// Parse a stored status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transcription job record.
///
/// One row per submission. All timestamps are RFC 3339 strings written by the
/// store's own clock, never by the controller.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub filename: String,
    /// Content address used in artifact paths.
    pub file_hash: String,
    pub description: String,
    pub recording_date: String,
    /// Input object location (relative to the artifact bucket).
    pub audio_path: String,
    /// Output object location (relative to the artifact bucket).
    pub transcription_path: String,
    pub audio_size: i64,
    pub audio_duration_ms: Option<i64>,
    /// Pipeline parameter, passed through to the worker (e.g. "ja", "auto").
    pub language: String,
    pub initial_prompt: String,
    pub num_speakers: Option<i64>,
    pub min_speakers: Option<i64>,
    pub max_speakers: Option<i64>,
    /// Status string: QUEUED, PROCESSING, COMPLETED, FAILED, CANCELED.
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    /// Set when the job first enters PROCESSING; never cleared.
    pub process_started_at: Option<String>,
    pub process_ended_at: Option<String>,
    /// Populated only on FAILED.
    pub error_message: Option<String>,
    /// Opaque identifier the batch executor returned at submission time.
    pub batch_handle: Option<String>,
}

impl JobRecord {
    /// `process_started_at` as a UTC instant, if present and well-formed.
    pub fn process_started_at_utc(&self) -> Option<DateTime<Utc>> {
        self.process_started_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Audio duration rounded up to whole seconds, if known.
    pub fn audio_duration_secs(&self) -> Option<u64> {
        self.audio_duration_ms
            .filter(|ms| *ms >= 0)
            .map(|ms| (ms as u64).div_ceil(1000))
    }
}

/// Submission fields for a new job. Status and timestamps are assigned by the
/// store at insert time.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub job_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub filename: String,
    pub file_hash: String,
    pub description: String,
    pub recording_date: String,
    pub audio_path: String,
    pub transcription_path: String,
    pub audio_size: i64,
    pub audio_duration_ms: Option<i64>,
    pub language: String,
    pub initial_prompt: String,
    pub num_speakers: Option<i64>,
    pub min_speakers: Option<i64>,
    pub max_speakers: Option<i64>,
}
