//! Environment-driven configuration.
//!
//! All knobs come from process environment variables (loaded from a `.env`
//! file by `main` via dotenvy before [`Settings::from_env`] runs). Required
//! values fail startup with a configuration error; everything else falls back
//! to its documented default.

use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Default concurrency ceiling (jobs in PROCESSING).
pub const DEFAULT_MAX_PROCESSING_JOBS: u32 = 1;

/// Default fixed processing timeout in seconds.
pub const DEFAULT_PROCESS_TIMEOUT_SECONDS: u64 = 300;

/// Default audio-duration timeout multiplier.
pub const DEFAULT_AUDIO_TIMEOUT_MULTIPLIER: f64 = 2.0;

/// Default poll/sweep cadence in seconds.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 10;

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Concurrency ceiling for jobs in PROCESSING (`MAX_PROCESSING_JOBS`).
    ///
    /// This is the startup snapshot; the queue controller re-reads the
    /// environment on every tick so operators can adjust the ceiling without
    /// a restart.
    pub max_processing_jobs: u32,
    /// Fixed processing timeout (`PROCESS_TIMEOUT_SECONDS`).
    pub process_timeout_secs: u64,
    /// Audio-duration timeout multiplier (`AUDIO_TIMEOUT_MULTIPLIER`).
    pub audio_timeout_multiplier: f64,
    /// Poll/sweep cadence (`POLL_INTERVAL_SECONDS`).
    pub poll_interval: Duration,
    /// Jobs table name (`WHISPER_JOBS_COLLECTION`).
    pub jobs_collection: String,
    /// Event topic (`PUBSUB_TOPIC`).
    pub pubsub_topic: String,
    /// Publish API base URL (`PUBSUB_ENDPOINT`).
    pub pubsub_endpoint: String,
    /// Batch API base URL (`BATCH_ENDPOINT`).
    pub batch_endpoint: String,
    /// Worker container image (`BATCH_IMAGE_URL`).
    pub batch_image_url: String,
    /// Hugging Face token forwarded to the worker (`HF_AUTH_TOKEN`).
    pub hf_auth_token: String,
    /// Executor project id (`GCP_PROJECT_ID`).
    pub gcp_project_id: String,
    /// Executor region (`GCP_REGION`).
    pub gcp_region: String,
    /// Artifact bucket (`GCS_BUCKET_NAME`).
    pub gcs_bucket_name: String,
    /// Enable completion emails (`EMAIL_NOTIFICATION`).
    pub email_notification: bool,
    /// Notification sender address (`EMAIL_FROM_ADDRESS`).
    pub email_from_address: String,
    /// SQLite database URL (`DATABASE_URL`).
    pub database_url: String,
    /// Event delivery server bind address (`BIND_ADDR`).
    pub bind_addr: String,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_processing_jobs: parse_or(
                "MAX_PROCESSING_JOBS",
                env_opt("MAX_PROCESSING_JOBS").as_deref(),
                DEFAULT_MAX_PROCESSING_JOBS,
            )?,
            process_timeout_secs: parse_or(
                "PROCESS_TIMEOUT_SECONDS",
                env_opt("PROCESS_TIMEOUT_SECONDS").as_deref(),
                DEFAULT_PROCESS_TIMEOUT_SECONDS,
            )?,
            audio_timeout_multiplier: parse_or(
                "AUDIO_TIMEOUT_MULTIPLIER",
                env_opt("AUDIO_TIMEOUT_MULTIPLIER").as_deref(),
                DEFAULT_AUDIO_TIMEOUT_MULTIPLIER,
            )?,
            poll_interval: Duration::from_secs(parse_or(
                "POLL_INTERVAL_SECONDS",
                env_opt("POLL_INTERVAL_SECONDS").as_deref(),
                DEFAULT_POLL_INTERVAL_SECONDS,
            )?),
            jobs_collection: required("WHISPER_JOBS_COLLECTION")?,
            pubsub_topic: required("PUBSUB_TOPIC")?,
            pubsub_endpoint: env_opt("PUBSUB_ENDPOINT")
                .unwrap_or_else(|| "https://pubsub.googleapis.com".to_string()),
            batch_endpoint: env_opt("BATCH_ENDPOINT")
                .unwrap_or_else(|| "https://batch.googleapis.com".to_string()),
            batch_image_url: required("BATCH_IMAGE_URL")?,
            hf_auth_token: required("HF_AUTH_TOKEN")?,
            gcp_project_id: required("GCP_PROJECT_ID")?,
            gcp_region: required("GCP_REGION")?,
            gcs_bucket_name: required("GCS_BUCKET_NAME")?,
            email_notification: env_opt("EMAIL_NOTIFICATION")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            email_from_address: env_opt("EMAIL_FROM_ADDRESS")
                .unwrap_or_else(|| "noreply@localhost".to_string()),
            database_url: env_opt("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:whisper_queue.db?mode=rwc".to_string()),
            bind_addr: env_opt("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }

}

/// Read an environment variable, treating empty/whitespace values as unset.
fn env_opt(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) => {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

/// Read a required environment variable.
fn required(name: &str) -> Result<String> {
    env_opt(name).ok_or_else(|| Error::config(format!("{} must be set", name)))
}

/// Parse an optional raw value, falling back to a default when absent.
fn parse_or<T>(name: &str, raw: Option<&str>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(v) => v
            .parse()
            .map_err(|e| Error::config(format!("Invalid {}: {}", name, e))),
        None => Ok(default),
    }
}
