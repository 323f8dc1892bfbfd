//! Timeout reaper.
//!
//! The PROCESSING status is the lease; this sweeper is the liveness
//! mechanism. Any job past its audio-aware deadline is transitioned to
//! FAILED. Jobs carrying no `process_started_at` are left alone: they are
//! in flight but unattested, and no assumption is made about them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::database::models::JobStatus;
use crate::database::repositories::JobStore;
use crate::Result;

/// Error message written on every timeout transition.
pub const TIMEOUT_ERROR_MESSAGE: &str = "processing timeout";

/// Timeout reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Fixed floor for the per-job deadline, in seconds.
    pub process_timeout_secs: u64,
    /// Multiplier applied to the audio duration for the deadline.
    pub audio_timeout_multiplier: f64,
    /// Sweep cadence.
    pub poll_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            process_timeout_secs: 300,
            audio_timeout_multiplier: 2.0,
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl ReaperConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            process_timeout_secs: settings.process_timeout_secs,
            audio_timeout_multiplier: settings.audio_timeout_multiplier,
            poll_interval: settings.poll_interval,
        }
    }
}

/// Per-job deadline in seconds: the fixed floor or the scaled audio
/// duration, whichever is larger.
pub fn deadline_seconds(config: &ReaperConfig, audio_duration_ms: Option<i64>) -> u64 {
    let audio_based = audio_duration_ms
        .filter(|ms| *ms >= 0)
        .map(|ms| (ms as f64 / 1000.0 * config.audio_timeout_multiplier).ceil() as u64)
        .unwrap_or(0);
    config.process_timeout_secs.max(audio_based)
}

/// The timeout reaper.
pub struct TimeoutReaper<S> {
    store: Arc<S>,
    config: ReaperConfig,
    cancellation_token: CancellationToken,
}

impl<S> TimeoutReaper<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: Arc<S>, config: ReaperConfig, cancellation_token: CancellationToken) -> Self {
        Self {
            store,
            config,
            cancellation_token,
        }
    }

    /// One sweep pass. Returns how many jobs were transitioned to FAILED.
    ///
    /// The expired jobs are failed in a single guarded commit; re-running
    /// the sweep after a partial failure converges to the same state.
    pub async fn sweep(&self) -> Result<u64> {
        let processing = self.store.list_by_status(JobStatus::Processing).await?;
        if processing.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut expired = Vec::new();

        for job in &processing {
            let Some(started) = job.process_started_at_utc() else {
                debug!(job_id = %job.job_id, "Skipping PROCESSING job without process_started_at");
                continue;
            };

            let deadline = deadline_seconds(&self.config, job.audio_duration_ms);
            let elapsed = (now - started).num_seconds();

            if elapsed > deadline as i64 {
                warn!(
                    job_id = %job.job_id,
                    elapsed_secs = elapsed,
                    deadline_secs = deadline,
                    "Job exceeded processing deadline"
                );
                expired.push(job.job_id.clone());
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        let failed = self
            .store
            .fail_timed_out(&expired, TIMEOUT_ERROR_MESSAGE)
            .await?;
        info!(count = failed, "Timed out stale job(s)");
        Ok(failed)
    }

    /// Run the sweep loop until cancelled. Sweep errors never block queue
    /// progress; they are logged and the next tick retries.
    pub async fn run(&self) {
        info!(
            "Timeout reaper started (poll interval {:?})",
            self.config.poll_interval
        );

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if self.cancellation_token.is_cancelled() {
                break;
            }

            if let Err(e) = self.sweep().await {
                warn!("Reaper sweep failed: {}", e);
            }
        }

        info!("Timeout reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(timeout: u64, multiplier: f64) -> ReaperConfig {
        ReaperConfig {
            process_timeout_secs: timeout,
            audio_timeout_multiplier: multiplier,
            poll_interval: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_deadline_uses_floor_without_audio_duration() {
        assert_eq!(deadline_seconds(&config(300, 2.0), None), 300);
        assert_eq!(deadline_seconds(&config(300, 2.0), Some(-1)), 300);
    }

    #[test]
    fn test_deadline_scales_with_audio_duration() {
        // 10 minutes of audio at 2x: 1200s beats the 300s floor.
        assert_eq!(deadline_seconds(&config(300, 2.0), Some(600_000)), 1200);
        // 1s of audio: the floor wins.
        assert_eq!(deadline_seconds(&config(300, 2.0), Some(1000)), 300);
        // Fractional seconds round up.
        assert_eq!(deadline_seconds(&config(5, 1.0), Some(1500)), 5);
        assert_eq!(deadline_seconds(&config(5, 1.0), Some(5500)), 6);
    }
}
