//! Queue controller.
//!
//! Claims queued jobs up to the free-slot count and hands each one to the
//! batch executor. The claim itself flips jobs to PROCESSING inside a store
//! transaction; a job whose submission then fails is rolled forward to FAILED
//! rather than back to QUEUED, so operators see the failure instead of the
//! controller retrying it forever. Retrying a failed submission is an
//! operator action.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::BatchExecutor;
use crate::config::Settings;
use crate::database::models::JobRecord;
use crate::database::repositories::JobStore;
use crate::Result;

/// Queue controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrency ceiling used when `MAX_PROCESSING_JOBS` is unset at tick
    /// time.
    pub max_processing_jobs: u32,
    /// Backstop poll interval; event-driven wake-ups are the primary trigger.
    pub poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_processing_jobs: 1,
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl ControllerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_processing_jobs: settings.max_processing_jobs,
            poll_interval: settings.poll_interval,
        }
    }
}

/// The queue controller.
pub struct QueueController<S, B> {
    store: Arc<S>,
    executor: Arc<B>,
    config: ControllerConfig,
    notify: Notify,
    cancellation_token: CancellationToken,
}

impl<S, B> QueueController<S, B>
where
    S: JobStore + 'static,
    B: BatchExecutor + 'static,
{
    pub fn new(
        store: Arc<S>,
        executor: Arc<B>,
        config: ControllerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            executor,
            config,
            notify: Notify::new(),
            cancellation_token,
        }
    }

    /// Wake the controller loop for an immediate dispatch pass.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Concurrency ceiling for this tick. Re-reads the environment so the
    /// ceiling can be changed on a running service.
    fn current_limit(&self) -> u32 {
        std::env::var("MAX_PROCESSING_JOBS")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.config.max_processing_jobs)
    }

    /// One dispatch pass: claim free slots, submit each claimed job.
    ///
    /// Returns the claimed jobs (already PROCESSING; jobs whose submission
    /// failed have been rolled forward to FAILED by the time this returns).
    pub async fn dispatch(&self) -> Result<Vec<JobRecord>> {
        let limit = self.current_limit();
        let claimed = self.store.claim_queued_jobs(limit).await?;
        if claimed.is_empty() {
            debug!("No free slots or no queued jobs");
            return Ok(claimed);
        }

        info!(count = claimed.len(), limit, "Claimed queued job(s)");

        for job in &claimed {
            match self.executor.submit(job).await {
                Ok(handle) => {
                    if let Err(e) = self.store.set_batch_handle(&job.job_id, &handle).await {
                        // The handle is operator bookkeeping; the job keeps
                        // running without it.
                        warn!(job_id = %job.job_id, "Failed to record batch handle: {}", e);
                    }
                }
                Err(e) => {
                    let message = format!("submit failed: {}", e);
                    error!(job_id = %job.job_id, "{}", message);
                    match self.store.fail_processing(&job.job_id, Some(&message)).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(job_id = %job.job_id, "Job left PROCESSING before submit failure was recorded")
                        }
                        Err(store_err) => {
                            error!(job_id = %job.job_id, "Failed to record submit failure: {}", store_err)
                        }
                    }
                }
            }
        }

        Ok(claimed)
    }

    /// Run the controller loop until cancelled.
    ///
    /// Dispatches on every wake-up from the completion handler and on the
    /// poll interval as a backstop. Tick errors are logged; the next tick
    /// retries.
    pub async fn run(&self) {
        info!(
            "Queue controller started (poll interval {:?})",
            self.config.poll_interval
        );

        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if self.cancellation_token.is_cancelled() {
                break;
            }

            if let Err(e) = self.dispatch().await {
                warn!("Dispatch tick failed: {}", e);
            }
        }

        info!("Queue controller stopped");
    }
}
