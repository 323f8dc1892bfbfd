//! Completion handler.
//!
//! Consumes terminal events reported by workers and applies the matching
//! store transitions. Only jobs currently in PROCESSING transition;
//! everything else is a logged no-op, which makes redelivered and
//! out-of-order events harmless.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::Result;
use crate::batch::BatchExecutor;
use crate::database::repositories::JobStore;
use crate::events::{EventEnvelope, EventKind};
use crate::notification::EmailNotifier;
use crate::queue::controller::QueueController;

/// The completion handler.
pub struct CompletionHandler<S, B> {
    store: Arc<S>,
    controller: Arc<QueueController<S, B>>,
    notifier: Arc<EmailNotifier>,
}

impl<S, B> CompletionHandler<S, B>
where
    S: JobStore + 'static,
    B: BatchExecutor + 'static,
{
    pub fn new(
        store: Arc<S>,
        controller: Arc<QueueController<S, B>>,
        notifier: Arc<EmailNotifier>,
    ) -> Self {
        Self {
            store,
            controller,
            notifier,
        }
    }

    /// Handle one decoded event.
    ///
    /// Returns an error only for transient store failures, so the transport
    /// can redeliver; every drop case is an `Ok` no-op.
    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<()> {
        debug!(
            job_id = %envelope.job_id,
            event_type = %envelope.event_type,
            timestamp = %envelope.timestamp,
            "Handling event"
        );

        match envelope.kind() {
            EventKind::NewJob => {
                info!(job_id = %envelope.job_id, "New job announced");
                self.dispatch_next().await;
                Ok(())
            }
            EventKind::Canceled => {
                // The upstream actor already wrote CANCELED; nothing to do.
                info!(job_id = %envelope.job_id, "Job canceled upstream");
                Ok(())
            }
            EventKind::Completed => self.apply_completed(envelope).await,
            EventKind::Failed => self.apply_failed(envelope).await,
            EventKind::Unknown => {
                warn!(
                    job_id = %envelope.job_id,
                    event_type = %envelope.event_type,
                    "Unknown event type, dropping"
                );
                Ok(())
            }
        }
    }

    async fn apply_completed(&self, envelope: &EventEnvelope) -> Result<()> {
        let Some(job) = self.store.find_job(&envelope.job_id).await? else {
            warn!(job_id = %envelope.job_id, "Completion event for unknown job, dropping");
            return Ok(());
        };

        let applied = self.store.complete_processing(&job.job_id).await?;
        if !applied {
            info!(
                job_id = %job.job_id,
                status = %job.status,
                "Dropping completion event; job is not PROCESSING"
            );
            return Ok(());
        }

        info!(job_id = %job.job_id, "Job completed");

        if let Err(e) = self.notifier.notify_completed(&job).await {
            warn!(job_id = %job.job_id, "Completion notification failed: {}", e);
        }

        self.dispatch_next().await;
        Ok(())
    }

    async fn apply_failed(&self, envelope: &EventEnvelope) -> Result<()> {
        let Some(job) = self.store.find_job(&envelope.job_id).await? else {
            warn!(job_id = %envelope.job_id, "Failure event for unknown job, dropping");
            return Ok(());
        };

        let applied = self
            .store
            .fail_processing(&job.job_id, envelope.error_message.as_deref())
            .await?;
        if !applied {
            info!(
                job_id = %job.job_id,
                status = %job.status,
                "Dropping failure event; job is not PROCESSING"
            );
            return Ok(());
        }

        info!(
            job_id = %job.job_id,
            error = envelope.error_message.as_deref().unwrap_or(""),
            "Job failed"
        );

        self.dispatch_next().await;
        Ok(())
    }

    /// Kick the controller so a freed slot is refilled promptly. Dispatch
    /// errors are logged; the controller's own tick retries.
    async fn dispatch_next(&self) {
        if let Err(e) = self.controller.dispatch().await {
            warn!("Dispatch after event failed: {}", e);
        }
    }
}
