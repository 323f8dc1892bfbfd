//! Email notification for completed jobs.
//!
//! Delivery is best-effort; a failed or skipped notification never affects
//! the store transition that triggered it.

use tracing::info;

use crate::Result;
use crate::config::Settings;
use crate::database::models::JobRecord;

/// Email notifier configuration.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Whether completion emails are enabled.
    pub enabled: bool,
    /// Sender address.
    pub from_address: String,
}

impl EmailConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            enabled: settings.email_notification,
            from_address: settings.email_from_address.clone(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            from_address: "noreply@localhost".to_string(),
        }
    }
}

/// Sends a completion email to the job owner.
pub struct EmailNotifier {
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Build the email subject for a completed job.
    fn build_subject(&self, job: &JobRecord) -> String {
        format!("Transcription finished: {}", job.filename)
    }

    /// Build the plain-text email body.
    fn build_body(&self, job: &JobRecord) -> String {
        format!(
            "Your transcription job has completed.\n\nJob ID: {}\nFile: {}\nResult: {}\n",
            job.job_id, job.filename, job.transcription_path
        )
    }

    /// Notify the job owner that their job completed. A no-op when emails are
    /// disabled or the job carries no owner address.
    pub async fn notify_completed(&self, job: &JobRecord) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let Some(recipient) = job.user_email.as_deref().filter(|e| !e.is_empty()) else {
            return Ok(());
        };

        let subject = self.build_subject(job);
        let _body = self.build_body(job);

        // TODO: wire an SMTP client (lettre) here once the relay is
        // provisioned; until then the notification is recorded in the log.
        info!(
            job_id = %job.job_id,
            from = %self.config.from_address,
            to = %recipient,
            subject = %subject,
            "Completion notification prepared"
        );

        Ok(())
    }
}
