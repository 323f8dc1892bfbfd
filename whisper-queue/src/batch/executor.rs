//! GPU batch submission.
//!
//! Translates a job record into the batch API's job shape and submits it.
//! The call is synchronous in the queueing sense: it returns once the batch
//! system has accepted the job, long before the job itself finishes.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use crate::config::Settings;
use crate::database::models::JobRecord;
use crate::{Error, Result};

/// Floor for the batch task's maximum run duration, in seconds.
const MIN_RUN_DURATION_SECS: u64 = 300;

/// Default per-request timeout for the submission call, in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Worker machine type; must be compatible with the requested accelerator.
const MACHINE_TYPE: &str = "n1-standard-4";

/// Accelerator attached to each worker instance.
const ACCELERATOR_TYPE: &str = "nvidia-tesla-t4";

/// Batch executor trait.
///
/// Failures are reported as [`Error::Submit`]; the message is surfaced into
/// the job's `error_message` by the queue controller.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Submit a job to the executor, returning an opaque handle.
    async fn submit(&self, job: &JobRecord) -> Result<String>;
}

/// Batch executor configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Batch API base URL.
    pub endpoint: String,
    /// Project the batch jobs run under.
    pub project_id: String,
    /// Region the batch jobs run in.
    pub region: String,
    /// Artifact bucket prefixed onto the per-job object paths.
    pub bucket: String,
    /// Worker container image.
    pub image_url: String,
    /// Hugging Face token forwarded to the worker.
    pub hf_auth_token: String,
    /// Topic the worker publishes its terminal event to.
    pub pubsub_topic: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl BatchConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            endpoint: settings.batch_endpoint.clone(),
            project_id: settings.gcp_project_id.clone(),
            region: settings.gcp_region.clone(),
            bucket: settings.gcs_bucket_name.clone(),
            image_url: settings.batch_image_url.clone(),
            hf_auth_token: settings.hf_auth_token.clone(),
            pubsub_topic: settings.pubsub_topic.clone(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

/// Environment variables handed to the worker container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchParameters {
    #[serde(rename = "JOB_ID")]
    pub job_id: String,
    #[serde(rename = "AUDIO_PATH")]
    pub audio_path: String,
    #[serde(rename = "TRANSCRIPTION_PATH")]
    pub transcription_path: String,
    #[serde(rename = "HF_AUTH_TOKEN")]
    pub hf_auth_token: String,
    #[serde(rename = "PUBSUB_TOPIC")]
    pub pubsub_topic: String,
    #[serde(rename = "GCP_PROJECT_ID")]
    pub project_id: String,
    #[serde(rename = "GCP_REGION")]
    pub region: String,
    #[serde(rename = "NUM_SPEAKERS")]
    pub num_speakers: String,
    #[serde(rename = "MIN_SPEAKERS")]
    pub min_speakers: String,
    #[serde(rename = "MAX_SPEAKERS")]
    pub max_speakers: String,
    #[serde(rename = "LANGUAGE")]
    pub language: String,
    #[serde(rename = "INITIAL_PROMPT")]
    pub initial_prompt: String,
}

impl BatchParameters {
    /// Build the worker parameter set for a job.
    ///
    /// `NUM_SPEAKERS` is the empty string when no exact count was requested;
    /// the min/max hints default to 1.
    pub fn for_job(job: &JobRecord, config: &BatchConfig) -> Self {
        Self {
            job_id: job.job_id.clone(),
            audio_path: format!("{}/{}", config.bucket, job.audio_path),
            transcription_path: format!("{}/{}", config.bucket, job.transcription_path),
            hf_auth_token: config.hf_auth_token.clone(),
            pubsub_topic: config.pubsub_topic.clone(),
            project_id: config.project_id.clone(),
            region: config.region.clone(),
            num_speakers: job.num_speakers.map(|n| n.to_string()).unwrap_or_default(),
            min_speakers: job.min_speakers.unwrap_or(1).to_string(),
            max_speakers: job.max_speakers.unwrap_or(1).to_string(),
            language: job.language.clone(),
            initial_prompt: job.initial_prompt.clone(),
        }
    }
}

/// Maximum run duration for a job: the floor or the audio length, whichever
/// is larger.
pub fn max_run_duration_secs(job: &JobRecord) -> u64 {
    MIN_RUN_DURATION_SECS.max(job.audio_duration_secs().unwrap_or(0))
}

/// Build the batch API job body for a submission.
pub fn build_job_body(job: &JobRecord, config: &BatchConfig) -> Result<Value> {
    let parameters = BatchParameters::for_job(job, config);
    let variables = serde_json::to_value(&parameters)?;

    Ok(json!({
        "taskGroups": [{
            "taskCount": 1,
            "taskSpec": {
                "runnables": [{
                    "container": {
                        "imageUri": config.image_url,
                        "commands": ["python3", "/app/main.py"],
                    },
                    "environment": { "variables": variables },
                }],
                "computeResource": {
                    "cpuMilli": 2000,
                    "memoryMib": 16384,
                },
                "maxRetryCount": 2,
                "maxRunDuration": format!("{}s", max_run_duration_secs(job)),
            },
        }],
        "allocationPolicy": {
            "location": {
                "allowedLocations": [format!("regions/{}", config.region)],
            },
            "instances": [{
                "installGpuDrivers": true,
                "policy": {
                    "machineType": MACHINE_TYPE,
                    "accelerators": [{
                        "type": ACCELERATOR_TYPE,
                        "count": 1,
                    }],
                },
            }],
        },
        "logsPolicy": { "destination": "CLOUD_LOGGING" },
    }))
}

/// Batch executor backed by the cloud batch REST API.
pub struct CloudBatchExecutor {
    config: BatchConfig,
    client: Client,
}

impl CloudBatchExecutor {
    pub fn new(config: BatchConfig) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/jobs",
            self.config.endpoint.trim_end_matches('/'),
            self.config.project_id,
            self.config.region,
        )
    }
}

#[async_trait]
impl BatchExecutor for CloudBatchExecutor {
    async fn submit(&self, job: &JobRecord) -> Result<String> {
        let batch_job_name = format!("whisper-{}-{}", job.job_id, unix_now_secs());
        let body = build_job_body(job, &self.config)
            .map_err(|e| Error::submit(format!("failed to build batch job: {}", e)))?;

        info!(
            job_id = %job.job_id,
            file_hash = %job.file_hash,
            batch_job = %batch_job_name,
            "Submitting batch job"
        );

        let response = self
            .client
            .post(self.jobs_url())
            .query(&[("job_id", batch_job_name.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::submit(format!("batch request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::submit(format!(
                "batch API returned {}: {}",
                status,
                detail.chars().take(256).collect::<String>()
            )));
        }

        // The API echoes the fully-qualified job name; fall back to the name
        // we asked for if the response is not parseable.
        let handle = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(batch_job_name);

        info!(job_id = %job.job_id, handle = %handle, "Batch job accepted");
        Ok(handle)
    }
}

fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
