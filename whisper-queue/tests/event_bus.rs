//! Event bus integration tests: publish → deliver round-trips over a real
//! HTTP hop, and the delivery endpoint end to end.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use whisper_queue::api::{self, AppState};
use whisper_queue::batch::BatchExecutor;
use whisper_queue::database::models::JobRecord;
use whisper_queue::database::repositories::{JobStore, SqliteJobStore};
use whisper_queue::database::{DbPool, init_pool};
use whisper_queue::events::{
    EventEnvelope, EventPublisher, PubSubConfig, PubSubPublisher, decode_delivery,
    encode_message_data,
};
use whisper_queue::notification::{EmailConfig, EmailNotifier};
use whisper_queue::queue::{CompletionHandler, ControllerConfig, QueueController};
use whisper_queue::Result;

/// Topic endpoint test double: records publish bodies, optionally failing
/// the first N requests.
#[derive(Clone, Default)]
struct TopicRecorder {
    bodies: Arc<parking_lot::Mutex<Vec<Value>>>,
    fail_first: Arc<AtomicU32>,
}

async fn record_publish(
    State(recorder): State<TopicRecorder>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if recorder
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})));
    }
    recorder.bodies.lock().push(body);
    (StatusCode::OK, Json(json!({ "messageIds": ["1"] })))
}

async fn start_topic_server(recorder: TopicRecorder) -> String {
    let router = Router::new()
        .route(
            "/v1/projects/test-proj/topics/whisper-events:publish",
            post(record_publish),
        )
        .with_state(recorder);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn publisher(endpoint: String) -> PubSubPublisher {
    PubSubPublisher::new(PubSubConfig {
        endpoint,
        project_id: "test-proj".to_string(),
        topic: "whisper-events".to_string(),
        request_timeout_secs: 5,
        max_attempts: 3,
    })
}

#[tokio::test]
async fn publish_then_deliver_round_trips_the_envelope() {
    let recorder = TopicRecorder::default();
    let endpoint = start_topic_server(recorder.clone()).await;

    let envelope = EventEnvelope::failed("j42", Some("diarization crashed".to_string()));
    publisher(endpoint).publish(&envelope).await.unwrap();

    let bodies = recorder.bodies.lock().clone();
    assert_eq!(bodies.len(), 1);

    // Feed the published payload back through the push-delivery decoder.
    let data = bodies[0]["messages"][0]["data"].as_str().unwrap();
    let push_body = json!({ "message": { "data": data } });
    let decoded = decode_delivery(&serde_json::to_vec(&push_body).unwrap()).unwrap();

    assert_eq!(decoded, envelope);
}

#[tokio::test]
async fn publish_retries_transient_rejections() {
    let recorder = TopicRecorder::default();
    recorder.fail_first.store(1, Ordering::SeqCst);
    let endpoint = start_topic_server(recorder.clone()).await;

    publisher(endpoint)
        .publish(&EventEnvelope::completed("j1"))
        .await
        .unwrap();

    assert_eq!(recorder.bodies.lock().len(), 1);
}

#[derive(Default)]
struct RecordingExecutor {
    submissions: parking_lot::Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl BatchExecutor for RecordingExecutor {
    async fn submit(&self, job: &JobRecord) -> Result<String> {
        self.submissions.lock().push(job.job_id.clone());
        Ok(format!("projects/test/locations/r/jobs/whisper-{}", job.job_id))
    }
}

async fn start_delivery_server(dir: &TempDir) -> (String, DbPool, Arc<SqliteJobStore>) {
    let db_path = dir.path().join("jobs.db");
    let url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool(&url).await.unwrap();
    let store = Arc::new(SqliteJobStore::new(pool.clone(), "whisper_jobs").unwrap());
    store.ensure_collection().await.unwrap();

    let executor = Arc::new(RecordingExecutor::default());
    let controller = Arc::new(QueueController::new(
        store.clone(),
        executor,
        ControllerConfig {
            max_processing_jobs: 1,
            poll_interval: Duration::from_secs(10),
        },
        CancellationToken::new(),
    ));
    let notifier = Arc::new(EmailNotifier::new(EmailConfig::default()));
    let handler = Arc::new(CompletionHandler::new(store.clone(), controller, notifier));

    let router = api::router(AppState { handler });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}"), pool, store)
}

#[tokio::test]
async fn delivery_endpoint_applies_the_terminal_transition() {
    let dir = TempDir::new().unwrap();
    let (base_url, pool, store) = start_delivery_server(&dir).await;

    let now = Utc::now().to_rfc3339();
    sqlx::query(
        "INSERT INTO whisper_jobs (job_id, status, created_at, updated_at, process_started_at) \
         VALUES ('j1', 'PROCESSING', ?, ?, ?)",
    )
    .bind(&now)
    .bind(&now)
    .bind(&now)
    .execute(&pool)
    .await
    .unwrap();

    let envelope = EventEnvelope::completed("j1");
    let data = encode_message_data(&envelope).unwrap();
    let push_body = json!({ "message": { "data": data } });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/events"))
        .json(&push_body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    let job = store.get_job("j1").await.unwrap();
    assert_eq!(job.status, "COMPLETED");
    assert!(job.process_ended_at.is_some());
}

#[tokio::test]
async fn delivery_endpoint_acknowledges_malformed_bodies() {
    let dir = TempDir::new().unwrap();
    let (base_url, _pool, _store) = start_delivery_server(&dir).await;

    let client = reqwest::Client::new();

    // Malformed bodies are acknowledged; redelivery cannot fix them.
    let response = client
        .post(format!("{base_url}/events"))
        .body("not json at all")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    let response = client
        .get(format!("{base_url}/healthz"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");
}
