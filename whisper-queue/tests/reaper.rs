//! Timeout reaper integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use whisper_queue::database::repositories::{JobStore, SqliteJobStore};
use whisper_queue::database::{DbPool, init_pool};
use whisper_queue::queue::{ReaperConfig, TIMEOUT_ERROR_MESSAGE, TimeoutReaper};

const COLLECTION: &str = "whisper_jobs";

async fn test_store(dir: &TempDir) -> (DbPool, Arc<SqliteJobStore>) {
    let db_path = dir.path().join("jobs.db");
    let url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );
    let pool = init_pool(&url).await.unwrap();
    let store = Arc::new(SqliteJobStore::new(pool.clone(), COLLECTION).unwrap());
    store.ensure_collection().await.unwrap();
    (pool, store)
}

async fn seed_processing(
    pool: &DbPool,
    job_id: &str,
    started_secs_ago: Option<i64>,
    audio_duration_ms: Option<i64>,
) {
    let now = Utc::now();
    let started =
        started_secs_ago.map(|secs| (now - chrono::Duration::seconds(secs)).to_rfc3339());
    let created = now.to_rfc3339();

    let sql = format!(
        "INSERT INTO {COLLECTION} \
         (job_id, status, created_at, updated_at, process_started_at, audio_duration_ms) \
         VALUES (?, 'PROCESSING', ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(job_id)
        .bind(&created)
        .bind(&created)
        .bind(started)
        .bind(audio_duration_ms)
        .execute(pool)
        .await
        .unwrap();
}

fn reaper(store: Arc<SqliteJobStore>) -> TimeoutReaper<SqliteJobStore> {
    TimeoutReaper::new(
        store,
        ReaperConfig {
            process_timeout_secs: 5,
            audio_timeout_multiplier: 1.0,
            poll_interval: Duration::from_secs(10),
        },
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn stale_job_transitions_to_failed() {
    let dir = TempDir::new().unwrap();
    let (pool, store) = test_store(&dir).await;

    // Started 30s ago with 1s of audio: deadline is max(5, 1) = 5s.
    seed_processing(&pool, "j1", Some(30), Some(1000)).await;

    let reaped = reaper(store.clone()).sweep().await.unwrap();
    assert_eq!(reaped, 1);

    let job = store.get_job("j1").await.unwrap();
    assert_eq!(job.status, "FAILED");
    assert_eq!(job.error_message.as_deref(), Some(TIMEOUT_ERROR_MESSAGE));
    assert!(job.process_ended_at.is_some());
}

#[tokio::test]
async fn long_audio_extends_the_deadline() {
    let dir = TempDir::new().unwrap();
    let (pool, store) = test_store(&dir).await;

    // 10 minutes of audio at 1.0x gives a 600s deadline; 100s elapsed is fine.
    seed_processing(&pool, "j1", Some(100), Some(600_000)).await;

    let reaped = reaper(store.clone()).sweep().await.unwrap();
    assert_eq!(reaped, 0);
    assert_eq!(store.get_job("j1").await.unwrap().status, "PROCESSING");
}

#[tokio::test]
async fn job_without_start_attestation_is_skipped() {
    let dir = TempDir::new().unwrap();
    let (pool, store) = test_store(&dir).await;

    seed_processing(&pool, "j1", None, Some(1000)).await;

    let reaped = reaper(store.clone()).sweep().await.unwrap();
    assert_eq!(reaped, 0);

    let job = store.get_job("j1").await.unwrap();
    assert_eq!(job.status, "PROCESSING");
    assert!(job.process_ended_at.is_none());
}

#[tokio::test]
async fn missing_audio_duration_falls_back_to_fixed_timeout() {
    let dir = TempDir::new().unwrap();
    let (pool, store) = test_store(&dir).await;

    seed_processing(&pool, "j1", Some(30), None).await;

    let reaped = reaper(store.clone()).sweep().await.unwrap();
    assert_eq!(reaped, 1);
    assert_eq!(store.get_job("j1").await.unwrap().status, "FAILED");
}

#[tokio::test]
async fn sweep_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (pool, store) = test_store(&dir).await;

    seed_processing(&pool, "j1", Some(30), Some(1000)).await;

    let reaper = reaper(store.clone());
    assert_eq!(reaper.sweep().await.unwrap(), 1);

    let first = store.get_job("j1").await.unwrap();

    // A second sweep finds nothing in PROCESSING and writes nothing.
    assert_eq!(reaper.sweep().await.unwrap(), 0);

    let second = store.get_job("j1").await.unwrap();
    assert_eq!(second.status, "FAILED");
    assert_eq!(second.process_ended_at, first.process_ended_at);
    assert_eq!(second.updated_at, first.updated_at);
}

#[tokio::test]
async fn only_expired_jobs_are_reaped() {
    let dir = TempDir::new().unwrap();
    let (pool, store) = test_store(&dir).await;

    seed_processing(&pool, "stale-1", Some(60), Some(1000)).await;
    seed_processing(&pool, "stale-2", Some(45), None).await;
    seed_processing(&pool, "fresh", Some(2), Some(1000)).await;

    let reaped = reaper(store.clone()).sweep().await.unwrap();
    assert_eq!(reaped, 2);

    assert_eq!(store.get_job("stale-1").await.unwrap().status, "FAILED");
    assert_eq!(store.get_job("stale-2").await.unwrap().status, "FAILED");
    assert_eq!(store.get_job("fresh").await.unwrap().status, "PROCESSING");
}
