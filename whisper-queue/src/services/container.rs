//! Service container for dependency injection.
//!
//! Wires the store, the batch executor, the three loops and the delivery
//! server together and manages their lifecycle.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::api::{self, AppState};
use crate::batch::{BatchConfig, CloudBatchExecutor};
use crate::config::Settings;
use crate::database::DbPool;
use crate::database::repositories::SqliteJobStore;
use crate::notification::{EmailConfig, EmailNotifier};
use crate::queue::{
    CompletionHandler, ControllerConfig, QueueController, ReaperConfig, TimeoutReaper,
};

/// Service container holding all application services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: DbPool,
    /// Application settings.
    pub settings: Settings,
    /// Job store adapter.
    pub store: Arc<SqliteJobStore>,
    /// Queue controller.
    pub controller: Arc<QueueController<SqliteJobStore, CloudBatchExecutor>>,
    /// Timeout reaper.
    pub reaper: Arc<TimeoutReaper<SqliteJobStore>>,
    /// Completion handler.
    pub handler: Arc<CompletionHandler<SqliteJobStore, CloudBatchExecutor>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
    /// Background loop handles.
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Create a new service container with the given pool and settings.
    pub async fn new(pool: DbPool, settings: Settings) -> Result<Self> {
        info!("Initializing service container");

        let store = Arc::new(SqliteJobStore::new(pool.clone(), &settings.jobs_collection)?);
        store.ensure_collection().await?;

        let executor = Arc::new(CloudBatchExecutor::new(BatchConfig::from_settings(&settings)));
        let notifier = Arc::new(EmailNotifier::new(EmailConfig::from_settings(&settings)));

        let cancellation_token = CancellationToken::new();

        let controller = Arc::new(QueueController::new(
            store.clone(),
            executor,
            ControllerConfig::from_settings(&settings),
            cancellation_token.child_token(),
        ));

        let reaper = Arc::new(TimeoutReaper::new(
            store.clone(),
            ReaperConfig::from_settings(&settings),
            cancellation_token.child_token(),
        ));

        let handler = Arc::new(CompletionHandler::new(
            store.clone(),
            controller.clone(),
            notifier,
        ));

        Ok(Self {
            pool,
            settings,
            store,
            controller,
            reaper,
            handler,
            cancellation_token,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Token that cancels every loop this container started.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Start the controller and reaper loops plus the delivery server.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();

        let controller = self.controller.clone();
        tasks.push(tokio::spawn(async move { controller.run().await }));

        let reaper = self.reaper.clone();
        tasks.push(tokio::spawn(async move { reaper.run().await }));

        let state = AppState {
            handler: self.handler.clone(),
        };
        let bind_addr = self.settings.bind_addr.clone();
        let token = self.cancellation_token.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = api::serve(&bind_addr, state, token).await {
                error!("Event delivery server error: {}", e);
            }
        }));

        // Pick up work that queued while the service was down.
        self.controller.wake();

        Ok(())
    }

    /// Graceful shutdown: cancel every loop and wait for it to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancellation_token.cancel();

        let tasks = {
            let mut guard = self.tasks.lock();
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            let _ = task.await;
        }

        self.pool.close().await;
        Ok(())
    }
}
