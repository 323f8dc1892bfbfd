//! Event delivery endpoint.
//!
//! The pub/sub transport pushes each inbound event to `POST /events`. A 2xx
//! acknowledges the delivery; a 5xx makes the transport redeliver. Malformed
//! envelopes are acknowledged anyway; redelivery cannot fix them.

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::Result;
use crate::batch::BatchExecutor;
use crate::database::repositories::JobStore;
use crate::events::decode_delivery;
use crate::queue::CompletionHandler;

/// Shared state for the delivery routes.
pub struct AppState<S, B> {
    pub handler: Arc<CompletionHandler<S, B>>,
}

impl<S, B> Clone for AppState<S, B> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

/// Build the delivery router.
pub fn router<S, B>(state: AppState<S, B>) -> Router
where
    S: JobStore + 'static,
    B: BatchExecutor + 'static,
{
    Router::new()
        .route("/healthz", get(healthz))
        .route("/events", post(deliver_event::<S, B>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn deliver_event<S, B>(State(state): State<AppState<S, B>>, body: Bytes) -> StatusCode
where
    S: JobStore + 'static,
    B: BatchExecutor + 'static,
{
    let envelope = match decode_delivery(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping undecodable delivery: {}", e);
            return StatusCode::NO_CONTENT;
        }
    };

    match state.handler.handle(&envelope).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            error!(
                job_id = %envelope.job_id,
                "Event handling failed, requesting redelivery: {}", e
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Bind and serve the delivery router until the token is cancelled.
pub async fn serve<S, B>(
    bind_addr: &str,
    state: AppState<S, B>,
    cancellation_token: CancellationToken,
) -> Result<()>
where
    S: JobStore + 'static,
    B: BatchExecutor + 'static,
{
    let listener = TcpListener::bind(bind_addr).await?;
    info!("Event delivery server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            cancellation_token.cancelled().await;
        })
        .await?;

    Ok(())
}
