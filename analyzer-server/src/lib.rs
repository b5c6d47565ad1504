//! HTTP ingestion boundary: accepts analytics events and hands them to the
//! queue without waiting for the broker.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use analyzer_config::HttpReceiverConfig;
use analyzer_models::{errors::SendableError, Event, EventType};
use analyzer_queue::{Queue, QueueExt};
use analyzer_utilities::Logger;
use axum::{
    body::Bytes,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Body of `POST <path>`.
#[derive(Debug, Deserialize)]
pub struct EventRequest {
    /// Falls back to `User` when `user_id` is present, `None` otherwise.
    #[serde(rename = "type", default)]
    pub event_type: Option<EventType>,
    pub identifier: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

impl EventRequest {
    pub fn into_event(self) -> Result<Event, serde_json::Error> {
        let event_type = self.event_type.unwrap_or(if self.user_id.is_some() {
            EventType::USER
        } else {
            EventType::NONE
        });
        let data = match self.data {
            Some(data) => data,
            None => RawValue::from_string("null".to_string())?,
        };
        Ok(Event::new(event_type, self.identifier, self.user_id, data))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub id: Uuid,
}

#[derive(Clone)]
struct ReceiverState {
    queue: Arc<dyn Queue>,
    log: Logger,
}

async fn receive_event(Extension(state): Extension<ReceiverState>, body: Bytes) -> Response {
    let request: EventRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            info!(target: state.log.target(), "bad request: {}", err);
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };
    if request.identifier.trim().is_empty() {
        info!(target: state.log.target(), "bad request: empty identifier");
        return (StatusCode::BAD_REQUEST, "identifier is required").into_response();
    }
    let event = match request.into_event() {
        Ok(event) => event,
        Err(err) => {
            error!(target: state.log.target(), "build event: {}", err);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let id = event.id();
    debug!(target: state.log.target(), "receive event id={} identifier={}", id, event.identifier());
    tokio::spawn(async move {
        match state.queue.enqueue(&event).await {
            Ok(()) => debug!(target: state.log.target(), "enqueued event id={}", id),
            Err(err) => error!(target: state.log.target(), "enqueue event id={}: {}", id, err),
        }
    });

    (StatusCode::ACCEPTED, Json(Accepted { id })).into_response()
}

async fn health() -> StatusCode {
    StatusCode::OK
}

pub fn router(config: &HttpReceiverConfig, queue: Arc<dyn Queue>, log: &Logger) -> Router {
    let state = ReceiverState {
        queue,
        log: log.named("request"),
    };
    Router::new()
        .route(&config.path, post(receive_event))
        .route("/health", get(health))
        .layer(Extension(state))
}

/// Serves the HTTP receiver until `shutdown` fires, then drains in-flight
/// requests for at most `shutdown_timeout_sec`.
pub async fn run_http_receiver(
    config: &HttpReceiverConfig,
    queue: Arc<dyn Queue>,
    log: &Logger,
    shutdown: CancellationToken,
) -> Result<(), SendableError> {
    let log = log.named("http");
    if !config.enable {
        info!(target: log.target(), "http receiver disabled");
        shutdown.cancelled().await;
        return Ok(());
    }

    let addr: SocketAddr = config.address().parse()?;
    let app = router(config, queue, &log);
    let graceful = {
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    };
    let server = axum::Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(graceful);
    info!(target: log.target(), "listening on {} (POST {})", addr, config.path);

    tokio::pin!(server);
    tokio::select! {
        result = &mut server => result?,
        _ = shutdown.cancelled() => {
            debug!(target: log.target(), "start shutdown...");
            let drain = Duration::from_secs(config.shutdown_timeout_sec);
            match tokio::time::timeout(drain, &mut server).await {
                Ok(result) => result?,
                Err(_) => warn!(target: log.target(), "graceful shutdown timed out after {:?}", drain),
            }
        }
    }
    info!(target: log.target(), "graceful shutdown complete");
    Ok(())
}
