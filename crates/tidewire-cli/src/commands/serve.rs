//! HTTP surface of the stream store.
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /streams` | Open a stream driven by a scripted producer |
//! | `GET /streams/{id}/events` | Wire stream, resuming after `Last-Event-ID` / `?last_event_id=` |
//! | `GET /stats` | Store occupancy |

use std::process::ExitCode;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tidewire_core::wire::{self, LAST_EVENT_ID_HEADER};
use tidewire_core::{
    encode_event, resolve_last_event_id, Emitter, EmitterConfig, EmitterSummary, EventCursor,
    Producer, ProducerError, RetentionConfig, ScriptedProducer, StoreError, StreamId, StreamStore,
    Usage, ValidationError,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::cli::ServeArgs;
use crate::error::CliError;

#[derive(Debug, Clone)]
pub struct AppState {
    store: StreamStore,
    emitter: EmitterConfig,
    fragments: u64,
    fragment_interval: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct OpenStreamRequest {
    stream_id: Option<String>,
    fragments: Option<u64>,
    /// Make the producer fail before this fragment index.
    fail_at: Option<usize>,
}

#[derive(Debug, Serialize)]
struct OpenStreamResponse {
    stream_id: StreamId,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    last_event_id: Option<String>,
}

/// Request failures rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
enum ApiError {
    Validation(ValidationError),
    Store(StoreError),
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error)
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::RetentionExceeded { .. }) => StatusCode::GONE,
            Self::Store(StoreError::AlreadyExists(_) | StoreError::Closed(_)) => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message) = match &self {
            Self::Validation(error) => ("request.invalid", error.to_string()),
            Self::Store(error @ StoreError::AlreadyExists(_)) => ("stream.exists", error.to_string()),
            Self::Store(error) => {
                let code = error.failure_code();
                (code.as_str(), code.public_message().to_owned())
            }
        };
        let body = serde_json::json!({ "error": { "code": code, "message": message } });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/streams", post(open_stream))
        .route("/streams/:stream_id/events", get(stream_events))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn run(args: &ServeArgs) -> Result<ExitCode, CliError> {
    let retention = RetentionConfig::default()
        .with_max_events(args.max_events)
        .with_terminal_ttl(Duration::from_secs(args.terminal_ttl_secs));
    retention.validate()?;
    let mut emitter = EmitterConfig::default().with_liveness_interval(Duration::from_millis(args.liveness_ms));
    if let Some(retry_ms) = args.retry_ms {
        emitter = emitter.with_retry_hint(Duration::from_millis(retry_ms));
    }
    emitter.validate()?;

    let store = StreamStore::new(retention);
    let sweeper = store.spawn_sweeper();
    let state = AppState {
        store,
        emitter,
        fragments: args.fragments,
        fragment_interval: Duration::from_millis(args.fragment_interval_ms),
    };

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    tracing::info!(addr = %args.addr, "serving streams");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    sweeper.abort();
    Ok(ExitCode::SUCCESS)
}

async fn open_stream(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<OpenStreamResponse>), ApiError> {
    let request: OpenStreamRequest = if body.is_empty() {
        OpenStreamRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|error| {
            ApiError::Validation(ValidationError::InvalidRequestBody {
                message: error.to_string(),
            })
        })?
    };

    let stream_id = match request.stream_id.as_deref() {
        Some(raw) => StreamId::parse(raw)?,
        None => StreamId::generate(),
    };
    let fragments = request.fragments.unwrap_or(state.fragments);
    let mut producer = ScriptedProducer::numbered(fragments, Usage::new(16, fragments, 0.0));
    if !state.fragment_interval.is_zero() {
        producer = producer.with_pace(state.fragment_interval);
    }
    if let Some(index) = request.fail_at {
        producer = producer.failing_at(
            index,
            ProducerError::new(format!("scripted failure before fragment {index}")),
        );
    }

    let writer = state.store.open(stream_id.clone())?;
    tokio::spawn(drive_emitter(Emitter::new(writer, state.emitter), producer));
    tracing::info!(stream_id = %stream_id, fragments, "stream opened");

    Ok((StatusCode::CREATED, Json(OpenStreamResponse { stream_id })))
}

/// Run a detached emitter and log how it ended.
async fn drive_emitter<P>(emitter: Emitter, mut producer: P) -> Option<EmitterSummary>
where
    P: Producer + 'static,
{
    let stream_id = emitter.stream_id().clone();
    match emitter.run(&mut producer).await {
        Ok(summary) => {
            tracing::info!(
                stream_id = %stream_id,
                terminal_event_id = summary.terminal_event_id,
                fragments = summary.counters.fragments,
                "emitter finished"
            );
            Some(summary)
        }
        Err(error) => {
            tracing::warn!(stream_id = %stream_id, error = %error, "emitter stopped early");
            None
        }
    }
}

async fn stream_events(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let stream_id = StreamId::parse(&raw_id)?;
    let header_value = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok());
    let last_event_id = resolve_last_event_id(header_value, query.last_event_id.as_deref())?;
    let cursor = state.store.cursor(&stream_id, last_event_id)?;
    tracing::info!(stream_id = %stream_id, last_event_id = ?last_event_id, "client attached");

    let (sender, receiver) = mpsc::channel(64);
    tokio::spawn(forward(cursor, state.emitter.retry_hint, sender));

    let body = Body::from_stream(ReceiverStream::new(receiver));
    Ok((
        [
            (header::CONTENT_TYPE, wire::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.stats())
}

/// Pump cursor events onto the response body until the terminal event, a
/// store error, or the client going away.
async fn forward(
    mut cursor: EventCursor,
    retry_hint: Option<Duration>,
    sender: mpsc::Sender<Result<String, std::io::Error>>,
) {
    let mut first = true;
    loop {
        let next = tokio::select! {
            () = sender.closed() => {
                tracing::debug!(stream_id = %cursor.stream_id(), "client detached");
                return;
            }
            next = cursor.next() => next,
        };

        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(stream_id = %cursor.stream_id(), error = %error, "stream ended for reader");
                return;
            }
        };

        let hint = if first { retry_hint } else { None };
        first = false;
        let block = match encode_event(&event, hint) {
            Ok(block) => block,
            Err(error) => {
                tracing::error!(stream_id = %cursor.stream_id(), event_id = event.event_id, error = %error, "event encoding failed");
                return;
            }
        };
        if sender.send(Ok(block)).await.is_err() {
            return;
        }
    }
}
