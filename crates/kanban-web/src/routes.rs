use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use kanban_core::{AttemptEvent, AttemptId};
use kanban_inbox::{build_inbox, Inbox};
use kanban_store::AttemptRecord;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::attempts::{followup_attempt, load_attempt, start_attempt, stop_attempt};
use crate::error::WebError;
use crate::model::{
    web_event_name, AttemptEventsResponse, AttemptStatusResponse, FollowupRequest,
    StartAttemptRequest,
};
use crate::state::WebState;

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/inbox", get(inbox))
        .route("/api/attempts", post(create_attempt))
        .route("/api/attempts/{attempt_id}", get(get_attempt))
        .route("/api/attempts/{attempt_id}/followup", post(followup))
        .route("/api/attempts/{attempt_id}/stop", post(stop))
        .route("/api/attempts/{attempt_id}/events", get(attempt_events))
        .route("/api/attempts/{attempt_id}/ws", get(attempt_ws))
        .route("/api/events", get(stream_events))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn inbox(State(state): State<WebState>) -> Result<Json<Inbox>, WebError> {
    let store = state.store.as_ref();
    let inbox = build_inbox(store, store, &state.config.inbox, Utc::now()).await?;
    Ok(Json(inbox))
}

async fn create_attempt(
    State(state): State<WebState>,
    Json(request): Json<StartAttemptRequest>,
) -> Result<(StatusCode, Json<AttemptStatusResponse>), WebError> {
    let record = start_attempt(&state, request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AttemptStatusResponse {
            attempt_id: record.id,
            status: record.status,
        }),
    ))
}

async fn get_attempt(
    State(state): State<WebState>,
    Path(attempt_id): Path<String>,
) -> Result<Json<AttemptRecord>, WebError> {
    Ok(Json(load_attempt(&state, &AttemptId(attempt_id))?))
}

async fn followup(
    State(state): State<WebState>,
    Path(attempt_id): Path<String>,
    Json(request): Json<FollowupRequest>,
) -> Result<(StatusCode, Json<AttemptStatusResponse>), WebError> {
    let record = followup_attempt(&state, &AttemptId(attempt_id), request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AttemptStatusResponse {
            attempt_id: record.id,
            status: record.status,
        }),
    ))
}

async fn stop(
    State(state): State<WebState>,
    Path(attempt_id): Path<String>,
) -> Result<(StatusCode, Json<AttemptStatusResponse>), WebError> {
    let attempt_id = AttemptId(attempt_id);
    let status = stop_attempt(&state, &attempt_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AttemptStatusResponse { attempt_id, status }),
    ))
}

async fn attempt_events(
    State(state): State<WebState>,
    Path(attempt_id): Path<String>,
) -> Result<Json<AttemptEventsResponse>, WebError> {
    let attempt_id = AttemptId(attempt_id);
    load_attempt(&state, &attempt_id)?;
    let events = state.store.list_attempt_events(&attempt_id)?;
    Ok(Json(AttemptEventsResponse { attempt_id, events }))
}

async fn stream_events(
    State(state): State<WebState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.subscribe();
    let stream = BroadcastStream::new(rx).map(|message| {
        let event = match message {
            Ok(payload) => {
                let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
                SseEvent::default()
                    .event(web_event_name(&payload))
                    .data(data)
            }
            Err(_) => SseEvent::default().event("lagged").data("{}"),
        };
        Ok::<SseEvent, Infallible>(event)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    )
}

async fn attempt_ws(
    State(state): State<WebState>,
    Path(attempt_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, WebError> {
    let attempt_id = AttemptId(attempt_id);
    load_attempt(&state, &attempt_id)?;
    // Subscribe before the upgrade so nothing emitted in between is lost.
    let rx = state.subscribe();
    Ok(ws.on_upgrade(move |socket| forward_attempt_events(socket, rx, attempt_id)))
}

async fn forward_attempt_events(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<AttemptEvent>,
    attempt_id: AttemptId,
) {
    debug!(attempt_id = %attempt_id, "websocket subscriber connected");
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Ok(event) => {
                    let Some(payload) = attempt_payload(&event, &attempt_id) else {
                        continue;
                    };
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(attempt_id = %attempt_id, skipped, "websocket subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(attempt_id = %attempt_id, "websocket subscriber disconnected");
}

/// JSON text frame for `event` if it belongs to `attempt_id`.
fn attempt_payload(event: &AttemptEvent, attempt_id: &AttemptId) -> Option<String> {
    if &event.attempt_id != attempt_id {
        return None;
    }
    match serde_json::to_string(&event.event) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(attempt_id = %attempt_id, error = %err, "failed to serialize event");
            None
        }
    }
}
