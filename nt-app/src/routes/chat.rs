use crate::events::AgentEvent;
use crate::outcome::TurnResult;
use crate::routes::ApiError;
use crate::server::AgentState;
use axum::extract::Query;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Extension, Json};
use futures_util::stream::{self, Stream, StreamExt};
use nt_llm::{ChatMessage, Role};
use nt_tasks::BackendIdentity;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

const USER_ID_HEADER: &str = "x-user-id";
const DEVICE_ID_HEADER: &str = "x-device-id";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamQuery {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/agent/chat", post(post_chat))
        .route("/agent/chat/stream", get(stream_chat))
}

#[tracing::instrument(level = "info", skip_all)]
async fn post_chat(
    Extension(state): Extension<Arc<AgentState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Json<TurnResult>, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }
    // System lines in the planner context are reserved for the server.
    if req.messages.iter().any(|m| m.role == Role::System) {
        return Err(ApiError::bad_request("message role must be user or assistant"));
    }
    let identity = resolve_identity(&headers, req.user_id.as_deref(), req.device_id.as_deref())?;
    let backend = state.backend.for_identity(identity);
    let turn = state
        .agent
        .run_turn(backend.as_ref(), present(req.session_id.as_deref()), req.messages)
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "chat turn failed");
            ApiError::internal(error.to_string())
        })?;
    Ok(Json(turn))
}

#[tracing::instrument(level = "info", skip_all)]
async fn stream_chat(
    Extension(state): Extension<Arc<AgentState>>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Some(message) = present(query.message.as_deref()).map(str::to_string) else {
        return Err(ApiError::bad_request("message must not be empty"));
    };
    let identity =
        resolve_identity(&headers, query.user_id.as_deref(), query.device_id.as_deref())?;
    let backend = state.backend.for_identity(identity);
    let session_id = present(query.session_id.as_deref()).map(str::to_string);
    let events = state
        .agent
        .run_turn_streaming(backend, session_id, vec![ChatMessage::user(message)]);

    let chunk_size = state.sse_chunk_size;
    let stream = UnboundedReceiverStream::new(events)
        .scan(false, |finished, event| {
            let next = if *finished {
                None
            } else {
                *finished = event.is_terminal();
                Some(event)
            };
            futures_util::future::ready(next)
        })
        .flat_map(move |event| {
            stream::iter(sse_events(event, chunk_size).into_iter().map(Ok::<Event, Infallible>))
        })
        .take_until(state.shutdown.clone().cancelled_owned());

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

/// Resolves the caller identity forwarded to the task service. Explicit ids win over
/// headers but must agree with them.
pub(crate) fn resolve_identity(
    headers: &HeaderMap,
    user_id: Option<&str>,
    device_id: Option<&str>,
) -> Result<BackendIdentity, ApiError> {
    let user_id = pick_identity("userId", user_id, header_value(headers, USER_ID_HEADER))?;
    let device_id =
        pick_identity("deviceId", device_id, header_value(headers, DEVICE_ID_HEADER))?;
    let Some(authorization) = header_value(headers, AUTHORIZATION.as_str()) else {
        return Err(ApiError::unauthorized("Authorization header is required"));
    };
    Ok(BackendIdentity {
        authorization: authorization.to_string(),
        user_id,
        device_id,
    })
}

fn pick_identity(
    field: &str,
    explicit: Option<&str>,
    header: Option<&str>,
) -> Result<String, ApiError> {
    match (present(explicit), header) {
        (Some(explicit), Some(header)) if explicit != header => Err(ApiError::bad_request(
            format!("{field} does not match the identity header"),
        )),
        (Some(value), _) | (None, Some(value)) => Ok(value.to_string()),
        (None, None) => Err(ApiError::bad_request(format!("{field} is required"))),
    }
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| present(Some(v)))
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn sse_events(event: AgentEvent, chunk_size: usize) -> Vec<Event> {
    match event {
        AgentEvent::Delta {
            session_id,
            content,
        } => chunk_text(&content, chunk_size)
            .into_iter()
            .map(|piece| {
                sse_event(&AgentEvent::Delta {
                    session_id: session_id.clone(),
                    content: piece,
                })
            })
            .collect(),
        other => vec![sse_event(&other)],
    }
}

fn sse_event(event: &AgentEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data().to_string())
}

/// Splits on character boundaries so multi-byte text is never cut mid-codepoint.
fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}
