//! HTTP handlers for chat and session management.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use parley_core::ids::{OwnerId, SessionId};
use parley_store::store::DEFAULT_PAGE_SIZE;

use crate::error::{ApiError, ChatError};
use crate::orchestrator::{ChatReply, TurnRequest};
use crate::relay::StreamRelay;
use crate::server::AppState;

/// The identity a request acts as.
///
/// There is no authentication yet: every request is attributed to the
/// configured default owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller(pub OwnerId);

impl Caller {
    pub fn owner(self) -> OwnerId {
        self.0
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(_parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(Caller(state.default_owner))
    }
}

/// Body of `POST /chat` and `POST /chat/stream`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "session_id")]
    pub session_id: Option<SessionId>,
    #[serde(default, alias = "topic_id", alias = "doc_type_id", alias = "docTypeId")]
    pub topic_id: Option<String>,
}

impl ChatRequestBody {
    fn into_turn(self, caller: Caller) -> TurnRequest {
        TurnRequest {
            owner: caller.owner(),
            message: self.message.unwrap_or_default(),
            session_id: self.session_id,
            topic: self.topic_id,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<u32>,
    pub size: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "topic_id", alias = "doc_type_id", alias = "docTypeId")]
    pub topic_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateSessionBody {
    #[serde(default)]
    pub title: Option<String>,
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

// ── Chat ──

pub async fn chat(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<ChatRequestBody>, JsonRejection>,
) -> Result<Json<ChatReply>, ChatError> {
    let request = parse_body(body)
        .map_err(|e| ChatError::Validation(e.message))?
        .into_turn(caller);
    state.orchestrator.handle(request).await.map(Json)
}

pub async fn chat_stream(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<ChatRequestBody>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ChatError> {
    let accepted_at = tokio::time::Instant::now();
    let request = parse_body(body)
        .map_err(|e| ChatError::Validation(e.message))?
        .into_turn(caller);

    let relay = StreamRelay::prepare(
        state.store.clone(),
        Arc::clone(&state.client),
        &request,
        accepted_at,
        state.stream_timeout,
    )?;
    debug!(session_id = %relay.session_id(), "streaming relay accepted");

    let (tx, rx) = mpsc::channel(state.stream_channel_capacity.max(1));
    tokio::spawn(relay.run(tx));

    let events = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(event.into_sse()));
    Ok(Sse::new(events))
}

// ── Sessions ──

pub async fn list_sessions(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let page = state.store.list(
        caller.owner(),
        params.page.unwrap_or(0),
        params.size.unwrap_or(DEFAULT_PAGE_SIZE),
    )?;
    Ok(Json(page))
}

pub async fn create_session(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<CreateSessionBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let body = parse_body(body)?;
    let session = state
        .store
        .create(caller.owner(), body.title.as_deref(), body.topic_id.as_deref())?;
    Ok(Json(session))
}

pub async fn get_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<SessionId>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .get_with_messages(id, caller.owner())?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("session"))
}

pub async fn update_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<SessionId>,
    body: Result<Json<UpdateSessionBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let body = parse_body(body)?;
    state
        .store
        .update_title(id, caller.owner(), body.title.as_deref().unwrap_or_default())?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("session"))
}

pub async fn delete_session(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete(id, caller.owner())? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("session"))
    }
}

// ── Health ──

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state
        .store
        .database()
        .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
        .is_ok();

    if db_ok {
        (StatusCode::OK, Json(json!({ "status": "healthy", "model": state.client.model() })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "model": state.client.model() })),
        )
    }
}
