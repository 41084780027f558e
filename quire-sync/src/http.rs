//! Pull/push HTTP fallback for clients that cannot hold a WebSocket.
//!
//! - `GET /documents/{id}/sync?sv=<base64>` → raw delta bytes
//! - `POST /documents/{id}/sync` `{"update": "<base64>"}` → `{"ok": true, "seq": "<n>"}`
//! - `GET /health` → `ok`
//!
//! Pushed deltas are relayed to the document's WebSocket room.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::warn;
use quire_core::{DocumentId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::server::USER_HEADER;

#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<SyncEngine>,
    pub rooms: Arc<RoomManager>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/documents/{id}/sync", get(pull).post(push))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    sv: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushBody {
    update: String,
}

#[derive(Debug, Serialize)]
struct PushResponse {
    ok: bool,
    /// Decimal string; sequence numbers exceed what JSON numbers carry exactly.
    seq: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self {
            status: StatusCode::from_u16(e.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

fn user_from(headers: &HeaderMap) -> UserId {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(UserId::new)
        .unwrap_or_else(UserId::anonymous)
}

/// Query decoding turns an unescaped `+` into a space; undo that.
fn decode_base64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(value.trim().replace(' ', "+"))
}

async fn health() -> &'static str {
    "ok"
}

async fn pull(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Query(query): Query<PullQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let document_id = DocumentId::new(id);
    let state_vector = query
        .sv
        .as_deref()
        .filter(|sv| !sv.is_empty())
        .map(decode_base64)
        .transpose()
        .map_err(|e| ApiError::bad_request(format!("invalid state vector encoding: {e}")))?;

    let delta = state
        .engine
        .authorized_diff(&user_from(&headers), &document_id, state_vector.as_deref())
        .await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], delta).into_response())
}

async fn push(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PushBody>,
) -> Result<Json<PushResponse>, ApiError> {
    let document_id = DocumentId::new(id);
    let delta = decode_base64(&body.update)
        .map_err(|e| ApiError::bad_request(format!("invalid update encoding: {e}")))?;

    let applied = state
        .engine
        .authorized_apply(&user_from(&headers), &document_id, &delta)
        .await?;
    if let Err(e) = state
        .rooms
        .relay_update(Uuid::nil(), &document_id, applied.seq, delta)
        .await
    {
        warn!("Could not relay HTTP update {} of {}: {}", applied.seq, document_id, e);
    }

    Ok(Json(PushResponse {
        ok: true,
        seq: applied.seq.to_string(),
    }))
}
