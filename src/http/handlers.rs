//! Axum HTTP handlers for the web server

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{CORRELATION_HEADER, SESSION_HEADER};
use crate::errors::AppError;
use crate::mcp::dispatcher::Inbound;
use crate::mcp::rpc::{json_rpc_error, ErrorCode};
use crate::AppState;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub mcp_endpoint: &'static str,
    pub sse_endpoint: &'static str,
    pub session_header: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseQuery {
    pub session_id: Option<String>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        mcp_endpoint: "/mcp",
        sse_endpoint: "/mcp/sse",
        session_header: "Mcp-Session-Id",
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Accepts a session id only if the store knows it, and renews it.
async fn resolve_session(state: &AppState, session_id: &str) -> Result<String, AppError> {
    if !state.sessions.is_valid_session(session_id).await? {
        return Err(AppError::not_found(
            "session_not_found",
            "unknown or expired session",
        ));
    }
    state.sessions.touch_session(session_id).await?;
    Ok(session_id.to_string())
}

fn is_initialize(message: &Value) -> bool {
    message.get("method").and_then(Value::as_str) == Some("initialize")
}

pub async fn mcp_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return Ok((
                StatusCode::OK,
                Json(json_rpc_error(None, ErrorCode::ParseError).to_value()),
            )
                .into_response())
        }
    };

    let (batch, messages) = match payload {
        Value::Array(items) => (true, items),
        single => (false, vec![single]),
    };
    if batch && messages.is_empty() {
        return Ok((
            StatusCode::OK,
            Json(vec![json_rpc_error(None, ErrorCode::InvalidRequest).to_value()]),
        )
            .into_response());
    }

    let mut created_session = None;
    let session_id = match header_str(&headers, SESSION_HEADER) {
        Some(session_id) => Some(resolve_session(&state, session_id).await?),
        None if messages.iter().any(is_initialize) => {
            let session = state.sessions.create_session().await?;
            info!(session_id = %session.id, "session created");
            created_session = Some(session.id.clone());
            Some(session.id)
        }
        None => None,
    };

    let inbound = Inbound {
        session_id,
        correlation_id: header_str(&headers, CORRELATION_HEADER).map(str::to_string),
    };

    let mut responses = Vec::new();
    for message in messages {
        if let Some(response) = state.dispatcher.handle_value(&inbound, message).await {
            responses.push(response.to_value());
        }
    }

    let mut response = if responses.is_empty() {
        StatusCode::NO_CONTENT.into_response()
    } else if batch {
        (StatusCode::OK, Json(Value::Array(responses))).into_response()
    } else {
        (StatusCode::OK, Json(responses.swap_remove(0))).into_response()
    };

    if let Some(session_id) = created_session {
        let value = HeaderValue::from_str(&session_id)
            .map_err(|err| AppError::internal(err.to_string()))?;
        response.headers_mut().insert(SESSION_HEADER, value);
    }

    Ok(response)
}

pub async fn sse_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SseQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let requested = header_str(&headers, SESSION_HEADER)
        .map(str::to_string)
        .or(query.session_id)
        .ok_or_else(|| AppError::not_found("session_required", "a session id is required"))?;
    let session_id = resolve_session(&state, &requested).await?;

    let (guard, mut receiver) = state.hub.register(&session_id);
    info!(session_id = %session_id, "event stream opened");

    let stream = async_stream::stream! {
        let guard = guard;

        yield Ok(Event::default()
            .event("connected")
            .data(json!({
                "sessionId": guard.session_id(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }).to_string()));

        while let Some(message) = receiver.recv().await {
            yield Ok(Event::default().event("message").data(message.to_string()));
        }

        debug!(session_id = %guard.session_id(), "event stream closed");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE)))
}

pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let session_id = header_str(&headers, SESSION_HEADER)
        .ok_or_else(|| AppError::not_found("session_required", "a session id is required"))?;

    state.sessions.delete_session(session_id).await?;
    state.hub.disconnect(session_id);
    info!(session_id = %session_id, "session deleted");

    Ok(StatusCode::NO_CONTENT)
}
