//! HTTP/WS surface for the A2A gateway.
//!
//! `POST /a2a` carries one JSON-RPC request per call; `GET /a2a/ws`
//! upgrades to a WebSocket carrying one JSON-RPC frame per message. Both
//! authenticate via bearer JWT and share the per-caller rate limiter.
//! Rate-limit exhaustion is HTTP 429 with a `retry_after` hint, or the
//! JSON-RPC equivalent on the socket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

use crate::a2a::auth::JwtAuthenticator;
use crate::a2a::rate_limit::{CallerRateLimiter, RateLimitDecision};
use crate::a2a::rpc::{A2aGateway, RpcRequest, RpcResponse};
use crate::error::EngineError;

#[derive(Clone)]
pub struct A2aServerState {
    pub gateway: Arc<A2aGateway>,
    pub auth: Arc<JwtAuthenticator>,
    pub limiter: Arc<CallerRateLimiter>,
}

pub fn a2a_router(state: A2aServerState) -> Router {
    Router::new()
        .route("/a2a", post(handle_rpc))
        .route("/a2a/ws", get(handle_ws_upgrade))
        .with_state(state)
}

fn authenticate(
    state: &A2aServerState,
    auth: Option<&TypedHeader<Authorization<Bearer>>>,
) -> Result<i64, EngineError> {
    let token = auth
        .map(|TypedHeader(bearer)| bearer.token())
        .ok_or_else(|| EngineError::Unauthorized("missing bearer token".to_string()))?;
    state.auth.verify(token)
}

async fn handle_rpc(
    State(state): State<A2aServerState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    body: String,
) -> Response {
    let caller_id = match authenticate(&state, auth.as_ref()) {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(RpcResponse::failure(None, &e)),
            )
                .into_response()
        }
    };

    if let RateLimitDecision::Exceeded { retry_after } = state.limiter.check(caller_id) {
        let secs = retry_after.as_secs().max(1);
        warn!(caller_id, retry_after_secs = secs, "a2a rate limit exceeded");
        let error = EngineError::RateLimited {
            retry_after_secs: secs,
        };
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, secs.to_string())],
            Json(RpcResponse::failure(None, &error)),
        )
            .into_response();
    }

    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(r) => r,
        Err(e) => {
            return Json(RpcResponse::invalid_request(
                None,
                &format!("malformed request: {e}"),
            ))
            .into_response()
        }
    };
    if !request.jsonrpc.is_empty() && request.jsonrpc != "2.0" {
        return Json(RpcResponse::invalid_request(
            request.id.clone(),
            "jsonrpc must be \"2.0\"",
        ))
        .into_response();
    }

    debug!(caller_id, method = %request.method, "a2a request");
    Json(state.gateway.dispatch(caller_id, &request).await).into_response()
}

async fn handle_ws_upgrade(
    State(state): State<A2aServerState>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    ws: WebSocketUpgrade,
) -> Response {
    let caller_id = match authenticate(&state, auth.as_ref()) {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(RpcResponse::failure(None, &e)),
            )
                .into_response()
        }
    };
    ws.on_upgrade(move |socket| handle_ws(state, socket, caller_id))
}

async fn handle_ws(state: A2aServerState, socket: WebSocket, caller_id: i64) {
    let (mut sink, mut stream) = socket.split();

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let response = match state.limiter.check(caller_id) {
            RateLimitDecision::Exceeded { retry_after } => {
                let error = EngineError::RateLimited {
                    retry_after_secs: retry_after.as_secs().max(1),
                };
                let mut resp = RpcResponse::failure(None, &error);
                if let Some(obj) = resp.error.as_mut() {
                    obj.data = json!({
                        "code": "rate_limited",
                        "retry_after": retry_after.as_secs().max(1),
                    });
                }
                resp
            }
            RateLimitDecision::Allowed { .. } => match serde_json::from_str::<RpcRequest>(&text)
            {
                Ok(request) => state.gateway.dispatch(caller_id, &request).await,
                Err(e) => RpcResponse::invalid_request(None, &format!("malformed request: {e}")),
            },
        };

        let payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(e) => {
                warn!(caller_id, error = %e, "a2a ws serialization failed");
                continue;
            }
        };
        if sink.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }
    debug!(caller_id, "a2a ws session closed");
}

/// Background task keeping the limiter map from growing unbounded.
pub async fn run_limiter_cleanup(limiter: Arc<CallerRateLimiter>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        limiter.cleanup();
    }
}
