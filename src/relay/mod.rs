//! Relay module.
//!
//! Handles client requests in the four supported API shapes and forwards
//! them to upstream channels.
//!
//! ## Architecture
//!
//! ```text
//! Request -> Middleware -> Candidate Builder -> Dispatcher -> Upstream
//!               |                 |                 |
//!               v                 v                 v
//!          RelayRequest     (channel, key)    Dialect adapter,
//!          (auth, model,    attempt tuples    streaming tap,
//!           client ip)                        metrics
//! ```
//!
//! ## API Endpoints
//!
//! - `POST /v1/messages` - Anthropic Messages shape
//! - `POST /v1/chat/completions` - OpenAI chat-completions shape
//! - `POST /v1beta/models/{model}:{action}` - Gemini shape
//! - `POST /responses` - Codex/Responses shape
//! - `GET /v1/models` - models visible to the calling token

pub mod candidates;
pub mod client;
pub mod context;
pub mod dialects;
pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod model_match;

use axum::{
    extract::{ConnectInfo, Path},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::SocketAddr;

pub use context::{ClientDialect, RelayRequest};
pub use error::{RelayError, RelayResult};

/// Anthropic messages endpoint
///
/// Route: POST /v1/messages
pub async fn anthropic_messages(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    shaped_dispatch(ClientDialect::Anthropic, headers, payload, peer).await
}

/// OpenAI chat completions endpoint
///
/// Route: POST /v1/chat/completions
pub async fn chat_completions(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    shaped_dispatch(ClientDialect::OpenAi, headers, payload, peer).await
}

/// Codex responses endpoint
///
/// Route: POST /responses
pub async fn codex_responses(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    shaped_dispatch(ClientDialect::Codex, headers, payload, peer).await
}

async fn shaped_dispatch(
    dialect: ClientDialect,
    headers: HeaderMap,
    payload: Value,
    peer: SocketAddr,
) -> Response {
    let model = match middleware::extract_model_id(&payload) {
        Ok(model) => model,
        Err(e) => return e.into_response(),
    };
    let streaming = middleware::is_streaming_request(&payload);
    let request = match middleware::build_relay_request(
        dialect,
        &headers,
        payload,
        Some(peer),
        model,
        streaming,
    ) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    dispatcher::dispatch(request).await
}

/// Gemini generate endpoint
///
/// Route: POST /v1beta/models/{model}:{generateContent|streamGenerateContent}
///
/// The model and action ride in the path; `streamGenerateContent` forces
/// streaming regardless of the body.
pub async fn gemini_generate(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return RelayError::BadRequest(format!(
            "Expected '{{model}}:{{action}}', got '{}'",
            model_action
        ))
        .into_response();
    };
    if !matches!(action, "generateContent" | "streamGenerateContent") {
        return RelayError::BadRequest(format!("Unsupported action '{}'", action)).into_response();
    }
    let streaming =
        action == "streamGenerateContent" || middleware::is_streaming_request(&payload);

    let request = match middleware::build_relay_request(
        ClientDialect::Gemini,
        &headers,
        payload,
        Some(peer),
        model.to_string(),
        streaming,
    ) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    dispatcher::dispatch(request).await
}

/// List models visible to the calling token (OpenAI list format).
///
/// Route: GET /v1/models
pub async fn list_models(headers: HeaderMap) -> Response {
    let token = match middleware::authenticate(&headers) {
        Ok(token) => token,
        Err(e) => return e.into_response(),
    };

    let allowed: Option<Vec<i64>> = if token.all_channels {
        None
    } else {
        match crate::store::tokens::token_channel_ids(token.id) {
            Ok(ids) => Some(ids),
            Err(e) => return RelayError::Internal(e.to_string()).into_response(),
        }
    };

    let snapshot = crate::cache::snapshot();
    let mut models = BTreeSet::new();
    for ch in snapshot.enumerate_enabled() {
        if let Some(allowed) = &allowed {
            if !allowed.contains(&ch.channel.id) {
                continue;
            }
        }
        for model in &ch.channel.models {
            models.insert(model.clone());
        }
    }

    let data: Vec<Value> = models
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": "llmrelay",
                "permission": []
            })
        })
        .collect();

    Json(serde_json::json!({"object": "list", "data": data})).into_response()
}
