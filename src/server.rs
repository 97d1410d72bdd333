//! HTTP listener: relay routes plus the minimal admin surface.

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

use crate::error::AppResult;
use crate::store::channels::ChannelInput;
use crate::store::tokens::TokenInput;
use crate::{config, logger, relay, store};

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

// ============================================================================
// Admin: channels
// ============================================================================

async fn list_channels() -> impl IntoResponse {
    match store::channels::list_channels() {
        Ok(channels) => Json(channels).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn create_channel(Json(input): Json<ChannelInput>) -> impl IntoResponse {
    match store::channels::create_channel(&input) {
        Ok(id) => (StatusCode::CREATED, Json(json!({"id": id}))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_channel(Path(id): Path<i64>) -> impl IntoResponse {
    match store::channels::get_channel(id) {
        Ok(channel) => Json(channel).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn update_channel(Path(id): Path<i64>, Json(input): Json<ChannelInput>) -> impl IntoResponse {
    match store::channels::update_channel(id, &input) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_channel(Path(id): Path<i64>) -> impl IntoResponse {
    match store::channels::delete_channel(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn channel_endpoints(Path(id): Path<i64>) -> impl IntoResponse {
    match store::channels::list_endpoints(id) {
        Ok(endpoints) => Json(endpoints).into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// Admin: tokens
// ============================================================================

async fn list_tokens() -> impl IntoResponse {
    match store::tokens::list_tokens() {
        Ok(tokens) => Json(tokens).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn create_token(Json(input): Json<TokenInput>) -> impl IntoResponse {
    match store::tokens::create_token(&input) {
        Ok(id) => (StatusCode::CREATED, Json(json!({"id": id}))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_token(Path(id): Path<i64>) -> impl IntoResponse {
    match store::tokens::delete_token(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

// ============================================================================
// Admin: settings & observability
// ============================================================================

async fn get_settings() -> Json<config::Settings> {
    Json(config::settings())
}

async fn put_settings(Json(pairs): Json<HashMap<String, String>>) -> impl IntoResponse {
    match store::put_settings(&pairs) {
        Ok(()) => Json(config::settings()).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct SummaryQ {
    days: Option<i64>,
}

async fn stats_summary(Query(q): Query<SummaryQ>) -> impl IntoResponse {
    let days = q.days.unwrap_or(1);
    match store::stats::summary_since(days) {
        Ok((requests, tokens, cost)) => Json(json!({
            "days": days,
            "requests": requests,
            "tokens": tokens,
            "cost_usd": cost
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct DailyQ {
    date: Option<String>,
}

async fn stats_daily(Query(q): Query<DailyQ>) -> impl IntoResponse {
    let date = q.date.unwrap_or_else(|| crate::clock::local_date_days_ago(1));
    match store::stats::list_daily_stats(&date) {
        Ok(rows) => Json(json!({"date": date, "stats": rows})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct LogsQ {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn recent_logs(Query(q): Query<LogsQ>) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(50);
    let offset = q.offset.unwrap_or(0);
    match store::stats::recent_logs(limit, offset) {
        Ok(logs) => Json(json!({"logs": logs, "limit": limit, "offset": offset})).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn system_logs(Query(q): Query<logger::LogQuery>) -> Json<Vec<logger::LogEntry>> {
    Json(logger::query_logs(&q))
}

// ============================================================================
// Router & serve
// ============================================================================

pub fn router() -> Router {
    Router::new()
        // Relay surface.
        .route("/v1/messages", post(relay::anthropic_messages))
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/responses", post(relay::codex_responses))
        .route("/v1beta/models/:model_action", post(relay::gemini_generate))
        .route("/v1/models", get(relay::list_models))
        .route("/healthz", get(health))
        // Admin surface.
        .route("/admin/channels", get(list_channels).post(create_channel))
        .route(
            "/admin/channels/:id",
            get(get_channel).put(update_channel).delete(delete_channel),
        )
        .route("/admin/channels/:id/endpoints", get(channel_endpoints))
        .route("/admin/tokens", get(list_tokens).post(create_token))
        .route("/admin/tokens/:id", delete(delete_token))
        .route("/admin/settings", get(get_settings).put(put_settings))
        .route("/admin/stats/summary", get(stats_summary))
        .route("/admin/stats/daily", get(stats_daily))
        .route("/admin/logs", get(recent_logs))
        .route("/admin/system-logs", get(system_logs))
        .layer(CorsLayer::permissive())
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    bind_addr: &str,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    logger::info("server", &format!("Listening on {}", bind_addr));

    axum::serve(
        listener,
        router().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;
    Ok(())
}
