//! Dispatcher.
//!
//! Drives candidate iteration for one client request: executes the upstream
//! call, classifies the outcome, updates cooldowns, retries until success or
//! exhaustion, and owns the streaming pass-through with its accounting tap.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cooldown;
use crate::pricing;
use crate::store::{key_excerpt, Subject, TokenStatSample};
use crate::{cache, config, metrics};

use super::candidates::CandidateBuilder;
use super::client;
use super::context::{Candidate, RelayRequest, TokenUsage};
use super::dialects::{self, DialectAdapter, StreamStats};
use super::error::{RelayError, RelayResult};

// Bounded buffer feeding the stream-decode tap; accounting turns best-effort
// when the decoder falls behind.
const TAP_BUFFER: usize = 256;

/// Dispatch one authenticated client request to completion.
pub async fn dispatch(request: RelayRequest) -> Response {
    match dispatch_inner(request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch_inner(request: RelayRequest) -> RelayResult<Response> {
    let settings = config::settings();
    let snapshot = cache::snapshot();
    let now_s = crate::clock::epoch_s();

    let allowed: Option<Vec<i64>> = if request.token.all_channels {
        None
    } else {
        let ids = crate::store::tokens::token_channel_ids(request.token.id)
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        if ids.is_empty() {
            return Err(RelayError::Forbidden(
                "Token has no channel grants".to_string(),
            ));
        }
        Some(ids)
    };

    let mut builder = CandidateBuilder::new(
        snapshot.clone(),
        &request,
        allowed.as_deref(),
        &settings,
        now_s,
    );

    if builder.channel_count() == 0 {
        return Err(no_candidate_error(&snapshot, &request));
    }

    crate::logger::info(
        "dispatcher",
        &format!(
            "[{}] Dispatching model={} dialect={} streaming={} candidates over {} channels",
            request.request_id,
            request.model,
            request.dialect,
            request.streaming,
            builder.channel_count()
        ),
    );

    let start = Instant::now();
    let mut last_error: Option<(u16, String)> = None;
    let mut last_candidate: Option<Candidate> = None;

    while let Some(candidate) = builder.next(crate::clock::epoch_s()) {
        let adapter = dialects::adapter_for(request.dialect, &candidate);
        let attempt = execute_attempt(&request, &candidate, &adapter, &settings, start).await;

        match attempt {
            AttemptResult::Done(response) => return Ok(response),
            AttemptResult::Retry { status, message } => {
                crate::logger::warn(
                    "dispatcher",
                    &format!(
                        "[{}] Attempt on channel '{}' failed ({}): {}",
                        request.request_id, candidate.channel_name, status, message
                    ),
                );
                last_error = Some((status, message));
                last_candidate = Some(candidate);
            }
            AttemptResult::ModelMissing => {
                crate::logger::info(
                    "dispatcher",
                    &format!(
                        "[{}] Channel '{}' reports model missing, excluding for this request",
                        request.request_id, candidate.channel_name
                    ),
                );
                builder.ban_channel(candidate.channel_id);
            }
            AttemptResult::Terminal { status, body } => {
                record_failure(&request, &candidate, status, start, &body);
                return Err(RelayError::UpstreamExhausted { status, body });
            }
        }
    }

    let (status, message) = last_error.unwrap_or((503, "No usable candidate".to_string()));
    if let Some(candidate) = &last_candidate {
        record_failure(&request, candidate, status, start, &message);
    }
    Err(RelayError::UpstreamExhausted { status, body: message })
}

/// Distinguish "model unknown everywhere" (client error) from "filtered
/// out by access control or cooldown" (temporary).
fn no_candidate_error(snapshot: &cache::RoutingSnapshot, request: &RelayRequest) -> RelayError {
    let model_known_somewhere = snapshot.enumerate_enabled().any(|ch| {
        super::model_match::resolve_model(
            &ch.channel.models,
            &ch.channel.model_redirects,
            &request.model,
        )
        .is_some()
    });
    if model_known_somewhere {
        RelayError::NoCandidate(format!(
            "No usable channel for model '{}'",
            request.model
        ))
    } else {
        RelayError::BadRequest(format!("Unknown model '{}'", request.model))
    }
}

enum AttemptResult {
    /// Response handed to the client; dispatch is over.
    Done(Response),
    /// Move on to the next candidate.
    Retry { status: u16, message: String },
    /// Candidate cannot serve this model; no cooldown, no retry of it.
    ModelMissing,
    /// Non-retryable upstream reply surfaced to the client as-is.
    Terminal { status: u16, body: String },
}

async fn execute_attempt(
    request: &RelayRequest,
    candidate: &Candidate,
    adapter: &DialectAdapter,
    settings: &config::Settings,
    start: Instant,
) -> AttemptResult {
    let upstream_streaming = request.streaming || adapter.requires_streaming();
    let built = match adapter.build(candidate, &request.payload, upstream_streaming) {
        Ok(built) => built,
        Err(e) => {
            return AttemptResult::Retry { status: 0, message: e.to_string() };
        }
    };

    let http = if built.streaming {
        client::streaming_client()
    } else {
        client::default_client()
    };

    let response = match client::make_request(http, &built.url, built.headers, &built.body).await {
        Ok(response) => response,
        Err(e) => {
            // Connection failure or timeout: channel-level trip.
            trip_channel(candidate, settings, None);
            let message = e.to_string();
            return AttemptResult::Retry { status: 0, message };
        }
    };

    let status = response.status().as_u16();

    if (200..300).contains(&status) {
        cooldown::reset(Subject::Channel(candidate.channel_id));
        cooldown::reset(Subject::Key(candidate.key.key_id));

        let response = if request.streaming {
            stream_to_client(request, candidate, response, start)
        } else if upstream_streaming {
            aggregate_stream(request, candidate, adapter, response, start).await
        } else {
            unary_passthrough(request, candidate, adapter, response, start).await
        };
        return match response {
            Ok(response) => AttemptResult::Done(response),
            Err(e) => {
                // Body read or mid-aggregate failure; no client bytes have
                // been forwarded yet, so the candidate loop may continue.
                trip_channel(candidate, settings, None);
                AttemptResult::Retry { status, message: e.to_string() }
            }
        };
    }

    let retry_after = client::parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();

    if client::body_indicates_model_missing(status, &body) {
        return AttemptResult::ModelMissing;
    }
    if client::is_key_status(status) {
        // Credential problem or rate limit: key-level trip.
        let retry_after = if status == 429 { retry_after } else { None };
        cooldown::trip(
            Subject::Key(candidate.key.key_id),
            crate::clock::epoch_s(),
            settings,
            retry_after,
            candidate.key.cooldown.last_ms,
        );
        return AttemptResult::Retry { status, message: truncate(&body, 500) };
    }
    if client::is_retryable_status(status) {
        trip_channel(candidate, settings, None);
        return AttemptResult::Retry { status, message: truncate(&body, 500) };
    }

    AttemptResult::Terminal { status, body: truncate(&body, 2000) }
}

fn trip_channel(candidate: &Candidate, settings: &config::Settings, retry_after: Option<u64>) {
    cooldown::trip(
        Subject::Channel(candidate.channel_id),
        crate::clock::epoch_s(),
        settings,
        retry_after,
        candidate.channel_cooldown.last_ms,
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

// ============================================================================
// Response paths
// ============================================================================

/// Unary upstream, unary client: forward the body verbatim and account from
/// the parsed view.
async fn unary_passthrough(
    request: &RelayRequest,
    candidate: &Candidate,
    adapter: &DialectAdapter,
    response: reqwest::Response,
    start: Instant,
) -> RelayResult<Response> {
    let text = response.text().await.map_err(|e| RelayError::UpstreamExhausted {
        status: 502,
        body: format!("Failed to read response: {}", e),
    })?;
    let body: Value = serde_json::from_str(&text).map_err(|e| RelayError::UpstreamExhausted {
        status: 502,
        body: format!("Failed to parse response: {}", e),
    })?;

    let parsed = adapter.parse(&body);
    finalize(
        request,
        candidate,
        200,
        start.elapsed().as_secs_f64(),
        None,
        false,
        &parsed.usage,
        true,
        None,
    );

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        text,
    )
        .into_response())
}

/// Streaming upstream, unary client: consume the whole stream, then reply
/// with a synthesized unary body in the channel dialect.
async fn aggregate_stream(
    request: &RelayRequest,
    candidate: &Candidate,
    adapter: &DialectAdapter,
    response: reqwest::Response,
    start: Instant,
) -> RelayResult<Response> {
    let first_byte_s = start.elapsed().as_secs_f64();
    let mut stats = StreamStats::default();
    let mut line_buffer: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for line in client::drain_sse_lines(&mut line_buffer, bytes.as_ref()) {
                    adapter.decode_line(&line, &mut stats);
                }
            }
            Err(e) => {
                // Nothing has reached the client; the dispatcher may retry
                // on another candidate.
                return Err(RelayError::UpstreamExhausted {
                    status: 502,
                    body: format!("Upstream stream failed: {}", e),
                });
            }
        }
    }

    let body = adapter.synthesize_unary(&stats, &candidate.effective_model);
    finalize(
        request,
        candidate,
        200,
        start.elapsed().as_secs_f64(),
        Some(first_byte_s),
        false,
        &usage_with_estimate(&stats),
        true,
        None,
    );

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response())
}

/// Streaming pass-through with an accounting tap.
///
/// Bytes go to the client in upstream order as they arrive; a copy of each
/// chunk is offered to a bounded decode channel (dropped on overflow) whose
/// consumer accumulates usage and writes metrics after the stream ends.
/// Accounting side-effects therefore happen-after the terminal event.
fn stream_to_client(
    request: &RelayRequest,
    candidate: &Candidate,
    response: reqwest::Response,
    start: Instant,
) -> RelayResult<Response> {
    let first_byte_s = start.elapsed().as_secs_f64();
    let (tap_tx, tap_rx) = mpsc::channel::<Bytes>(TAP_BUFFER);
    let stream_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    spawn_tap_decoder(
        request.clone(),
        candidate.clone(),
        dialects::adapter_for(request.dialect, candidate),
        tap_rx,
        Arc::clone(&stream_error),
        start,
        first_byte_s,
    );

    let error_slot = Arc::clone(&stream_error);
    let body_stream = response.bytes_stream().map(move |chunk| match chunk {
        Ok(bytes) => {
            // Accounting is best-effort: never let the tap backpressure the
            // client.
            let _ = tap_tx.try_send(bytes.clone());
            Ok::<Bytes, std::io::Error>(bytes)
        }
        Err(e) => {
            if let Ok(mut slot) = error_slot.lock() {
                *slot = Some(e.to_string());
            }
            // The client already holds a 200; close with an SSE error event
            // instead of retrying.
            let event = serde_json::json!({
                "type": "error",
                "error": {"type": "upstream_stream_failed", "message": e.to_string()}
            });
            Ok(Bytes::from(format!("event: error\ndata: {}\n\n", event)))
        }
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body_stream),
    )
        .into_response())
}

#[allow(clippy::too_many_arguments)]
fn spawn_tap_decoder(
    request: RelayRequest,
    candidate: Candidate,
    adapter: DialectAdapter,
    mut tap_rx: mpsc::Receiver<Bytes>,
    stream_error: Arc<Mutex<Option<String>>>,
    start: Instant,
    first_byte_s: f64,
) {
    tokio::spawn(async move {
        let mut stats = StreamStats::default();
        let mut line_buffer: Vec<u8> = Vec::new();

        while let Some(bytes) = tap_rx.recv().await {
            for line in client::drain_sse_lines(&mut line_buffer, bytes.as_ref()) {
                adapter.decode_line(&line, &mut stats);
            }
        }

        // Sender dropped: the pass-through ended, by completion, upstream
        // failure, or client cancellation.
        let error = stream_error.lock().ok().and_then(|slot| slot.clone());
        let completed = stats.done || stats.finish_reason.is_some();
        let message = match (&error, completed) {
            (Some(e), _) => Some(e.clone()),
            (None, false) => Some("Stream ended before terminal event".to_string()),
            (None, true) => None,
        };

        finalize(
            &request,
            &candidate,
            200,
            start.elapsed().as_secs_f64(),
            Some(first_byte_s),
            true,
            &usage_with_estimate(&stats),
            error.is_none() && completed,
            message,
        );
    });
}

/// Usage counters with an output estimate when the upstream never reported
/// any (accumulated text is the best signal available).
fn usage_with_estimate(stats: &StreamStats) -> TokenUsage {
    let mut usage = stats.usage;
    if usage.output_tokens == 0 && !stats.text.is_empty() {
        usage.output_tokens = super::context::estimate_tokens(&stats.text);
    }
    usage
}

/// Record the terminal outcome of a request: one log row plus one token
/// counter sample, both through the async recorder.
#[allow(clippy::too_many_arguments)]
fn finalize(
    request: &RelayRequest,
    candidate: &Candidate,
    status: u16,
    duration_s: f64,
    first_byte_s: Option<f64>,
    streaming: bool,
    usage: &TokenUsage,
    success: bool,
    message: Option<String>,
) {
    let cost_usd = pricing::model_price(candidate.quota_config.as_deref(), &candidate.effective_model)
        .map(|price| pricing::cost_usd(usage, &price))
        .unwrap_or(0.0);

    metrics::record_log(crate::store::LogRow {
        ts_ms: crate::clock::epoch_ms(),
        model: candidate.effective_model.clone(),
        channel_id: candidate.channel_id,
        status: status as i64,
        duration_s,
        streaming,
        first_byte_s,
        key_excerpt: key_excerpt(&candidate.key.secret),
        api_base_url: candidate.endpoint_url.clone(),
        auth_token_id: request.token.id,
        client_ip: request.client_ip.clone(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_tokens: usage.cache_read_tokens,
        cache_creation_tokens: usage.cache_creation_tokens,
        cost_usd,
        message,
    });

    metrics::record_token_stats(
        request.token.id,
        TokenStatSample {
            success,
            streaming,
            duration_s,
            first_byte_s,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            cost_usd,
        },
    );

    crate::logger::info(
        "dispatcher",
        &format!(
            "[{}] Completed: channel='{}' model={} status={} tokens={}/{} cost=${:.6}",
            request.request_id,
            candidate.channel_name,
            candidate.effective_model,
            status,
            usage.input_tokens,
            usage.output_tokens,
            cost_usd
        ),
    );
}

/// Record a failed terminal attempt (no usage to account).
fn record_failure(
    request: &RelayRequest,
    candidate: &Candidate,
    status: u16,
    start: Instant,
    body: &str,
) {
    finalize(
        request,
        candidate,
        status,
        start.elapsed().as_secs_f64(),
        None,
        false,
        &TokenUsage::default(),
        false,
        Some(truncate(body, 500)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ChannelWithKeys, RoutingSnapshot};
    use crate::relay::context::ClientDialect;
    use crate::store::{AuthToken, Channel, ChannelType, Cooldown, Preset};

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // Multi-byte character straddling the cut.
        let s = "héllo";
        let t = truncate(s, 2);
        assert!(s.starts_with(&t));
    }

    fn channel_with(models: &[&str]) -> ChannelWithKeys {
        ChannelWithKeys {
            channel: Channel {
                id: 1,
                name: "only".to_string(),
                channel_type: ChannelType::Openai,
                url: "https://x.example.com".to_string(),
                priority: 0,
                sort_order: 0,
                models: models.iter().map(|s| s.to_string()).collect(),
                model_redirects: Default::default(),
                enabled: true,
                preset: Preset::Empty,
                openai_compat: false,
                auto_select_endpoint: false,
                quota_config: None,
                cooldown: Cooldown::default(),
                created_at: 0,
                updated_at: 0,
            },
            keys: vec![],
            endpoints: vec![],
        }
    }

    fn request_for(model: &str) -> RelayRequest {
        RelayRequest {
            request_id: "r".to_string(),
            dialect: ClientDialect::OpenAi,
            model: model.to_string(),
            payload: serde_json::json!({}),
            streaming: false,
            token: AuthToken {
                id: 1,
                token_hash: String::new(),
                description: String::new(),
                active: true,
                expires_at: None,
                all_channels: true,
                last_used_at: 0,
                success_count: 0,
                failure_count: 0,
                stream_count: 0,
                non_stream_count: 0,
                stream_avg_ttfb_s: 0.0,
                non_stream_avg_rt_s: 0.0,
                prompt_tokens: 0,
                completion_tokens: 0,
                cache_read_tokens: 0,
                cache_creation_tokens: 0,
                total_cost_usd: 0.0,
            },
            client_ip: "t".to_string(),
        }
    }

    #[test]
    fn empty_candidate_set_classification() {
        let snapshot = RoutingSnapshot::for_test(vec![channel_with(&["gpt-4o"])]);

        // Model served somewhere but filtered for this request: temporary.
        let err = no_candidate_error(&snapshot, &request_for("gpt-4o"));
        assert!(matches!(err, RelayError::NoCandidate(_)));

        // Model unknown on every channel: client error.
        let err = no_candidate_error(&snapshot, &request_for("claude-opus"));
        assert!(matches!(err, RelayError::BadRequest(_)));
    }
}
