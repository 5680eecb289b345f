//! HTTP surface: liveness, health, stats, and the range-aware stream route.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use tgstream_mtproto::RpcError;
use tgstream_range::{parse_range_header, resolve, BlockPlan, ResolvedRange};
use tgstream_streamer::{StreamError, Streamer};
use tracing::{info, warn};

use crate::media_type::{response_mime, sanitize_filename};

pub const SERVICE_NAME: &str = "tgstream-gateway";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub streamer: Streamer,
}

/// Builds the router over the given state.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/stream/:chat_id/:message_id", get(stream_media))
        .with_state(state)
}

async fn root() -> Response {
    Json(json!({
        "status": "running",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "message": "GET /stream/{chat_id}/{message_id} to play a file",
    }))
    .into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let connected = state.streamer.is_ready();
    Json(json!({
        "status": if connected { "ok" } else { "starting" },
        "bot_connected": connected,
    }))
    .into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    Json(state.streamer.stats()).into_response()
}

async fn stream_media(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(i64, i32)>,
    headers: HeaderMap,
) -> Response {
    let streamer = &state.streamer;
    if !streamer.is_ready() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "bot session is still starting",
        );
    }

    let media = match streamer.media(chat_id, message_id).await {
        Ok(media) => media,
        Err(err) => return stream_error_response(err),
    };
    let size = media.meta.size;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    let (status, range) = match range_header {
        None => {
            if size == 0 {
                return empty_full_response(&media.meta);
            }
            (
                StatusCode::OK,
                ResolvedRange {
                    start: 0,
                    end: size - 1,
                },
            )
        }
        Some(value) => match parse_single_range(value, size) {
            Some(range) => (StatusCode::PARTIAL_CONTENT, range),
            None => return unsatisfiable_response(size),
        },
    };

    let plan = match BlockPlan::for_range(range.start, range.end, size) {
        Ok(plan) => plan,
        Err(_) => return unsatisfiable_response(size),
    };

    info!(
        chat_id,
        message_id,
        start = range.start,
        end = range.end,
        size,
        parts = plan.part_count,
        "streaming"
    );

    let mime = response_mime(&media.meta);
    let file_name = media
        .meta
        .file_name
        .clone()
        .unwrap_or_else(|| media.meta.kind.default_file_name().to_string());

    // Fetch the first block before committing to a status line: session
    // acquisition failures (back-off, flood wait, not-ready) still map to
    // real status codes this way. Later failures can only truncate the body.
    let mut upstream = Box::pin(streamer.stream(chat_id, message_id, media, plan));
    let body = match upstream.next().await {
        Some(Ok(first_chunk)) => Body::from_stream(
            stream::once(async move { Ok::<_, StreamError>(first_chunk) }).chain(upstream),
        ),
        Some(Err(err)) => return stream_error_response(err),
        None => Body::empty(),
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, mime)
        .header(header::CONTENT_LENGTH, plan.requested_len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", sanitize_filename(&file_name)),
        );
    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", range.start, range.end, size),
        );
    }
    response
        .body(body)
        .expect("statically valid response headers")
}

/// A `Range` header is honoured only when it carries exactly one spec that
/// resolves inside the file; anything else is unsatisfiable.
fn parse_single_range(value: &str, size: u64) -> Option<ResolvedRange> {
    let specs = match parse_range_header(value) {
        Ok(specs) => specs,
        Err(err) => {
            warn!(%err, "rejecting malformed range header");
            return None;
        }
    };
    if specs.len() != 1 {
        warn!(specs = specs.len(), "rejecting multi-range request");
        return None;
    }
    resolve(specs[0], size).ok()
}

fn unsatisfiable_response(size: u64) -> Response {
    Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::CONTENT_RANGE, format!("bytes */{size}"))
        .body(Body::empty())
        .expect("statically valid response headers")
}

/// Zero-length media short-circuits the engine entirely.
fn empty_full_response(meta: &tgstream_mtproto::MediaMeta) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, response_mime(meta))
        .header(header::CONTENT_LENGTH, 0)
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::empty())
        .expect("statically valid response headers")
}

fn stream_error_response(err: StreamError) -> Response {
    match err {
        StreamError::NotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, "no media found in message")
        }
        StreamError::NotReady => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "bot session is still starting",
        ),
        StreamError::BackoffActive { dc, remaining } => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("{dc} rate limited for another {}s", remaining.as_secs()),
        ),
        StreamError::Upstream(RpcError::FloodWait { seconds }) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("rate limited for {seconds}s"),
        ),
        other => {
            warn!(error = %other, "stream setup failed");
            error_response(StatusCode::BAD_GATEWAY, "backend error")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}
