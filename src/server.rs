//! Slack Events API endpoint.
//!
//! `POST /slack/events` verifies the request signature, answers URL
//! verification, filters and deduplicates message events, and hands each
//! accepted message to a `RequestHandler` on a background task. Slack gets
//! its 200 before any pipeline work starts.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use hmac::{Hmac, Mac};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::context::{AttachmentData, MediaAttachment};
use crate::pipeline::{Orchestrator, UserRequest};
use crate::store::IdempotencyCache;

/// Requests older (or newer) than this are rejected as replays.
const MAX_CLOCK_SKEW_SECS: u64 = 60 * 5;

static MENTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<@[A-Z0-9]+(\|[^>]*)?>").unwrap());

type HmacSha256 = Hmac<Sha256>;

/// Receives accepted user requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn accept(&self, request: UserRequest);
}

#[async_trait]
impl RequestHandler for Orchestrator {
    async fn accept(&self, request: UserRequest) {
        self.handle(request).await;
    }
}

/// Shared state for the event handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<dyn RequestHandler>,
    pub cache: Arc<dyn IdempotencyCache>,
    /// Signature checks are skipped when `None`.
    pub signing_secret: Option<SecretString>,
}

/// Build the router with the Slack events and health routes.
pub fn slack_routes(state: AppState) -> Router {
    Router::new()
        .route("/slack/events", post(slack_events))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "slack-ai-bot"
    }))
}

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventPayload {
    UrlVerification {
        challenge: String,
    },
    EventCallback {
        event: SlackEvent,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    ts: String,
    #[serde(default)]
    thread_ts: Option<String>,
    channel: String,
    #[serde(default)]
    channel_type: Option<String>,
    #[serde(default)]
    client_msg_id: Option<String>,
    #[serde(default)]
    files: Vec<SlackFile>,
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    #[serde(default)]
    mimetype: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url_private: Option<String>,
    #[serde(default)]
    url_private_download: Option<String>,
}

async fn slack_events(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(ref secret) = state.signing_secret {
        let now = chrono::Utc::now().timestamp();
        if let Err(reason) = verify_signature(secret, &headers, &body, now) {
            warn!(reason, "Rejected Slack request");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let payload: EventPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Malformed Slack payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match payload {
        EventPayload::UrlVerification { challenge } => {
            info!("Answering Slack URL verification");
            Json(serde_json::json!({ "challenge": challenge })).into_response()
        }
        EventPayload::EventCallback { event } => {
            accept_event(&state, event).await;
            StatusCode::OK.into_response()
        }
        EventPayload::Other => StatusCode::OK.into_response(),
    }
}

async fn accept_event(state: &AppState, event: SlackEvent) {
    let Some(request_key) = event.client_msg_id.clone() else {
        debug!(kind = %event.kind, ts = %event.ts, "Ignoring event without client_msg_id");
        return;
    };
    if !is_user_message(&event) {
        debug!(kind = %event.kind, subtype = ?event.subtype, "Ignoring non-user event");
        return;
    }

    match state.cache.claim(&request_key, &event.text).await {
        Ok(true) => {}
        Ok(false) => {
            info!(client_msg_id = %request_key, "Duplicate delivery ignored");
            return;
        }
        Err(e) => warn!(client_msg_id = %request_key, error = %e, "Dedup cache unavailable, processing anyway"),
    }

    let Some(request) = to_user_request(event) else {
        debug!(client_msg_id = %request_key, "Empty message ignored");
        return;
    };

    let request_id = Uuid::new_v4();
    let span = info_span!("request", %request_id, channel = %request.channel_id);
    info!(parent: &span, user = %request.user_id, thread = ?request.thread_ts, "Accepted message");

    let handler = Arc::clone(&state.handler);
    tokio::spawn(async move { handler.accept(request).await }.instrument(span));
}

/// Mentions anywhere, or any message in a DM, from a human.
fn is_user_message(event: &SlackEvent) -> bool {
    if event.bot_id.is_some() || event.user.is_none() {
        return false;
    }
    match event.kind.as_str() {
        "app_mention" => true,
        "message" => event.channel_type.as_deref() == Some("im") && event.subtype.is_none(),
        _ => false,
    }
}

fn to_user_request(event: SlackEvent) -> Option<UserRequest> {
    let text = MENTION.replace_all(&event.text, "").trim().to_string();
    let attachment = event.files.into_iter().find_map(|f| {
        let mime_type = f.mimetype.filter(|m| m.starts_with("image/"))?;
        let url = f.url_private_download.or(f.url_private)?;
        Some(MediaAttachment {
            mime_type,
            name: f.name,
            data: AttachmentData::Url(url),
        })
    });
    if text.is_empty() && attachment.is_none() {
        return None;
    }

    // Channel replies go in the thread (starting one if needed); DMs stay
    // top level unless the user wrote inside a thread.
    let thread_ts = if event.channel_type.as_deref() == Some("im") {
        event.thread_ts
    } else {
        Some(event.thread_ts.unwrap_or_else(|| event.ts.clone()))
    };

    Some(UserRequest {
        user_id: event.user.unwrap_or_default(),
        channel_id: event.channel,
        thread_ts,
        message_id: event.ts,
        text,
        attachment,
    })
}

// ── Signature ───────────────────────────────────────────────────────

/// Check `X-Slack-Signature` (`v0=` + hex HMAC-SHA256 of
/// `v0:{timestamp}:{body}`) and the timestamp window.
pub fn verify_signature(
    secret: &SecretString,
    headers: &HeaderMap,
    body: &[u8],
    now: i64,
) -> Result<(), &'static str> {
    let timestamp = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing timestamp")?;
    let signature = headers
        .get("x-slack-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing signature")?;

    let ts: i64 = timestamp.trim().parse().map_err(|_| "bad timestamp")?;
    if now.abs_diff(ts) > MAX_CLOCK_SKEW_SECS {
        return Err("stale timestamp");
    }

    let expected = signature
        .strip_prefix("v0=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or("malformed signature")?;

    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| "invalid signing secret")?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| "signature mismatch")
}

/// `v0=` signature for a body, as Slack would send it.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => return String::new(),
    };
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}
