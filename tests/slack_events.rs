//! HTTP-level tests for the Slack events endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use secrecy::SecretString;
use tokio::sync::mpsc;
use tower::ServiceExt;

use slack_ai_bot::pipeline::UserRequest;
use slack_ai_bot::server::{AppState, RequestHandler, sign, slack_routes};
use slack_ai_bot::store::MemoryIdempotencyCache;

const SECRET: &str = "test-signing-secret";

struct Forward(mpsc::UnboundedSender<UserRequest>);

#[async_trait]
impl RequestHandler for Forward {
    async fn accept(&self, request: UserRequest) {
        let _ = self.0.send(request);
    }
}

fn app(secret: Option<&str>) -> (axum::Router, mpsc::UnboundedReceiver<UserRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let router = slack_routes(AppState {
        handler: Arc::new(Forward(tx)),
        cache: Arc::new(MemoryIdempotencyCache::new(Duration::from_secs(3600))),
        signing_secret: secret.map(SecretString::from),
    });
    (router, rx)
}

fn signed(body: &str) -> Request<Body> {
    let ts = chrono::Utc::now().timestamp();
    Request::builder()
        .method("POST")
        .uri("/slack/events")
        .header("content-type", "application/json")
        .header("x-slack-request-timestamp", ts.to_string())
        .header("x-slack-signature", sign(SECRET, ts, body.as_bytes()))
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn mention(client_msg_id: &str) -> String {
    serde_json::json!({
        "type": "event_callback",
        "event": {
            "type": "app_mention",
            "user": "U1",
            "text": "<@U0BOT> 요약해줘",
            "ts": "1700000001.000200",
            "thread_ts": "1700000000.000100",
            "channel": "C1",
            "client_msg_id": client_msg_id
        }
    })
    .to_string()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let (router, _rx) = app(Some(SECRET));
    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn url_verification_echoes_challenge() {
    let (router, _rx) = app(Some(SECRET));
    let body = r#"{"type": "url_verification", "challenge": "3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"}"#;
    let response = router.oneshot(signed(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["challenge"],
        "3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"
    );
}

#[tokio::test]
async fn bad_signature_is_rejected() {
    let (router, mut rx) = app(Some(SECRET));
    let mut request = signed(&mention("m-1"));
    request
        .headers_mut()
        .insert("x-slack-signature", "v0=deadbeef".parse().unwrap());
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn mention_is_forwarded_with_thread_and_clean_text() {
    let (router, mut rx) = app(Some(SECRET));
    let response = router.oneshot(signed(&mention("m-1"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.text, "요약해줘");
    assert_eq!(request.channel_id, "C1");
    assert_eq!(request.thread_ts.as_deref(), Some("1700000000.000100"));
    assert_eq!(request.message_id, "1700000001.000200");
}

#[tokio::test]
async fn redelivered_event_is_processed_once() {
    let (router, mut rx) = app(None);
    for _ in 0..3 {
        let request = Request::post("/slack/events")
            .header("content-type", "application/json")
            .body(Body::from(mention("m-dup")))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn bot_messages_are_ignored() {
    let (router, mut rx) = app(None);
    let body = serde_json::json!({
        "type": "event_callback",
        "event": {
            "type": "message",
            "channel_type": "im",
            "bot_id": "B1",
            "user": "U0BOT",
            "text": "echo",
            "ts": "1.0",
            "channel": "D1"
        }
    })
    .to_string();
    let request = Request::post("/slack/events").body(Body::from(body)).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}
