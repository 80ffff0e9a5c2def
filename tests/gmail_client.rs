//! Gmail client tests against a local fake of the REST API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::json;

use inbox_ledger::config::parse_config;
use inbox_ledger::mailbox::GmailClient;
use inbox_ledger::traits::{ApiError, Mailbox};

#[derive(Clone, Default)]
struct FakeGmail {
    list_calls: Arc<AtomicUsize>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer good-token")
}

async fn list(State(fake): State<FakeGmail>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    }
    // Throttle the first call.
    if fake.list_calls.fetch_add(1, Ordering::SeqCst) == 0 {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", "0")],
            "rate limited",
        )
            .into_response();
    }
    Json(json!({
        "messages": [{"id": "m1", "threadId": "t1"}, {"id": "m2", "threadId": "t2"}],
        "nextPageToken": "page-2"
    }))
    .into_response()
}

async fn message(Path(id): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    }
    let html = URL_SAFE_NO_PAD.encode("<p>You spent <b>$42.10</b> at Bistro.</p><br>Thanks");
    Json(json!({
        "id": id,
        "internalDate": "1772960400000",
        "payload": {
            "mimeType": "multipart/alternative",
            "headers": [
                {"name": "From", "value": "Acme <alerts@acme.example>"},
                {"name": "Subject", "value": "Card purchase"}
            ],
            "parts": [
                {"mimeType": "text/html", "body": {"data": html}}
            ]
        }
    }))
    .into_response()
}

async fn serve() -> (String, FakeGmail) {
    let fake = FakeGmail::default();
    let app = Router::new()
        .route("/gmail/v1/users/me/messages", get(list))
        .route("/gmail/v1/users/me/messages/{id}", get(message))
        .with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://{}/gmail/v1", addr), fake)
}

fn client(api_base: &str) -> GmailClient {
    let config = parse_config(&format!(
        "[db]\npath = \"unused.sqlite\"\n\n[mailbox]\napi_base = \"{}\"\nmax_retries = 2\n",
        api_base
    ))
    .unwrap();
    GmailClient::new(&config.mailbox)
        .unwrap()
        .with_base_delay(Duration::from_millis(10))
}

#[tokio::test]
async fn throttled_listing_is_retried() {
    let (base, fake) = serve().await;
    let gmail = client(&base);

    let page = gmail
        .list_message_ids("good-token", Some("Label_2"), None, 50)
        .await
        .unwrap();
    assert_eq!(page.ids, vec!["m1", "m2"]);
    assert_eq!(page.next_page_token.as_deref(), Some("page-2"));
    assert_eq!(fake.list_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn html_message_is_decoded() {
    let (base, _fake) = serve().await;
    let gmail = client(&base);

    let raw = gmail.get_message("good-token", "m1").await.unwrap();
    assert_eq!(raw.external_id, "m1");
    assert_eq!(raw.sender, "Acme <alerts@acme.example>");
    assert_eq!(raw.subject, "Card purchase");
    assert!(raw.body.contains("You spent $42.10 at Bistro."), "{}", raw.body);
    assert!(!raw.body.contains('<'));
    assert_eq!(raw.received_at.unwrap().timestamp(), 1_772_960_400);
}

#[tokio::test]
async fn rejected_token_is_unauthorized() {
    let (base, _fake) = serve().await;
    let gmail = client(&base);

    let err = gmail.get_message("stale-token", "m1").await.unwrap_err();
    let api = err.downcast_ref::<ApiError>().unwrap();
    assert!(matches!(api, ApiError::Unauthorized(_)));
}
