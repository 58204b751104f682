use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use agent_relay::config::RelayConfig;
use agent_relay::router::{build_router_with_state, AppState};

pub mod stub;
use self::stub::SandboxStub;

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub sandbox: SandboxStub,
}

impl TestApp {
    /// Shared-sandbox app attached to an in-process stub runner.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut RelayConfig)) -> Self {
        let sandbox = SandboxStub::spawn().await;
        let mut config = RelayConfig {
            shared_sandbox: true,
            sandbox_base_url: Some(sandbox.base_url().to_string()),
            tool_timeout: Duration::from_secs(5),
            ..RelayConfig::default()
        };
        tweak(&mut config);
        let (app, state) = build_router_with_state(Arc::new(AppState::new(&config)));
        Self {
            app,
            state,
            sandbox,
        }
    }
}

pub async fn send_request(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    app.clone()
        .oneshot(request)
        .await
        .expect("request handled")
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let response = send_request(app, method, path, body).await;
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

pub async fn send_status(app: &Router, method: Method, path: &str, body: Option<Value>) -> StatusCode {
    let (status, _) = send_json(app, method, path, body).await;
    status
}

pub async fn create_session(app: &Router) -> String {
    let (status, payload) = send_json(app, Method::POST, "/v1/sessions", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK, "create session: {payload}");
    payload["data"]["session_id"]
        .as_str()
        .expect("session id")
        .to_string()
}

pub fn chat_body(content: &str) -> Value {
    json!({ "messages": [{ "role": "user", "content": content }] })
}

/// One-shot chat; resolves once the turn is finished.
pub async fn chat(app: &Router, session_id: &str, content: &str) -> (StatusCode, Value) {
    send_json(
        app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/chat"),
        Some(chat_body(content)),
    )
    .await
}

/// Streaming chat; resolves with the SSE response while the turn runs.
pub async fn chat_stream(app: &Router, session_id: &str, content: &str) -> Response<Body> {
    let mut body = chat_body(content);
    body["stream"] = json!(true);
    send_request(
        app,
        Method::POST,
        &format!("/v1/sessions/{session_id}/chat"),
        Some(body),
    )
    .await
}

pub async fn all_events(app: &Router, session_id: &str) -> Vec<Value> {
    let (status, payload) = send_json(
        app,
        Method::GET,
        &format!("/v1/sessions/{session_id}/events/poll"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "poll events: {payload}");
    payload["data"]["events"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

/// Polls the event log until `stop` is satisfied or the timeout passes;
/// returns whatever was visible last.
pub async fn wait_for_events<F>(
    app: &Router,
    session_id: &str,
    timeout: Duration,
    mut stop: F,
) -> Vec<Value>
where
    F: FnMut(&[Value]) -> bool,
{
    let start = Instant::now();
    loop {
        let events = all_events(app, session_id).await;
        if stop(&events) || start.elapsed() > timeout {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn session_status(app: &Router, session_id: &str) -> String {
    let (status, payload) = send_json(
        app,
        Method::GET,
        &format!("/v1/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "get session: {payload}");
    payload["data"]["status"]
        .as_str()
        .expect("session status")
        .to_string()
}

pub async fn wait_for_status(app: &Router, session_id: &str, want: &str, timeout: Duration) {
    let start = Instant::now();
    loop {
        let status = session_status(app, session_id).await;
        if status == want {
            return;
        }
        if start.elapsed() > timeout {
            panic!("session {session_id} stuck at {status}, wanted {want}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Reads an SSE body to completion. Only valid for streams that close on
/// their own (turn streams, or session streams after a stop).
pub async fn collect_sse(response: Response<Body>) -> Vec<Value> {
    assert_eq!(response.status(), StatusCode::OK, "sse response");
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("sse body")
        .to_bytes();
    parse_sse(std::str::from_utf8(&bytes).expect("utf8 sse body"))
}

pub fn parse_sse(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter_map(|frame| {
            let data = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect::<Vec<_>>()
                .join("");
            if data.is_empty() {
                None
            } else {
                serde_json::from_str(&data).ok()
            }
        })
        .collect()
}

pub fn event_types(events: &[Value]) -> Vec<&str> {
    events
        .iter()
        .map(|event| event["type"].as_str().unwrap_or_default())
        .collect()
}

pub fn has_event_type(events: &[Value], event_type: &str) -> bool {
    events
        .iter()
        .any(|event| event["type"].as_str() == Some(event_type))
}

pub fn offsets(events: &[Value]) -> Vec<u64> {
    events
        .iter()
        .map(|event| event["offset"].as_u64().expect("event offset"))
        .collect()
}

pub fn assert_gapless_from(events: &[Value], first: u64) {
    let offsets = offsets(events);
    let expected: Vec<u64> = (first..first + events.len() as u64).collect();
    assert_eq!(offsets, expected, "offsets must be gapless from {first}");
}
