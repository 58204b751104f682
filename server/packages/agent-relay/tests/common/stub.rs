use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

/// In-process stand-in for the sandbox runner. Speaks the runner's HTTP
/// surface and scripts tool results off the requested command.
pub struct SandboxStub {
    base_url: String,
    counters: Arc<StubCounters>,
    server: JoinHandle<()>,
}

#[derive(Default)]
pub struct StubCounters {
    executes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard {
    counters: Arc<StubCounters>,
}

impl InFlightGuard {
    fn enter(counters: Arc<StubCounters>) -> Self {
        counters.executes.fetch_add(1, Ordering::SeqCst);
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { counters }
    }
}

impl Drop for InFlightGuard {
    // Runs even when the handler future is dropped mid-execute.
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SandboxStub {
    pub async fn spawn() -> Self {
        let counters = Arc::new(StubCounters::default());
        let router = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/shutdown", post(|| async { StatusCode::OK }))
            .route("/tools/execute", post(execute))
            .with_state(counters.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Self {
            base_url: format!("http://{addr}"),
            counters,
            server,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn executes(&self) -> usize {
        self.counters.executes.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for SandboxStub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn execute(State(counters): State<Arc<StubCounters>>, Json(request): Json<Value>) -> Response {
    let _guard = InFlightGuard::enter(counters);
    let tool = request["tool"].as_str().unwrap_or_default();
    let arguments = &request["arguments"];
    match tool {
        "run_terminal_cmd" => run_terminal_cmd(arguments).await,
        "read_file" => success(json!({ "content": "stub file contents\n" })),
        "write_file" => success(json!({ "bytes_written": 18 })),
        other => failure(format!("stub has no tool `{other}`")),
    }
}

async fn run_terminal_cmd(arguments: &Value) -> Response {
    let command = arguments["command"].as_str().unwrap_or_default();
    if let Some(secs) = command.strip_prefix("sleep ") {
        let secs: f64 = secs.trim().parse().unwrap_or(0.0);
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        return success(json!({ "stdout": "" }));
    }
    if command == "boom" {
        // Transport-level failure, distinct from a tool that ran and failed.
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if command == "false" {
        return failure("command `false` exited with status 1".to_string());
    }
    if command.starts_with("ls") {
        return success(json!({ "stdout": "Cargo.toml\nsrc\ntests" }));
    }
    success(json!({ "stdout": format!("ran: {command}") }))
}

fn success(result: Value) -> Response {
    Json(json!({ "success": true, "result": result })).into_response()
}

fn failure(error: String) -> Response {
    Json(json!({ "success": false, "error": error })).into_response()
}
