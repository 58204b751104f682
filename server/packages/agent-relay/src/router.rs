use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_relay_error::{ErrorBody, ErrorEnvelope, ErrorKind, RelayError};
use axum::extract::{Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use futures::stream;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::bus::{EventPage, Subscription};
use crate::config::RelayConfig;
use crate::events::{
    DoneData, EventPayload, InvocationStatus, MessageDeltaData, PlanStepSnapshot, PlanUpdateData,
    SessionEvent, SessionEventType, StepStatus, StepUpdateData, ToolInvocationData, TurnOutcome,
};
use crate::provider::ProviderRegistry;
use crate::registry::{IncomingMessage, SessionRegistry};
use crate::session::{
    Message, MessageRole, SessionDetail, SessionStatus, SessionSummary,
};
use crate::supervisor::Supervisor;
use crate::tools::{ToolDescriptor, ToolGateway, ToolRegistry};

pub struct AppState {
    registry: Arc<SessionRegistry>,
    supervisor: Supervisor,
    providers: ProviderRegistry,
}

impl AppState {
    pub fn new(config: &RelayConfig) -> Self {
        let gateway = ToolGateway::new(ToolRegistry::builtin(), config.tool_timeout);
        let registry = Arc::new(SessionRegistry::new(
            config.provisioner(),
            gateway,
            config.max_sandboxes,
            config.event_retention,
        ));
        let supervisor = Supervisor::new(registry.clone());
        Self {
            registry,
            supervisor,
            providers: ProviderRegistry::builtin(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route(
            "/sessions/:session_id",
            get(get_session)
                .patch(update_session)
                .delete(delete_session),
        )
        .route("/sessions/:session_id/stop", post(stop_session))
        .route("/sessions/:session_id/chat", post(post_chat))
        .route("/sessions/:session_id/events", get(get_events_sse))
        .route("/sessions/:session_id/events/poll", get(poll_events))
        .route("/tools", get(list_tools))
        .route("/tools/execute", post(execute_tool))
        .with_state(shared.clone());

    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/api-docs/openapi.json", get(openapi_spec))
        .nest("/v1", v1_router)
        .fallback(not_found)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let http_logging = match std::env::var("RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

pub async fn shutdown(state: &Arc<AppState>) {
    state.supervisor.shutdown_all().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        create_session,
        list_sessions,
        get_session,
        update_session,
        delete_session,
        stop_session,
        post_chat,
        get_events_sse,
        poll_events,
        list_tools,
        execute_tool
    ),
    components(
        schemas(
            HealthResponse,
            CreateSessionRequest,
            UpdateSessionRequest,
            ChatRequest,
            ChatResponse,
            ExecuteToolRequest,
            IncomingMessage,
            Message,
            MessageRole,
            SessionDetail,
            SessionSummary,
            SessionStatus,
            SessionListData,
            SessionEvent,
            SessionEventType,
            EventPayload,
            MessageDeltaData,
            PlanUpdateData,
            PlanStepSnapshot,
            StepUpdateData,
            StepStatus,
            ToolInvocationData,
            InvocationStatus,
            DoneData,
            TurnOutcome,
            EventPage,
            ToolDescriptor,
            ToolListData,
            ToolExecuteData,
            EmptyData,
            SessionEnvelope,
            SessionListEnvelope,
            ChatEnvelope,
            EventPageEnvelope,
            ToolListEnvelope,
            ToolExecuteEnvelope,
            EmptyEnvelope,
            ErrorEnvelope,
            ErrorBody,
            ErrorKind
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sessions", description = "Session lifecycle and chat"),
        (name = "events", description = "Per-session event streams"),
        (name = "tools", description = "Tool discovery and execution")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2468")]);
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope: ErrorEnvelope = match &self {
            ApiError::Relay(err) => err.to_envelope(),
        };
        let status =
            StatusCode::from_u16(envelope.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(envelope)).into_response()
    }
}

/// Success envelope mirroring the error envelope shape: `code` 0 and a
/// constant message, with the payload under `data`.
#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
#[aliases(
    SessionEnvelope = Envelope<SessionDetail>,
    SessionListEnvelope = Envelope<SessionListData>,
    ChatEnvelope = Envelope<ChatResponse>,
    EventPageEnvelope = Envelope<EventPage>,
    ToolListEnvelope = Envelope<ToolListData>,
    ToolExecuteEnvelope = Envelope<ToolExecuteData>,
    EmptyEnvelope = Envelope<EmptyData>
)]
pub struct Envelope<T> {
    pub code: u16,
    pub message: String,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct UpdateSessionRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ChatRequest {
    pub messages: Vec<IncomingMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ChatResponse {
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ExecuteToolRequest {
    pub session_id: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionListData {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ToolListData {
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ToolExecuteData {
    pub invocation: ToolInvocationData,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct EmptyData {}

#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct EventsQuery {
    offset: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct PollQuery {
    offset: Option<u64>,
    limit: Option<u64>,
}

const SERVER_INFO: &str = "\
This is an Agent Relay server. Available endpoints:\n\
  - GET  /health                  - Health check\n\
  - GET  /v1/sessions             - List sessions\n\
  - GET  /api-docs/openapi.json   - API documentation";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/v1/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 200, body = SessionEnvelope),
        (status = 429, body = ErrorEnvelope),
        (status = 502, body = ErrorEnvelope)
    ),
    tag = "sessions"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<Envelope<SessionDetail>>, ApiError> {
    let detail = state.registry.create(request.title).await?;
    Ok(Json(Envelope::success(detail)))
}

#[utoipa::path(
    get,
    path = "/v1/sessions",
    params(("limit" = Option<usize>, Query, description = "Max sessions to return, newest first")),
    responses((status = 200, body = SessionListEnvelope)),
    tag = "sessions"
)]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<Envelope<SessionListData>> {
    let sessions = state.registry.list(query.limit).await;
    Json(Envelope::success(SessionListData { sessions }))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionEnvelope),
        (status = 404, body = ErrorEnvelope)
    ),
    tag = "sessions"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Envelope<SessionDetail>>, ApiError> {
    let detail = state.registry.detail(&session_id).await?;
    Ok(Json(Envelope::success(detail)))
}

#[utoipa::path(
    patch,
    path = "/v1/sessions/{session_id}",
    request_body = UpdateSessionRequest,
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionEnvelope),
        (status = 404, body = ErrorEnvelope)
    ),
    tag = "sessions"
)]
async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<UpdateSessionRequest>,
) -> Result<Json<Envelope<SessionDetail>>, ApiError> {
    let detail = state
        .registry
        .update_title(&session_id, request.title)
        .await?;
    Ok(Json(Envelope::success(detail)))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/stop",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, body = EmptyEnvelope),
        (status = 404, body = ErrorEnvelope)
    ),
    tag = "sessions"
)]
async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Envelope<EmptyData>>, ApiError> {
    state.supervisor.stop_session(&session_id).await?;
    Ok(Json(Envelope::success(EmptyData {})))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    params(("session_id" = String, Path, description = "Session id")),
    responses((status = 200, body = EmptyEnvelope)),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Envelope<EmptyData>>, ApiError> {
    state.supervisor.delete_session(&session_id).await?;
    Ok(Json(Envelope::success(EmptyData {})))
}

#[utoipa::path(
    post,
    path = "/v1/sessions/{session_id}/chat",
    request_body = ChatRequest,
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Envelope with the final assistant message, or an SSE stream of this turn's events when `stream` is true"),
        (status = 400, body = ErrorEnvelope),
        (status = 404, body = ErrorEnvelope)
    ),
    tag = "sessions"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let provider_name = request
        .provider
        .as_deref()
        .unwrap_or(state.providers.default_name());
    let provider = state.providers.get(provider_name)?;
    let messages = SessionRegistry::turn_messages(request.messages)?;
    let slot = state.registry.slot(&session_id).await?;

    // Queue behind any in-flight turn before checking status, so a chat
    // that waited out a stop still sees the stopped session.
    let permit = slot.turn_lock.clone().lock_owned().await;
    state.registry.ensure_accepting(&slot).await?;
    let runner = state.registry.turn_runner(&slot, provider);

    if request.stream.unwrap_or(false) {
        // Replay nothing from earlier turns: start after the latest
        // already-published offset.
        let from = slot.bus.event_count().await.checked_sub(1);
        let subscription = slot.bus.subscribe(from).await?;
        tokio::spawn(async move {
            let _permit = permit;
            runner.run(messages).await;
        });
        return Ok(Sse::new(stream_session_events(subscription, true)).into_response());
    }

    // The turn runs detached so a dropped connection cannot lose the
    // terminal event mid-turn.
    let turn = tokio::spawn(async move {
        let _permit = permit;
        runner.run(messages).await
    });
    let result = turn.await.map_err(|err| RelayError::Internal {
        message: format!("turn task failed: {err}"),
    })?;
    Ok(Json(Envelope::success(ChatResponse {
        message: result.assistant,
    }))
    .into_response())
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/events",
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("offset" = Option<u64>, Query, description = "Last seen event offset (exclusive); omit to replay from the start")
    ),
    responses(
        (status = 200, description = "SSE event stream"),
        (status = 404, body = ErrorEnvelope),
        (status = 410, body = ErrorEnvelope)
    ),
    tag = "events"
)]
async fn get_events_sse(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let slot = state.registry.slot(&session_id).await?;
    let subscription = slot.bus.subscribe(query.offset).await?;
    Ok(Sse::new(stream_session_events(subscription, false)))
}

#[utoipa::path(
    get,
    path = "/v1/sessions/{session_id}/events/poll",
    params(
        ("session_id" = String, Path, description = "Session id"),
        ("offset" = Option<u64>, Query, description = "Last seen event offset (exclusive)"),
        ("limit" = Option<u64>, Query, description = "Max events to return")
    ),
    responses(
        (status = 200, body = EventPageEnvelope),
        (status = 404, body = ErrorEnvelope),
        (status = 410, body = ErrorEnvelope)
    ),
    tag = "events"
)]
async fn poll_events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<Envelope<EventPage>>, ApiError> {
    let slot = state.registry.slot(&session_id).await?;
    let page = slot.bus.page(query.offset, query.limit).await?;
    Ok(Json(Envelope::success(page)))
}

#[utoipa::path(
    get,
    path = "/v1/tools",
    responses((status = 200, body = ToolListEnvelope)),
    tag = "tools"
)]
async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Envelope<ToolListData>> {
    let tools = state.registry.gateway().registry().descriptors();
    Json(Envelope::success(ToolListData { tools }))
}

#[utoipa::path(
    post,
    path = "/v1/tools/execute",
    request_body = ExecuteToolRequest,
    responses(
        (status = 200, body = ToolExecuteEnvelope),
        (status = 400, body = ErrorEnvelope),
        (status = 404, body = ErrorEnvelope),
        (status = 504, body = ErrorEnvelope)
    ),
    tag = "tools"
)]
async fn execute_tool(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteToolRequest>,
) -> Result<Json<Envelope<ToolExecuteData>>, ApiError> {
    let arguments = request.arguments.unwrap_or_else(|| json!({}));
    let invocation = state
        .registry
        .manual_execute(&request.session_id, &request.tool, &arguments)
        .await?;
    Ok(Json(Envelope::success(ToolExecuteData { invocation })))
}

struct EventStreamState {
    replay: VecDeque<SessionEvent>,
    receiver: broadcast::Receiver<SessionEvent>,
    turn_scoped: bool,
    done: bool,
}

/// Retained replay followed by the live feed. A turn-scoped stream ends at
/// the first `done`; a session stream only ends once the session itself is
/// stopped.
fn stream_session_events(
    subscription: Subscription,
    turn_scoped: bool,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    let state = EventStreamState {
        replay: VecDeque::from(subscription.replay),
        receiver: subscription.receiver,
        turn_scoped,
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        let event = if let Some(event) = state.replay.pop_front() {
            event
        } else {
            match state.receiver.recv().await {
                Ok(event) => event,
                // A lagged receiver has missed events; end the stream so the
                // client resumes from its last offset instead of seeing a gap.
                Err(broadcast::error::RecvError::Lagged(_))
                | Err(broadcast::error::RecvError::Closed) => return None,
            }
        };

        if stream_closes_after(&event, state.turn_scoped) {
            state.done = true;
        }

        Some((Ok::<Event, Infallible>(to_sse_event(&event)), state))
    })
}

fn stream_closes_after(event: &SessionEvent, turn_scoped: bool) -> bool {
    if turn_scoped {
        return event.is_terminal();
    }
    matches!(&event.data, EventPayload::Done(done) if done.outcome == TurnOutcome::Stopped)
}

fn to_sse_event(event: &SessionEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}
