// JSON-RPC 2.0 gateway over HTTP: POST /mcp for requests, GET /mcp for the
// SSE event stream, GET /health for liveness.

mod tools;
mod types;

use std::collections::HashMap;
use std::convert::Infallible;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::broker::LogBroker;
use crate::cache::CpuCache;
use crate::consumers::RateTrackerConsumer;
use crate::engine::ContainerEngine;
use crate::error::EngineError;
use crate::guards;
use crate::models::ContainerSnapshot;
use crate::version::{BUILD_TIME, NAME, VERSION};
use types::{
    rpc_failure, rpc_success, tool_count, tool_descriptors, JsonRpcRequest, ToolCallParams,
    INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR, PROTOCOL_VERSION,
};

/// Gateway debug log, appended next to the crash log.
pub const DEBUG_LOG_PATH: &str = "/tmp/whalewatch-mcp-debug.log";

pub const DEFAULT_PORT: u16 = 9876;

const SESSION_HEADER: &str = "mcp-session-id";
const SESSION_IDLE: Duration = Duration::from_secs(30);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_LIST_TIMEOUT: Duration = Duration::from_secs(5);
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct RpcState {
    pub engine: Arc<dyn ContainerEngine>,
    pub broker: Arc<LogBroker>,
    pub rate_tracker: Arc<RateTrackerConsumer>,
    pub cache: Arc<CpuCache>,
    pub containers: Arc<RwLock<Vec<ContainerSnapshot>>>,
    pub demo_mode: bool,
    sessions: Arc<RwLock<HashMap<String, Instant>>>,
}

impl RpcState {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        broker: Arc<LogBroker>,
        rate_tracker: Arc<RateTrackerConsumer>,
        cache: Arc<CpuCache>,
        containers: Arc<RwLock<Vec<ContainerSnapshot>>>,
        demo_mode: bool,
    ) -> Self {
        RpcState {
            engine,
            broker,
            rate_tracker,
            cache,
            containers,
            demo_mode,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn record_activity(&self, token: &str) {
        let mut sessions = self.sessions.write().unwrap();
        let is_new = !sessions.contains_key(token);
        sessions.insert(token.to_string(), Instant::now());
        if is_new {
            tracing::debug!(
                session = &token[..token.len().min(8)],
                total = sessions.len(),
                "remote session started"
            );
        }
    }

    /// Sessions with activity inside the idle window.
    pub fn connected_clients(&self) -> usize {
        let sessions = self.sessions.read().unwrap();
        sessions
            .values()
            .filter(|seen| seen.elapsed() < SESSION_IDLE)
            .count()
    }

    fn cleanup_stale_sessions(&self) {
        let mut sessions = self.sessions.write().unwrap();
        sessions.retain(|token, seen| {
            let keep = seen.elapsed() <= SESSION_IDLE;
            if !keep {
                tracing::debug!(session = &token[..token.len().min(8)], "remote session expired");
            }
            keep
        });
    }
}

pub fn app(state: RpcState) -> Router {
    Router::new()
        .route("/mcp", post(handle_rpc).get(handle_events))
        .route("/health", get(handle_health))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

pub fn spawn_session_reaper(state: RpcState, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    guards::safe_spawn("session-reaper", async move {
        let mut tick = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => state.cleanup_stale_sessions(),
            }
        }
    })
}

fn hash_hex(input: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Activity key: the client's session header when present, otherwise the
/// user agent grouped into ten-second windows.
fn session_token(headers: &HeaderMap) -> String {
    if let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        return hash_hex(session);
    }
    let agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let window = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() / 10)
        .unwrap_or(0);
    hash_hex(&format!("{agent}-{window}"))
}

async fn handle_rpc(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let token = session_token(&headers);
    state.record_activity(&token);

    let request: JsonRpcRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return Json(rpc_failure(None, PARSE_ERROR, &format!("invalid request: {e}")))
                .into_response()
        }
    };
    tracing::debug!(method = %request.method, "rpc request");

    // Notifications carry no id and expect no body
    let Some(id) = request.id else {
        return StatusCode::ACCEPTED.into_response();
    };
    let id = Some(id);

    let body = match request.method.as_str() {
        "initialize" => rpc_success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": { "name": NAME, "version": VERSION },
                "capabilities": { "tools": {} },
            }),
        ),
        "ping" => rpc_success(id, json!({})),
        "tools/list" => rpc_success(id, json!({ "tools": tool_descriptors() })),
        "tools/call" => dispatch_tool(&state, id, request.params).await,
        other => rpc_failure(id, METHOD_NOT_FOUND, &format!("unknown method: {other}")),
    };

    let mut response = Json(body).into_response();
    if let Ok(value) = HeaderValue::from_str(&token) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

async fn dispatch_tool(state: &RpcState, id: Option<Value>, params: Value) -> Value {
    let call: ToolCallParams = match serde_json::from_value(params) {
        Ok(c) => c,
        Err(e) => return rpc_failure(id, INVALID_PARAMS, &format!("invalid tool call: {e}")),
    };
    tracing::debug!(tool = %call.name, "tool call");

    let result: Result<String, EngineError> = match call.name.as_str() {
        "list_containers" => match serde_json::from_value(call.arguments) {
            Ok(args) => tools::list_containers(state, args).await,
            Err(e) => Err(EngineError::Invalid(e.to_string())),
        },
        "get_logs" => match serde_json::from_value(call.arguments) {
            Ok(args) => tools::get_logs(state, args).await,
            Err(e) => Err(EngineError::Invalid(e.to_string())),
        },
        "get_stats" => match serde_json::from_value(call.arguments) {
            Ok(args) => tools::get_stats(state, args).await,
            Err(e) => Err(EngineError::Invalid(e.to_string())),
        },
        "start_container" => match serde_json::from_value(call.arguments) {
            Ok(args) => tools::start_container(state, args).await,
            Err(e) => Err(EngineError::Invalid(e.to_string())),
        },
        "stop_container" => match serde_json::from_value(call.arguments) {
            Ok(args) => tools::stop_container(state, args).await,
            Err(e) => Err(EngineError::Invalid(e.to_string())),
        },
        "restart_container" => match serde_json::from_value(call.arguments) {
            Ok(args) => tools::restart_container(state, args).await,
            Err(e) => Err(EngineError::Invalid(e.to_string())),
        },
        other => Err(EngineError::Invalid(format!("unknown tool: {other}"))),
    };

    match result {
        Ok(text) => rpc_success(
            id,
            json!({
                "content": [{ "type": "text", "text": text }],
                "isError": false,
            }),
        ),
        Err(e) => {
            let code = match e {
                EngineError::Invalid(_) => INVALID_PARAMS,
                _ => INTERNAL_ERROR,
            };
            rpc_failure(id, code, &e.to_string())
        }
    }
}

/// Stateful SSE stream. It confirms liveness and carries server
/// notifications; tool results always travel on the POST side.
async fn handle_events(
    State(state): State<RpcState>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let token = session_token(&headers);
    state.record_activity(&token);

    let ready = stream::once(async {
        Ok::<Event, Infallible>(Event::default().event("ready").data("{}"))
    });
    Sse::new(ready.chain(stream::pending()))
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

async fn handle_health(State(state): State<RpcState>) -> impl IntoResponse {
    let (status, container_count) = match timeout(HEALTH_LIST_TIMEOUT, state.engine.list(true)).await
    {
        Ok(Ok(list)) => ("healthy", list.len()),
        _ => ("degraded", state.containers.read().unwrap().len()),
    };

    Json(json!({
        "status": status,
        "version": VERSION,
        "build_time": BUILD_TIME,
        "container_count": container_count,
        "tasks": guards::alive_task_count(),
        "file_descriptors": guards::open_fd_count(),
        "tools": tool_count(),
        "protocol": "MCP",
        "transport": "streamable-http (stateful, SSE)",
    }))
}
