// Gateway integration tests: health endpoint and the six tools over
// JSON-RPC, served against the scripted engine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum_test::TestServer;
use serde_json::{json, Value};

use whalewatch::broker::LogBroker;
use whalewatch::cache::CpuCache;
use whalewatch::consumers::RateTrackerConsumer;
use whalewatch::engine::fake::{FakeEngine, ScriptedConnection};
use whalewatch::engine::ContainerEngine;
use whalewatch::models::{ContainerSnapshot, ContainerState, CpuProbe, CpuSample};
use whalewatch::rpc::{app, RpcState};

struct Harness {
    fake: Arc<FakeEngine>,
    broker: Arc<LogBroker>,
    cache: Arc<CpuCache>,
    containers: Arc<RwLock<Vec<ContainerSnapshot>>>,
    server: TestServer,
}

fn harness(demo_mode: bool) -> Harness {
    let fake = Arc::new(FakeEngine::new());
    let engine: Arc<dyn ContainerEngine> = fake.clone();
    let broker = LogBroker::new(engine.clone());
    let rate_tracker = Arc::new(RateTrackerConsumer::new());
    let cache = Arc::new(CpuCache::new());
    let containers = Arc::new(RwLock::new(Vec::new()));

    let state = RpcState::new(
        engine,
        broker.clone(),
        rate_tracker,
        cache.clone(),
        containers.clone(),
        demo_mode,
    );
    let server = TestServer::new(app(state)).unwrap();
    Harness {
        fake,
        broker,
        cache,
        containers,
        server,
    }
}

/// Seed the inventory snapshot and the broker's known-container list without
/// spawning stream tasks (every seeded container is non-running, or the test
/// accepts the tasks).
fn seed_containers(h: &Harness, list: Vec<ContainerSnapshot>) {
    h.fake.set_containers(list.clone());
    *h.containers.write().unwrap() = list.clone();
    h.broker.start_streaming(list);
}

async fn call_tool(server: &TestServer, name: &str, arguments: Value) -> Value {
    let response = server
        .post("/mcp")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments },
        }))
        .await;
    response.assert_status_ok();
    response.json::<Value>()
}

fn tool_text(body: &Value) -> String {
    body["result"]["content"][0]["text"]
        .as_str()
        .expect("text content")
        .to_string()
}

#[tokio::test]
async fn health_reports_the_expected_shape() {
    let h = harness(false);
    h.fake.set_containers(vec![
        FakeEngine::container("c1", "web", ContainerState::Running),
        FakeEngine::container("c2", "db", ContainerState::Exited),
    ]);

    let response = h.server.get("/health").await;
    response.assert_status_ok();
    let body = response.json::<Value>();

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["container_count"], 2);
    assert_eq!(body["tools"], 6);
    assert_eq!(body["protocol"], "MCP");
    assert!(body["version"].as_str().is_some());
    assert!(body["build_time"].as_str().is_some());
    assert!(body["tasks"].as_u64().is_some());
    assert!(body["file_descriptors"].as_u64().is_some());
}

#[tokio::test]
async fn initialize_returns_server_info_and_a_session_header() {
    let h = harness(false);
    let response = h
        .server
        .post("/mcp")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {},
        }))
        .await;
    response.assert_status_ok();
    assert!(response.headers().contains_key("mcp-session-id"));

    let body = response.json::<Value>();
    assert_eq!(body["result"]["serverInfo"]["name"], "whalewatch");
    assert!(body["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn tools_list_enumerates_six_tools() {
    let h = harness(false);
    let response = h
        .server
        .post("/mcp")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/list",
            "params": {},
        }))
        .await;
    let body = response.json::<Value>();
    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 6);
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"get_logs"));
    assert!(names.contains(&"restart_container"));
}

#[tokio::test]
async fn notifications_are_accepted_without_a_body() {
    let h = harness(false);
    let response = h
        .server
        .post("/mcp")
        .json(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
            "params": {},
        }))
        .await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
}

#[tokio::test]
async fn unknown_methods_fail_with_method_not_found() {
    let h = harness(false);
    let response = h
        .server
        .post("/mcp")
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "resources/list",
            "params": {},
        }))
        .await;
    let body = response.json::<Value>();
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn list_containers_filters_and_annotates() {
    let h = harness(false);
    seed_containers(
        &h,
        vec![
            FakeEngine::container("aaaabbbbccccdddd", "api_server", ContainerState::Exited),
            FakeEngine::container("eeeeffffgggghhhh", "db", ContainerState::Exited),
        ],
    );
    h.cache
        .update(HashMap::from([("aaaabbbbccccdddd".to_string(), 42.4)]));

    // Default hides non-running containers
    let body = call_tool(&h.server, "list_containers", json!({})).await;
    let rows: Vec<Value> = serde_json::from_str(&tool_text(&body)).unwrap();
    assert!(rows.is_empty());

    let body = call_tool(&h.server, "list_containers", json!({"all": true})).await;
    let rows: Vec<Value> = serde_json::from_str(&tool_text(&body)).unwrap();
    assert_eq!(rows.len(), 2);
    let api = rows.iter().find(|r| r["name"] == "api_server").unwrap();
    assert_eq!(api["id"], "aaaabbbbcccc");
    assert_eq!(api["cpu_percent"], "42.4");
    assert_eq!(api["state"], "exited");

    let body = call_tool(
        &h.server,
        "list_containers",
        json!({"all": true, "name_filter": "API"}),
    )
    .await;
    let rows: Vec<Value> = serde_json::from_str(&tool_text(&body)).unwrap();
    assert_eq!(rows.len(), 1);

    let body = call_tool(
        &h.server,
        "list_containers",
        json!({"all": true, "state_filter": "running"}),
    )
    .await;
    let rows: Vec<Value> = serde_json::from_str(&tool_text(&body)).unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn list_containers_demo_mode_cleans_names() {
    let h = harness(true);
    seed_containers(
        &h,
        vec![FakeEngine::container(
            "aaaabbbbccccdddd",
            "project_api",
            ContainerState::Exited,
        )],
    );

    let body = call_tool(&h.server, "list_containers", json!({"all": true})).await;
    let rows: Vec<Value> = serde_json::from_str(&tool_text(&body)).unwrap();
    assert_eq!(rows[0]["name"], "api");
}

#[tokio::test]
async fn get_logs_groups_and_filters_output() {
    let h = harness(false);
    seed_containers(
        &h,
        vec![FakeEngine::container("c1", "web", ContainerState::Exited)],
    );
    h.fake.push_connection(
        "c1",
        ScriptedConnection::then_eof(vec![
            FakeEngine::frame(1, b"GET /index 200\n"),
            FakeEngine::frame(2, b"\x1b[31mERROR\x1b[0m boom\n"),
        ]),
    );

    let body = call_tool(&h.server, "get_logs", json!({"containers": ["web"]})).await;
    let text = tool_text(&body);
    assert!(text.contains("=== Container: web ==="));
    assert!(text.contains("[web] GET /index 200"));

    // Substring filter matches against ANSI-stripped content
    h.fake.push_connection(
        "c1",
        ScriptedConnection::then_eof(vec![
            FakeEngine::frame(1, b"GET /index 200\n"),
            FakeEngine::frame(2, b"\x1b[31mERROR\x1b[0m boom\n"),
        ]),
    );
    let body = call_tool(
        &h.server,
        "get_logs",
        json!({"containers": ["web"], "filter": "error"}),
    )
    .await;
    let text = tool_text(&body);
    assert!(text.contains("boom"));
    assert!(!text.contains("GET /index"));

    // A filter that matches nothing
    h.fake.push_connection(
        "c1",
        ScriptedConnection::then_eof(vec![FakeEngine::frame(1, b"quiet\n")]),
    );
    let body = call_tool(
        &h.server,
        "get_logs",
        json!({"containers": ["web"], "filter": "absent"}),
    )
    .await;
    assert!(tool_text(&body).contains("(no matching logs)"));

    // No data at all
    h.fake
        .push_connection("c1", ScriptedConnection::then_eof(vec![]));
    let body = call_tool(&h.server, "get_logs", json!({"containers": ["web"]})).await;
    assert!(tool_text(&body).contains("(no logs available)"));
}

#[tokio::test]
async fn get_logs_with_no_match_reports_it() {
    let h = harness(false);
    seed_containers(
        &h,
        vec![FakeEngine::container("c1", "web", ContainerState::Exited)],
    );
    let body = call_tool(&h.server, "get_logs", json!({"containers": ["missing"]})).await;
    assert_eq!(tool_text(&body), "No containers found");
}

#[tokio::test]
async fn get_logs_rejects_a_bad_regex() {
    let h = harness(false);
    seed_containers(
        &h,
        vec![FakeEngine::container("c1", "web", ContainerState::Exited)],
    );
    let body = call_tool(
        &h.server,
        "get_logs",
        json!({"containers": ["web"], "filter": "([", "is_regex": true}),
    )
    .await;
    assert_eq!(body["error"]["code"], -32602);
}

#[tokio::test]
async fn get_stats_bypasses_the_cache_and_serves_history() {
    let h = harness(false);
    seed_containers(
        &h,
        vec![FakeEngine::container("c1", "web", ContainerState::Running)],
    );
    h.fake.set_probe(
        "c1",
        CpuProbe {
            current: CpuSample {
                total_usage: 200_000_000,
                system_usage: 2_000_000_000,
                online_cpus: 2,
            },
            previous: Some(CpuSample {
                total_usage: 100_000_000,
                system_usage: 1_000_000_000,
                online_cpus: 2,
            }),
        },
    );
    for pct in [1.0, 2.0, 3.0] {
        h.cache.update(HashMap::from([("c1".to_string(), pct)]));
    }

    let body = call_tool(
        &h.server,
        "get_stats",
        json!({"containers": ["web"], "history": true}),
    )
    .await;
    let rows: Vec<Value> = serde_json::from_str(&tool_text(&body)).unwrap();
    assert_eq!(rows.len(), 1);
    // (0.1 / 1.0) * 2 cpus * 100 = 20%
    assert_eq!(rows[0]["cpu_percent"], "20.0");
    assert_eq!(
        rows[0]["cpu_history"],
        json!([1.0, 2.0, 3.0]),
        "history comes from the sampler cache"
    );

    let body = call_tool(&h.server, "get_stats", json!({"containers": ["web"]})).await;
    let rows: Vec<Value> = serde_json::from_str(&tool_text(&body)).unwrap();
    assert!(rows[0].get("cpu_history").is_none());
}

#[tokio::test]
async fn lifecycle_tools_report_per_container_outcomes() {
    let h = harness(false);
    seed_containers(
        &h,
        vec![
            FakeEngine::container("c1", "web", ContainerState::Exited),
            FakeEngine::container("c2", "db", ContainerState::Exited),
        ],
    );
    h.fake.fail_actions_for("c2");

    let body = call_tool(
        &h.server,
        "start_container",
        json!({"containers": ["web", "db"]}),
    )
    .await;
    let text = tool_text(&body);
    assert!(text.contains("✓ web: started successfully"));
    assert!(text.contains("✗ db:"));
    assert_eq!(
        h.fake.actions(),
        vec![
            ("start".to_string(), "c1".to_string()),
            ("start".to_string(), "c2".to_string()),
        ]
    );
}

#[tokio::test]
async fn lifecycle_tools_short_circuit_redundant_transitions() {
    let h = harness(false);
    seed_containers(
        &h,
        vec![
            FakeEngine::container("c1", "web", ContainerState::Exited),
            FakeEngine::container("c2", "db", ContainerState::Running),
        ],
    );

    let body = call_tool(&h.server, "stop_container", json!({"containers": ["web"]})).await;
    assert!(tool_text(&body).contains("✓ web: already stopped"));

    let body = call_tool(&h.server, "start_container", json!({"containers": ["db"]})).await;
    assert!(tool_text(&body).contains("✓ db: already running"));

    // Neither redundant transition reached the engine
    assert!(h.fake.actions().is_empty());

    let body = call_tool(&h.server, "restart_container", json!({"containers": ["db"]})).await;
    assert!(tool_text(&body).contains("✓ db: restarted successfully"));
    assert_eq!(h.fake.actions(), vec![("restart".to_string(), "c2".to_string())]);
}

#[tokio::test]
async fn unknown_tools_are_rejected() {
    let h = harness(false);
    let body = call_tool(&h.server, "remove_everything", json!({})).await;
    assert_eq!(body["error"]["code"], -32602);
}
