// JSON-RPC envelope and tool argument schemas

use serde::Deserialize;
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

pub fn rpc_success(id: Option<Value>, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub fn rpc_failure(id: Option<Value>, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
}

#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListContainersArgs {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub name_filter: String,
    #[serde(default)]
    pub state_filter: String,
}

fn default_tail() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct GetLogsArgs {
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub lines: u64,
    #[serde(default = "default_tail")]
    pub tail: bool,
}

impl Default for GetLogsArgs {
    fn default() -> Self {
        GetLogsArgs {
            containers: Vec::new(),
            filter: String::new(),
            is_regex: false,
            lines: 0,
            tail: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GetStatsArgs {
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub history: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContainerActionArgs {
    #[serde(default)]
    pub containers: Vec<String>,
}

fn string_array(description: &str) -> Value {
    json!({
        "type": "array",
        "items": { "type": "string" },
        "description": description,
    })
}

/// Tool inventory as served by `tools/list`.
pub fn tool_descriptors() -> Vec<Value> {
    vec![
        json!({
            "name": "list_containers",
            "description": "List all containers with status and resource usage",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "all": {
                        "type": "boolean",
                        "description": "Include stopped containers (default: false, only running)",
                    },
                    "name_filter": {
                        "type": "string",
                        "description": "Filter by container name (case-insensitive substring)",
                    },
                    "state_filter": {
                        "type": "string",
                        "description": "Filter by state (running, exited, paused, restarting, ...)",
                    },
                },
            },
        }),
        json!({
            "name": "get_logs",
            "description": "Fetch container logs with optional filtering",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "containers": string_array(
                        "Container names or ids (partial matches). Empty searches ALL containers."
                    ),
                    "filter": {
                        "type": "string",
                        "description": "Keyword or regex pattern to filter log lines",
                    },
                    "is_regex": {
                        "type": "boolean",
                        "description": "Treat filter as regex (default: false, substring search)",
                    },
                    "lines": {
                        "type": "integer",
                        "description": "Maximum lines per container (default: 100, max: 10000)",
                    },
                    "tail": {
                        "type": "boolean",
                        "description": "Return most recent lines (default: true)",
                    },
                },
            },
        }),
        json!({
            "name": "get_stats",
            "description": "Get detailed resource statistics for specific containers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "containers": string_array("Container names or ids (partial matches)"),
                    "history": {
                        "type": "boolean",
                        "description": "Include 10-value CPU history (default: false)",
                    },
                },
                "required": ["containers"],
            },
        }),
        json!({
            "name": "start_container",
            "description": "Start one or more stopped containers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "containers": string_array("Container names or ids to act on (partial matches)"),
                },
                "required": ["containers"],
            },
        }),
        json!({
            "name": "stop_container",
            "description": "Stop one or more running containers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "containers": string_array("Container names or ids to act on (partial matches)"),
                },
                "required": ["containers"],
            },
        }),
        json!({
            "name": "restart_container",
            "description": "Restart one or more containers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "containers": string_array("Container names or ids to act on (partial matches)"),
                },
                "required": ["containers"],
            },
        }),
    ]
}

/// Count used by the health endpoint; must track the descriptor list.
pub fn tool_count() -> usize {
    6
}
