// The six remote tools: reads of the cache/broker/tracker, writes to the
// engine adapter.

use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tokio::time::{timeout, timeout_at, Instant};

use super::types::{ContainerActionArgs, GetLogsArgs, GetStatsArgs, ListContainersArgs};
use super::RpcState;
use crate::error::EngineError;
use crate::models::{ContainerSnapshot, PortBinding};
use crate::sampler::cpu_percent;
use crate::text::{display_name, strip_ansi};

const REFRESH_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_TIMEOUT: Duration = Duration::from_secs(2);
const ACTION_BATCH_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_GRACE_SECS: i32 = 10;

const DEFAULT_LOG_LINES: u64 = 100;
const MAX_LOG_LINES: u64 = 10_000;

/// The inventory loop's last list, or a synchronous refresh when no tick has
/// landed yet.
async fn current_containers(state: &RpcState) -> Result<Vec<ContainerSnapshot>, EngineError> {
    let cached = state.containers.read().unwrap().clone();
    if !cached.is_empty() {
        return Ok(cached);
    }
    let mut list = timeout(REFRESH_TIMEOUT, state.engine.list(true))
        .await
        .map_err(|_| EngineError::deadline("container list"))??;
    list.sort_by_key(|c| c.display_name().to_lowercase());
    Ok(list)
}

/// Partial name or id match; the first hit per query wins.
async fn match_by_name(
    state: &RpcState,
    queries: &[String],
) -> Result<Vec<ContainerSnapshot>, EngineError> {
    let all = current_containers(state).await?;
    let mut matched = Vec::new();
    for query in queries {
        let q = query.to_lowercase();
        if let Some(c) = all
            .iter()
            .find(|c| c.display_name().to_lowercase().contains(&q) || c.id.to_lowercase().contains(&q))
        {
            matched.push(c.clone());
        }
    }
    Ok(matched)
}

fn shown_name(state: &RpcState, c: &ContainerSnapshot) -> String {
    display_name(&c.display_name(), state.demo_mode)
}

pub(super) fn format_rate(rate: f64) -> String {
    if rate >= 1000.0 {
        format!("{:.1}k", rate / 1000.0)
    } else if rate >= 1.0 {
        format!("{rate:.0}")
    } else if rate > 0.0 {
        format!("{rate:.1}")
    } else {
        "0".to_string()
    }
}

pub(super) fn format_ports(ports: &[PortBinding]) -> String {
    let parts: Vec<String> = ports
        .iter()
        .map(|p| match p.public_port {
            Some(public) => format!("{}:{}/{}", public, p.private_port, p.protocol.as_str()),
            None => format!("{}/{}", p.private_port, p.protocol.as_str()),
        })
        .collect();
    parts.join(", ")
}

pub(super) async fn list_containers(
    state: &RpcState,
    args: ListContainersArgs,
) -> Result<String, EngineError> {
    let containers = current_containers(state).await?;
    let cpu = state.cache.get();

    let mut rows = Vec::new();
    for c in &containers {
        if !args.all && !c.is_running() {
            continue;
        }
        let name = shown_name(state, c);
        if !args.name_filter.is_empty()
            && !name
                .to_lowercase()
                .contains(&args.name_filter.to_lowercase())
        {
            continue;
        }
        if !args.state_filter.is_empty() && !args.state_filter.eq_ignore_ascii_case(c.state.as_str())
        {
            continue;
        }

        rows.push(json!({
            "id": c.short_id(),
            "name": name,
            "state": c.state.as_str(),
            "status": c.status,
            "cpu_percent": format!("{:.1}", cpu.get(&c.id).copied().unwrap_or(0.0)),
            "log_rate": format_rate(state.rate_tracker.rate(&c.id)),
            "ports": format_ports(&c.ports),
        }));
    }

    serde_json::to_string_pretty(&rows).map_err(|e| EngineError::Internal(e.to_string()))
}

pub(super) async fn get_logs(state: &RpcState, args: GetLogsArgs) -> Result<String, EngineError> {
    let lines = if args.lines == 0 {
        DEFAULT_LOG_LINES
    } else {
        args.lines.min(MAX_LOG_LINES)
    };

    let containers = if args.containers.is_empty() {
        // No containers specified: search across all of them
        current_containers(state).await?
    } else {
        match_by_name(state, &args.containers).await?
    };
    if containers.is_empty() {
        return Ok("No containers found".to_string());
    }

    let filter_regex = if !args.filter.is_empty() && args.is_regex {
        Some(
            Regex::new(&format!("(?i){}", args.filter))
                .map_err(|e| EngineError::Invalid(format!("invalid regex pattern: {e}")))?,
        )
    } else {
        None
    };
    let filter_lower = args.filter.to_lowercase();

    let ids: Vec<String> = containers.iter().map(|c| c.id.clone()).collect();
    let logs = state.broker.fetch_recent_logs(&ids, lines).await;

    let mut output = String::new();
    for c in &containers {
        let name = shown_name(state, c);
        output.push_str(&format!("=== Container: {name} ===\n"));

        let container_lines = logs.get(&c.id).map(Vec::as_slice).unwrap_or(&[]);
        if container_lines.is_empty() {
            output.push_str("(no logs available)\n\n");
            continue;
        }

        let filtered: Vec<&String> = container_lines
            .iter()
            .filter(|line| {
                if args.filter.is_empty() {
                    return true;
                }
                // Match against the visible text, not the color codes
                let content = strip_ansi(line);
                match &filter_regex {
                    Some(re) => re.is_match(&content),
                    None => content.to_lowercase().contains(&filter_lower),
                }
            })
            .collect();

        if filtered.is_empty() {
            output.push_str("(no matching logs)\n\n");
        } else {
            for line in filtered {
                output.push_str(&format!("[{name}] {line}\n"));
            }
            output.push('\n');
        }
    }

    Ok(output)
}

pub(super) async fn get_stats(state: &RpcState, args: GetStatsArgs) -> Result<String, EngineError> {
    let matched = match_by_name(state, &args.containers).await?;
    if matched.is_empty() {
        return Ok("No containers found matching the specified names".to_string());
    }

    let mut rows = Vec::new();
    for c in &matched {
        // Fresh oneshot probe; the shared cache is deliberately bypassed
        let mut cpu_pct = 0.0;
        if c.is_running() {
            if let Ok(Ok(probe)) = timeout(STATS_TIMEOUT, state.engine.stats_oneshot(&c.id)).await {
                if let Some(previous) = probe.previous {
                    cpu_pct = cpu_percent(&probe.current, &previous);
                }
            }
        }

        let mut row = json!({
            "id": c.short_id(),
            "name": shown_name(state, c),
            "state": c.state.as_str(),
            "cpu_percent": format!("{cpu_pct:.1}"),
            "log_rate": format!("{:.1}", state.rate_tracker.rate(&c.id)),
            "status": c.status,
            "ports": format_ports(&c.ports),
        });
        if args.history {
            row["cpu_history"] = json!(state.cache.history(&c.id));
        }
        rows.push(row);
    }

    serde_json::to_string_pretty(&rows).map_err(|e| EngineError::Internal(e.to_string()))
}

#[derive(Clone, Copy)]
enum LifecycleAction {
    Start,
    Stop,
    Restart,
}

impl LifecycleAction {
    fn verb(self) -> &'static str {
        match self {
            LifecycleAction::Start => "started",
            LifecycleAction::Stop => "stopped",
            LifecycleAction::Restart => "restarted",
        }
    }
}

async fn lifecycle(
    state: &RpcState,
    args: ContainerActionArgs,
    action: LifecycleAction,
) -> Result<String, EngineError> {
    let matched = match_by_name(state, &args.containers).await?;
    if matched.is_empty() {
        return Ok("No containers found matching the specified names".to_string());
    }

    let deadline = Instant::now() + ACTION_BATCH_TIMEOUT;
    let mut results = Vec::new();
    for c in &matched {
        let name = shown_name(state, c);

        match action {
            LifecycleAction::Start if c.is_running() => {
                results.push(format!("✓ {name}: already running"));
                continue;
            }
            LifecycleAction::Stop if !c.is_running() => {
                results.push(format!("✓ {name}: already stopped"));
                continue;
            }
            _ => {}
        }

        let call = async {
            match action {
                LifecycleAction::Start => state.engine.start(&c.id).await,
                LifecycleAction::Stop => state.engine.stop(&c.id, STOP_GRACE_SECS).await,
                LifecycleAction::Restart => state.engine.restart(&c.id, STOP_GRACE_SECS).await,
            }
        };
        let line = match timeout_at(deadline, call).await {
            Ok(Ok(())) => format!("✓ {name}: {} successfully", action.verb()),
            Ok(Err(e)) => format!("✗ {name}: {e}"),
            Err(_) => format!("✗ {name}: batch deadline exceeded"),
        };
        results.push(line);
    }

    Ok(results.join("\n"))
}

pub(super) async fn start_container(
    state: &RpcState,
    args: ContainerActionArgs,
) -> Result<String, EngineError> {
    lifecycle(state, args, LifecycleAction::Start).await
}

pub(super) async fn stop_container(
    state: &RpcState,
    args: ContainerActionArgs,
) -> Result<String, EngineError> {
    lifecycle(state, args, LifecycleAction::Stop).await
}

pub(super) async fn restart_container(
    state: &RpcState,
    args: ContainerActionArgs,
) -> Result<String, EngineError> {
    lifecycle(state, args, LifecycleAction::Restart).await
}
