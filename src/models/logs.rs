// Log stream and telemetry models

use bytes::Bytes;
use chrono::{DateTime, Local};

/// Which output stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Stream id byte of the engine's framed wire format. Stdin (0) and
    /// unknown ids are folded into stdout.
    pub fn from_wire(id: u8) -> Self {
        match id {
            2 => StreamKind::Stderr,
            _ => StreamKind::Stdout,
        }
    }
}

/// One decoded unit of the engine's interleaved log wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub stream: StreamKind,
    pub payload: Bytes,
}

/// One line as delivered to consumers.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub container_id: String,
    pub container_name: String,
    pub line: String,
    pub timestamp: DateTime<Local>,
    pub is_separator: bool,
}

impl LogEntry {
    pub fn new(container_id: &str, container_name: &str, line: &str) -> Self {
        LogEntry {
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            line: line.to_string(),
            timestamp: Local::now(),
            is_separator: false,
        }
    }

    pub fn separator() -> Self {
        LogEntry {
            container_id: String::new(),
            container_name: String::new(),
            line: String::new(),
            timestamp: Local::now(),
            is_separator: true,
        }
    }
}

/// Cumulative CPU counters from one oneshot stats snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    pub total_usage: u64,
    pub system_usage: u64,
    pub online_cpus: u32,
}

/// One oneshot stats probe: the current counters plus the engine's own
/// previous reading when the endpoint carries one. The sampler ignores
/// `previous` (it keeps its own history across sweeps); the synchronous
/// stats path uses it for a single-call percent.
#[derive(Debug, Clone, Copy)]
pub struct CpuProbe {
    pub current: CpuSample,
    pub previous: Option<CpuSample>,
}

impl CpuProbe {
    pub fn current_only(current: CpuSample) -> Self {
        CpuProbe {
            current,
            previous: None,
        }
    }
}
