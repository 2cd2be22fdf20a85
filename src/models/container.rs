// Container inventory models

use serde::{Deserialize, Serialize};

/// Container state; serializes to lowercase JSON (e.g. "running").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Exited,
    Paused,
    Restarting,
    Created,
    Dead,
    #[serde(other)]
    Other,
}

impl ContainerState {
    /// Parse from an engine state string (e.g. "running", "exited").
    pub fn from_engine(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" => ContainerState::Running,
            "exited" => ContainerState::Exited,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "created" => ContainerState::Created,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Created => "created",
            ContainerState::Dead => "dead",
            ContainerState::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl PortProtocol {
    pub fn from_engine(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "udp" => PortProtocol::Udp,
            _ => PortProtocol::Tcp,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBinding {
    pub public_port: Option<u16>,
    pub private_port: u16,
    pub protocol: PortProtocol,
    pub ip: Option<String>,
}

/// One container as observed by a single inventory tick. Immutable within a
/// tick; replaced wholesale on the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub id: String,
    pub names: Vec<String>,
    pub state: ContainerState,
    pub status: String,
    pub ports: Vec<PortBinding>,
}

impl ContainerSnapshot {
    /// First 12 characters of the id.
    pub fn short_id(&self) -> &str {
        let end = self.id.len().min(12);
        &self.id[..end]
    }

    /// First name with the leading slash stripped; short id when no names.
    pub fn display_name(&self) -> String {
        match self.names.first() {
            Some(name) if !name.is_empty() => name.trim_start_matches('/').to_string(),
            _ => self.short_id().to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}
