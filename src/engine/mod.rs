// Container engine adapter: bollard for the typed endpoints, a raw socket
// reader for the framed log endpoint.

pub mod fake;
pub mod frames;
mod raw_logs;

use std::pin::Pin;

use async_trait::async_trait;
use bollard::query_parameters::{
    InspectContainerOptions, ListContainersOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::secret::{ContainerStatsResponse, ContainerSummary, PortTypeEnum};
use bollard::Docker;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::EngineError;
use crate::models::{ContainerSnapshot, ContainerState, CpuProbe, CpuSample, PortBinding, PortProtocol};

/// Raw bytes of a (possibly followed) log response, framed per the engine's
/// multiplexed wire format.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, EngineError>> + Send>>;

#[derive(Debug, Clone, Copy)]
pub struct LogStreamOptions {
    pub follow: bool,
    pub tail: u64,
    pub stdout: bool,
    pub stderr: bool,
}

impl LogStreamOptions {
    pub fn follow(tail: u64) -> Self {
        LogStreamOptions {
            follow: true,
            tail,
            stdout: true,
            stderr: true,
        }
    }

    pub fn oneshot(tail: u64) -> Self {
        LogStreamOptions {
            follow: false,
            tail,
            stdout: true,
            stderr: true,
        }
    }
}

/// The engine operations the fabric consumes. Deadlines are imposed by the
/// callers; implementations must stay cancel-safe.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list(&self, all: bool) -> Result<Vec<ContainerSnapshot>, EngineError>;

    async fn is_running(&self, id: &str) -> Result<bool, EngineError>;

    async fn open_logs(&self, id: &str, opts: LogStreamOptions) -> Result<ByteStream, EngineError>;

    /// One oneshot stats snapshot reduced to the CPU counters.
    async fn stats_oneshot(&self, id: &str) -> Result<CpuProbe, EngineError>;

    async fn start(&self, id: &str) -> Result<(), EngineError>;

    async fn stop(&self, id: &str, timeout_secs: i32) -> Result<(), EngineError>;

    async fn restart(&self, id: &str, timeout_secs: i32) -> Result<(), EngineError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError>;

    async fn pause(&self, id: &str) -> Result<(), EngineError>;

    async fn unpause(&self, id: &str) -> Result<(), EngineError>;
}

pub struct DockerEngine {
    docker: Docker,
    socket_path: String,
}

impl DockerEngine {
    /// Connect using the standard engine environment (DOCKER_HOST etc.).
    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_defaults()?;
        Ok(DockerEngine {
            docker,
            socket_path: raw_logs::socket_path_from_env(),
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list(&self, all: bool) -> Result<Vec<ContainerSnapshot>, EngineError> {
        let options = ListContainersOptions {
            all,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(EngineError::from_bollard)?;
        Ok(containers.iter().map(snapshot_from_summary).collect())
    }

    async fn is_running(&self, id: &str) -> Result<bool, EngineError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(EngineError::from_bollard)?;
        Ok(inspect
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }

    async fn open_logs(&self, id: &str, opts: LogStreamOptions) -> Result<ByteStream, EngineError> {
        raw_logs::open(&self.socket_path, id, opts).await
    }

    async fn stats_oneshot(&self, id: &str) -> Result<CpuProbe, EngineError> {
        // stream=false keeps the daemon's previous reading in precpu; the
        // one_shot variant leaves it empty
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(id, Some(options));
        let stats = match stream.next().await {
            Some(Ok(s)) => s,
            Some(Err(e)) => return Err(EngineError::from_bollard(e)),
            None => {
                return Err(EngineError::Protocol(format!(
                    "empty stats response for {id}"
                )))
            }
        };
        cpu_probe_from_stats(&stats).ok_or_else(|| {
            EngineError::Protocol(format!("stats response for {id} carries no CPU counters"))
        })
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(EngineError::from_bollard)
    }

    async fn stop(&self, id: &str, timeout_secs: i32) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: Some(timeout_secs),
            ..Default::default()
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(EngineError::from_bollard)
    }

    async fn restart(&self, id: &str, timeout_secs: i32) -> Result<(), EngineError> {
        let options = RestartContainerOptions {
            t: Some(timeout_secs),
            ..Default::default()
        };
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(EngineError::from_bollard)
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(EngineError::from_bollard)
    }

    async fn pause(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .pause_container(id)
            .await
            .map_err(EngineError::from_bollard)
    }

    async fn unpause(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(EngineError::from_bollard)
    }
}

fn snapshot_from_summary(c: &ContainerSummary) -> ContainerSnapshot {
    let ports = c
        .ports
        .as_ref()
        .map(|ports| {
            ports
                .iter()
                .map(|p| PortBinding {
                    public_port: p.public_port,
                    private_port: p.private_port,
                    protocol: match p.typ {
                        Some(PortTypeEnum::UDP) => PortProtocol::Udp,
                        _ => PortProtocol::Tcp,
                    },
                    ip: p.ip.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    ContainerSnapshot {
        id: c.id.clone().unwrap_or_default(),
        names: c.names.clone().unwrap_or_default(),
        state: c
            .state
            .as_ref()
            .map(|s| ContainerState::from_engine(&s.to_string()))
            .unwrap_or(ContainerState::Other),
        status: c.status.clone().unwrap_or_default(),
        ports,
    }
}

/// Reduce one set of CPU stats to our counters, resolving the cpu-count
/// fallback chain (online_cpus, then per-cpu vector length, then 1).
fn sample_from_cpu_stats(cpu_stats: &bollard::secret::ContainerCpuStats) -> Option<CpuSample> {
    let cpu_usage = cpu_stats.cpu_usage.as_ref()?;

    let online_cpus = match cpu_stats.online_cpus {
        Some(n) if n > 0 => n,
        _ => {
            let percpu = cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u32)
                .unwrap_or(0);
            if percpu > 0 {
                percpu
            } else {
                1
            }
        }
    };

    Some(CpuSample {
        total_usage: cpu_usage.total_usage.unwrap_or(0),
        system_usage: cpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus,
    })
}

pub(crate) fn cpu_probe_from_stats(s: &ContainerStatsResponse) -> Option<CpuProbe> {
    let current = sample_from_cpu_stats(s.cpu_stats.as_ref()?)?;
    let previous = s.precpu_stats.as_ref().and_then(sample_from_cpu_stats);
    Some(CpuProbe { current, previous })
}
