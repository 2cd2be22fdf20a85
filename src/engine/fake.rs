// Scripted in-memory engine for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};

use super::{ByteStream, ContainerEngine, LogStreamOptions};
use crate::error::EngineError;
use crate::models::{ContainerSnapshot, ContainerState, CpuProbe, CpuSample};

/// One scripted log connection: its chunks are yielded in order, then the
/// stream either ends (EOF) or stays open without producing more data.
pub struct ScriptedConnection {
    pub chunks: Vec<Bytes>,
    pub hold_open: bool,
}

impl ScriptedConnection {
    pub fn then_eof(chunks: Vec<Bytes>) -> Self {
        ScriptedConnection {
            chunks,
            hold_open: false,
        }
    }

    pub fn then_hold(chunks: Vec<Bytes>) -> Self {
        ScriptedConnection {
            chunks,
            hold_open: true,
        }
    }
}

#[derive(Default)]
struct FakeState {
    containers: Vec<ContainerSnapshot>,
    log_scripts: HashMap<String, VecDeque<ScriptedConnection>>,
    opens: Vec<(String, LogStreamOptions)>,
    probes: HashMap<String, CpuProbe>,
    actions: Vec<(String, String)>,
    failing: HashSet<String>,
}

#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        FakeEngine::default()
    }

    /// Convenience snapshot with a single name.
    pub fn container(id: &str, name: &str, state: ContainerState) -> ContainerSnapshot {
        ContainerSnapshot {
            id: id.to_string(),
            names: vec![format!("/{name}")],
            state,
            status: match state {
                ContainerState::Running => "Up 5 minutes".to_string(),
                _ => "Exited (0) 2 minutes ago".to_string(),
            },
            ports: vec![],
        }
    }

    /// Encode one frame of the multiplexed wire format.
    pub fn frame(stream_id: u8, payload: &[u8]) -> Bytes {
        let mut out = vec![stream_id, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        Bytes::from(out)
    }

    pub fn set_containers(&self, containers: Vec<ContainerSnapshot>) {
        self.state.lock().unwrap().containers = containers;
    }

    pub fn push_connection(&self, id: &str, conn: ScriptedConnection) {
        self.state
            .lock()
            .unwrap()
            .log_scripts
            .entry(id.to_string())
            .or_default()
            .push_back(conn);
    }

    pub fn set_sample(&self, id: &str, sample: CpuSample) {
        self.set_probe(id, CpuProbe::current_only(sample));
    }

    pub fn set_probe(&self, id: &str, probe: CpuProbe) {
        self.state
            .lock()
            .unwrap()
            .probes
            .insert(id.to_string(), probe);
    }

    /// Make every lifecycle call against `id` fail.
    pub fn fail_actions_for(&self, id: &str) {
        self.state.lock().unwrap().failing.insert(id.to_string());
    }

    /// Every `open_logs` call observed so far, in order.
    pub fn opens(&self) -> Vec<(String, LogStreamOptions)> {
        self.state.lock().unwrap().opens.clone()
    }

    /// Every lifecycle call observed so far, as (operation, id).
    pub fn actions(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().actions.clone()
    }

    fn record_action(&self, op: &str, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.actions.push((op.to_string(), id.to_string()));
        if state.failing.contains(id) {
            return Err(EngineError::Internal(format!("{op} {id} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn list(&self, all: bool) -> Result<Vec<ContainerSnapshot>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.is_running())
            .cloned()
            .collect())
    }

    async fn is_running(&self, id: &str) -> Result<bool, EngineError> {
        let state = self.state.lock().unwrap();
        match state.containers.iter().find(|c| c.id == id) {
            Some(c) => Ok(c.is_running()),
            None => Err(EngineError::NotFound(id.to_string())),
        }
    }

    async fn open_logs(&self, id: &str, opts: LogStreamOptions) -> Result<ByteStream, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.opens.push((id.to_string(), opts));
        let conn = state
            .log_scripts
            .get_mut(id)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| ScriptedConnection::then_hold(vec![]));

        let chunks = stream::iter(conn.chunks.into_iter().map(Ok));
        if conn.hold_open {
            Ok(Box::pin(chunks.chain(stream::pending())))
        } else {
            Ok(Box::pin(chunks))
        }
    }

    async fn stats_oneshot(&self, id: &str) -> Result<CpuProbe, EngineError> {
        let state = self.state.lock().unwrap();
        state
            .probes
            .get(id)
            .copied()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.record_action("start", id)
    }

    async fn stop(&self, id: &str, _timeout_secs: i32) -> Result<(), EngineError> {
        self.record_action("stop", id)
    }

    async fn restart(&self, id: &str, _timeout_secs: i32) -> Result<(), EngineError> {
        self.record_action("restart", id)
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<(), EngineError> {
        self.record_action("remove", id)
    }

    async fn pause(&self, id: &str) -> Result<(), EngineError> {
        self.record_action("pause", id)
    }

    async fn unpause(&self, id: &str) -> Result<(), EngineError> {
        self.record_action("unpause", id)
    }
}
