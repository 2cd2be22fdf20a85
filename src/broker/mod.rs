// Log broker: owns one stream task per running container and fans every
// decoded line out to the registered consumers.

mod stream;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::consumers::LogConsumer;
use crate::engine::frames::FrameDecoder;
use crate::engine::{ContainerEngine, LogStreamOptions};
use crate::guards;
use crate::models::ContainerSnapshot;

/// Upper bound on in-flight log reads across all stream tasks. Sized for a
/// burst of reconnects on a host with ~100 containers.
pub const MAX_CONCURRENT_READS: usize = 200;

const RECENT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

struct StreamHandle {
    token: CancellationToken,
    generation: u64,
}

pub struct LogBroker {
    engine: Arc<dyn ContainerEngine>,
    consumers: RwLock<Vec<Arc<dyn LogConsumer>>>,
    active_streams: RwLock<HashMap<String, StreamHandle>>,
    containers: RwLock<Vec<ContainerSnapshot>>,
    // Separate lock from the active-stream table; persists across stream
    // task restarts so a reconnect never re-tails
    initial_tail_done: RwLock<HashSet<String>>,
    read_permits: Arc<Semaphore>,
    generations: AtomicU64,
    root: CancellationToken,
}

impl LogBroker {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Arc<Self> {
        Arc::new(LogBroker {
            engine,
            consumers: RwLock::new(Vec::new()),
            active_streams: RwLock::new(HashMap::new()),
            containers: RwLock::new(Vec::new()),
            initial_tail_done: RwLock::new(HashSet::new()),
            read_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_READS)),
            generations: AtomicU64::new(0),
            root: CancellationToken::new(),
        })
    }

    /// Add a consumer. Idempotent by identity.
    pub fn register_consumer(&self, consumer: Arc<dyn LogConsumer>) {
        let mut consumers = self.consumers.write().unwrap();
        if !consumers.iter().any(|c| Arc::ptr_eq(c, &consumer)) {
            consumers.push(consumer);
        }
    }

    /// Remove a consumer by identity. Idempotent.
    pub fn unregister_consumer(&self, consumer: &Arc<dyn LogConsumer>) {
        let mut consumers = self.consumers.write().unwrap();
        consumers.retain(|c| !Arc::ptr_eq(c, consumer));
    }

    /// Reconcile stream tasks against a fresh container list: spawn one task
    /// per newly-running container, cancel tasks whose container is gone or
    /// stopped. Never spawns two tasks for the same id.
    pub fn start_streaming(self: &Arc<Self>, containers: Vec<ContainerSnapshot>) {
        *self.containers.write().unwrap() = containers.clone();

        // Check-and-insert under one lock; spawn after it is released
        let mut to_spawn = Vec::new();
        {
            let mut streams = self.active_streams.write().unwrap();
            for c in containers.iter().filter(|c| c.is_running()) {
                if streams.contains_key(&c.id) {
                    continue;
                }
                let token = self.root.child_token();
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                streams.insert(
                    c.id.clone(),
                    StreamHandle {
                        token: token.clone(),
                        generation,
                    },
                );
                to_spawn.push((c.id.clone(), c.display_name(), token, generation));
            }
        }

        for (id, name, token, generation) in to_spawn {
            let task = stream::StreamTask {
                broker: Arc::clone(self),
                id,
                name: name.clone(),
                generation,
                cancel: token,
            };
            guards::safe_spawn(&format!("stream-{name}"), task.run());
        }

        // Cancel streams for containers that are no longer running
        let running: HashSet<&str> = containers
            .iter()
            .filter(|c| c.is_running())
            .map(|c| c.id.as_str())
            .collect();
        let mut streams = self.active_streams.write().unwrap();
        streams.retain(|id, handle| {
            if running.contains(id.as_str()) {
                true
            } else {
                handle.token.cancel();
                false
            }
        });
    }

    /// Cancel every stream task, clear the table and the initial-tail set.
    /// Returns once every cancel handle has fired; task exit is not awaited.
    pub fn stop_all(&self) {
        let handles: Vec<StreamHandle> = {
            let mut streams = self.active_streams.write().unwrap();
            streams.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.token.cancel();
        }
        self.initial_tail_done.write().unwrap().clear();
    }

    /// Oneshot, non-streaming tail fetch for the remote interface. Ids not
    /// present in the last container list are skipped.
    pub async fn fetch_recent_logs(
        &self,
        container_ids: &[String],
        tail: u64,
    ) -> HashMap<String, Vec<String>> {
        let mut result = HashMap::new();
        for id in container_ids {
            let known = {
                let containers = self.containers.read().unwrap();
                containers.iter().any(|c| &c.id == id)
            };
            if !known {
                continue;
            }

            let lines = match timeout(RECENT_FETCH_TIMEOUT, self.read_oneshot(id, tail)).await {
                Ok(lines) => lines,
                Err(_) => Vec::new(),
            };
            result.insert(id.clone(), lines);
        }
        result
    }

    async fn read_oneshot(&self, id: &str, tail: u64) -> Vec<String> {
        let mut stream = match self
            .engine
            .open_logs(id, LogStreamOptions::oneshot(tail))
            .await
        {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };

        let mut decoder = FrameDecoder::new();
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let Ok(bytes) = chunk else { break };
            let out = decoder.feed(&bytes);
            lines.extend(
                out.frames
                    .iter()
                    .map(|f| String::from_utf8_lossy(&f.payload).into_owned()),
            );
            if out.protocol_error {
                break;
            }
        }
        lines
    }

    pub fn active_stream_count(&self) -> usize {
        self.active_streams.read().unwrap().len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().unwrap().len()
    }

    /// Permits currently free in the global read pool.
    pub fn available_read_permits(&self) -> usize {
        self.read_permits.available_permits()
    }

    /// The last container list pushed by the inventory loop.
    pub fn known_containers(&self) -> Vec<ContainerSnapshot> {
        self.containers.read().unwrap().clone()
    }

    pub(crate) fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub(crate) fn read_permits(&self) -> &Arc<Semaphore> {
        &self.read_permits
    }

    pub(crate) fn initial_tail_done(&self, id: &str) -> bool {
        self.initial_tail_done.read().unwrap().contains(id)
    }

    pub(crate) fn mark_initial_tail(&self, id: &str) {
        self.initial_tail_done.write().unwrap().insert(id.to_string());
    }

    /// Remove a table entry, but only the generation the caller owns; a
    /// newer task registered under the same id is left alone.
    pub(crate) fn remove_stream(&self, id: &str, generation: u64) {
        let mut streams = self.active_streams.write().unwrap();
        if streams
            .get(id)
            .is_some_and(|h| h.generation == generation)
        {
            streams.remove(id);
        }
    }

    /// Deliver one line to every registered consumer, synchronously, in
    /// registration order.
    pub(crate) fn fan_out(&self, container_id: &str, container_name: &str, line: &str) {
        let at = Instant::now();
        let consumers = self.consumers.read().unwrap();
        for consumer in consumers.iter() {
            consumer.on_line(container_id, container_name, line, at);
        }
    }

    pub(crate) fn notify_status(&self, container_id: &str, running: bool) {
        let consumers = self.consumers.read().unwrap();
        for consumer in consumers.iter() {
            consumer.on_status_change(container_id, running);
        }
    }
}

impl Drop for LogBroker {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

pub use stream::INITIAL_TAIL_LINES;
