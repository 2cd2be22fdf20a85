// CPU usage sampler: oneshot stats sweeps on a fixed cadence, delta-based
// percent against the previous sweep, results published to the shared cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, timeout, timeout_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::CpuCache;
use crate::engine::ContainerEngine;
use crate::guards;
use crate::models::{ContainerSnapshot, CpuSample};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);
const STATS_TIMEOUT: Duration = Duration::from_secs(2);

/// Cap against aberrant values around engine restarts.
const CPU_PERCENT_CAP: f64 = 999.0;

/// CPU percent between two cumulative samples. Can exceed 100 when the
/// container uses more than one core.
///
/// The previous sample comes from our own last sweep; the engine's precpu
/// field in oneshot mode is unreliable (it reflects container start).
pub fn cpu_percent(current: &CpuSample, previous: &CpuSample) -> f64 {
    if current.total_usage == 0 || previous.total_usage == 0 {
        return 0.0;
    }
    if current.system_usage > previous.system_usage && current.total_usage >= previous.total_usage {
        let cpu_delta = (current.total_usage - previous.total_usage) as f64;
        let system_delta = (current.system_usage - previous.system_usage) as f64;
        let ncpu = current.online_cpus.max(1) as f64;
        ((cpu_delta / system_delta) * ncpu * 100.0).min(CPU_PERCENT_CAP)
    } else {
        0.0
    }
}

/// One sweep: fetch oneshot stats for every running container concurrently,
/// compute percents against `prev`, and replace `prev` with this sweep's
/// samples. Collection is bounded by the cadence; stragglers write into the
/// buffered channel and are abandoned.
pub async fn sample_once(
    engine: &Arc<dyn ContainerEngine>,
    containers: &[ContainerSnapshot],
    prev: &mut HashMap<String, CpuSample>,
) -> HashMap<String, f64> {
    let running: Vec<String> = containers
        .iter()
        .filter(|c| c.is_running())
        .map(|c| c.id.clone())
        .collect();

    let (tx, mut rx) = mpsc::channel::<(String, Option<CpuSample>)>(running.len().max(1));
    for id in &running {
        let engine = engine.clone();
        let tx = tx.clone();
        let id = id.clone();
        guards::safe_spawn(&format!("cpu-sample-{}", &id[..id.len().min(12)]), async move {
            let sample = match timeout(STATS_TIMEOUT, engine.stats_oneshot(&id)).await {
                Ok(Ok(probe)) => Some(probe.current),
                _ => None,
            };
            // Channel is sized to the sweep, so a straggler never blocks
            let _ = tx.try_send((id, sample));
        });
    }
    drop(tx);

    let deadline = tokio::time::Instant::now() + SAMPLE_INTERVAL;
    let mut fresh: HashMap<String, CpuSample> = HashMap::new();
    let mut percents: HashMap<String, f64> = HashMap::new();
    loop {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some((id, Some(sample)))) => {
                let pct = prev
                    .get(&id)
                    .map(|p| cpu_percent(&sample, p))
                    .unwrap_or(0.0);
                percents.insert(id.clone(), pct);
                fresh.insert(id, sample);
            }
            // Per-container errors are dropped silently
            Ok(Some((_, None))) => {}
            Ok(None) => break,
            // Sweep deadline: publish whatever has been collected
            Err(_) => break,
        }
    }

    *prev = fresh;
    percents
}

pub struct SamplerDeps {
    pub engine: Arc<dyn ContainerEngine>,
    pub cache: Arc<CpuCache>,
    pub containers: Arc<RwLock<Vec<ContainerSnapshot>>>,
    pub cancel: CancellationToken,
}

pub fn spawn(deps: SamplerDeps) -> tokio::task::JoinHandle<()> {
    let SamplerDeps {
        engine,
        cache,
        containers,
        cancel,
    } = deps;

    guards::safe_spawn("cpu-sampler", async move {
        let mut tick = interval(SAMPLE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut prev: HashMap<String, CpuSample> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let list = { containers.read().unwrap().clone() };
            let percents = sample_once(&engine, &list, &mut prev).await;
            cache.update(percents);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::models::ContainerState;

    fn sample(total: u64, system: u64, cpus: u32) -> CpuSample {
        CpuSample {
            total_usage: total,
            system_usage: system,
            online_cpus: cpus,
        }
    }

    #[test]
    fn percent_follows_the_delta_formula() {
        let p = sample(50_000_000, 500_000_000, 2);
        let c = sample(100_000_000, 1_000_000_000, 2);
        let pct = cpu_percent(&c, &p);
        assert!((pct - 20.0).abs() < 0.01);
    }

    #[test]
    fn percent_is_capped_at_999() {
        let p = sample(10_000_000_000, 10_000_000_000, 1);
        let c = sample(120_000_000_000, 20_000_000_000, 1);
        assert_eq!(cpu_percent(&c, &p), 999.0);
    }

    #[test]
    fn percent_is_zero_when_a_total_is_zero() {
        assert_eq!(cpu_percent(&sample(0, 100, 1), &sample(10, 50, 1)), 0.0);
        assert_eq!(cpu_percent(&sample(10, 100, 1), &sample(0, 50, 1)), 0.0);
    }

    #[test]
    fn percent_is_zero_without_system_progress() {
        let p = sample(50, 500, 1);
        let c = sample(100, 500, 1);
        assert_eq!(cpu_percent(&c, &p), 0.0);
    }

    #[test]
    fn percent_is_zero_when_total_went_backwards() {
        let p = sample(100, 500, 1);
        let c = sample(50, 600, 1);
        assert_eq!(cpu_percent(&c, &p), 0.0);
    }

    #[tokio::test]
    async fn sweep_computes_percent_only_with_a_previous_sample() {
        let fake = Arc::new(FakeEngine::new());
        let containers = vec![FakeEngine::container("c1", "web", ContainerState::Running)];
        fake.set_sample("c1", sample(100, 1_000, 1));

        let engine: Arc<dyn ContainerEngine> = fake.clone();
        let mut prev = HashMap::new();

        let first = sample_once(&engine, &containers, &mut prev).await;
        assert_eq!(first.get("c1"), Some(&0.0));
        assert_eq!(prev.len(), 1);

        fake.set_sample("c1", sample(200, 2_000, 1));
        let second = sample_once(&engine, &containers, &mut prev).await;
        assert!((second.get("c1").unwrap() - 10.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn sweep_skips_failing_containers_and_non_running() {
        let fake = Arc::new(FakeEngine::new());
        let containers = vec![
            FakeEngine::container("up", "web", ContainerState::Running),
            FakeEngine::container("down", "db", ContainerState::Exited),
            FakeEngine::container("broken", "cache", ContainerState::Running),
        ];
        fake.set_sample("up", sample(100, 1_000, 1));
        // "broken" has no scripted sample: its fetch errors and is dropped

        let engine: Arc<dyn ContainerEngine> = fake.clone();
        let mut prev = HashMap::new();
        let percents = sample_once(&engine, &containers, &mut prev).await;

        assert!(percents.contains_key("up"));
        assert!(!percents.contains_key("down"));
        assert!(!percents.contains_key("broken"));
    }

    #[tokio::test]
    async fn departed_containers_lose_their_previous_sample() {
        let fake = Arc::new(FakeEngine::new());
        fake.set_sample("c1", sample(100, 1_000, 1));
        let engine: Arc<dyn ContainerEngine> = fake.clone();

        let mut prev = HashMap::new();
        let containers = vec![FakeEngine::container("c1", "web", ContainerState::Running)];
        sample_once(&engine, &containers, &mut prev).await;
        assert!(prev.contains_key("c1"));

        sample_once(&engine, &[], &mut prev).await;
        assert!(prev.is_empty());
    }
}
