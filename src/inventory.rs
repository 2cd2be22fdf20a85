// Container inventory loop: periodic list refresh driving broker
// reconciliation and per-container bookkeeping cleanup.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broker::LogBroker;
use crate::cache::CpuCache;
use crate::consumers::RateTrackerConsumer;
use crate::engine::ContainerEngine;
use crate::error::EngineError;
use crate::guards;
use crate::models::ContainerSnapshot;

pub const INVENTORY_INTERVAL: Duration = Duration::from_secs(5);
const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct InventoryDeps {
    pub engine: Arc<dyn ContainerEngine>,
    pub broker: Arc<LogBroker>,
    pub rate_tracker: Arc<RateTrackerConsumer>,
    pub cache: Arc<CpuCache>,
    pub containers: Arc<RwLock<Vec<ContainerSnapshot>>>,
    pub cancel: CancellationToken,
}

/// One refresh: list everything, sort by display name, publish the snapshot
/// list, reconcile the broker, prune telemetry for departed containers.
pub async fn refresh_once(
    engine: &Arc<dyn ContainerEngine>,
    broker: &Arc<LogBroker>,
    cache: &CpuCache,
    containers: &RwLock<Vec<ContainerSnapshot>>,
) -> Result<usize, EngineError> {
    let mut list = timeout(LIST_TIMEOUT, engine.list(true))
        .await
        .map_err(|_| EngineError::deadline("container list"))??;
    list.sort_by_key(|c| c.display_name().to_lowercase());

    {
        // Write lock only to swap; readers copy before releasing
        *containers.write().unwrap() = list.clone();
    }

    let live: HashSet<String> = list.iter().map(|c| c.id.clone()).collect();
    let count = list.len();
    broker.start_streaming(list);
    cache.prune(&live);
    Ok(count)
}

pub fn spawn(deps: InventoryDeps) -> tokio::task::JoinHandle<()> {
    let InventoryDeps {
        engine,
        broker,
        rate_tracker,
        cache,
        containers,
        cancel,
    } = deps;

    guards::safe_spawn("inventory", async move {
        // First tick fires immediately so startup does not wait a full period
        let mut tick = interval(INVENTORY_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stale_sweep = interval_at(
            Instant::now() + STALE_SWEEP_INTERVAL,
            STALE_SWEEP_INTERVAL,
        );
        stale_sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(e) = refresh_once(&engine, &broker, &cache, &containers).await {
                        tracing::warn!(error = %e, "container list refresh failed");
                    }
                }
                _ = stale_sweep.tick() => {
                    rate_tracker.cleanup_stale();
                }
            }
        }
    })
}
