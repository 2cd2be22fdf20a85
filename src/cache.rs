// Instant-read CPU cache shared with the remote interface

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Local};

/// Depth of the per-container percent history served by get_stats.
pub const HISTORY_DEPTH: usize = 10;

#[derive(Default)]
struct CacheState {
    current: HashMap<String, f64>,
    history: HashMap<String, Vec<f64>>,
    last_refresh: Option<DateTime<Local>>,
}

/// Single-writer many-readers CPU percent map. `update` replaces the whole
/// map, so readers always see a fully-populated snapshot.
#[derive(Default)]
pub struct CpuCache {
    state: RwLock<CacheState>,
}

impl CpuCache {
    pub fn new() -> Self {
        CpuCache::default()
    }

    pub fn update(&self, values: HashMap<String, f64>) {
        let mut state = self.state.write().unwrap();
        for (id, pct) in &values {
            let history = state.history.entry(id.clone()).or_default();
            history.push(*pct);
            if history.len() > HISTORY_DEPTH {
                let excess = history.len() - HISTORY_DEPTH;
                history.drain(..excess);
            }
        }
        state.history.retain(|id, _| values.contains_key(id));
        state.current = values;
        state.last_refresh = Some(Local::now());
    }

    pub fn get(&self) -> HashMap<String, f64> {
        self.state.read().unwrap().current.clone()
    }

    pub fn get_one(&self, container_id: &str) -> f64 {
        self.state
            .read()
            .unwrap()
            .current
            .get(container_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn history(&self, container_id: &str) -> Vec<f64> {
        self.state
            .read()
            .unwrap()
            .history
            .get(container_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Local>> {
        self.state.read().unwrap().last_refresh
    }

    /// Drop per-container state for ids that left the inventory.
    pub fn prune(&self, live: &HashSet<String>) {
        let mut state = self.state.write().unwrap();
        state.current.retain(|id, _| live.contains(id));
        state.history.retain(|id, _| live.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_replaces_the_whole_map() {
        let cache = CpuCache::new();
        cache.update(HashMap::from([("a".to_string(), 10.0)]));
        cache.update(HashMap::from([("b".to_string(), 20.0)]));

        assert_eq!(cache.get_one("a"), 0.0);
        assert_eq!(cache.get_one("b"), 20.0);
        assert_eq!(cache.get().len(), 1);
    }

    #[test]
    fn last_refresh_is_set_by_update() {
        let cache = CpuCache::new();
        assert!(cache.last_refresh().is_none());
        cache.update(HashMap::new());
        assert!(cache.last_refresh().is_some());
    }

    #[test]
    fn history_is_capped_at_depth() {
        let cache = CpuCache::new();
        for i in 0..15 {
            cache.update(HashMap::from([("a".to_string(), i as f64)]));
        }
        let history = cache.history("a");
        assert_eq!(history.len(), HISTORY_DEPTH);
        assert_eq!(history[0], 5.0);
        assert_eq!(history[HISTORY_DEPTH - 1], 14.0);
    }

    #[test]
    fn history_of_departed_containers_is_dropped_on_update() {
        let cache = CpuCache::new();
        cache.update(HashMap::from([("a".to_string(), 1.0)]));
        cache.update(HashMap::from([("b".to_string(), 2.0)]));
        assert!(cache.history("a").is_empty());
    }

    #[test]
    fn prune_drops_dead_ids() {
        let cache = CpuCache::new();
        cache.update(HashMap::from([
            ("a".to_string(), 1.0),
            ("b".to_string(), 2.0),
        ]));
        cache.prune(&HashSet::from(["b".to_string()]));
        assert_eq!(cache.get_one("a"), 0.0);
        assert_eq!(cache.get_one("b"), 2.0);
    }
}
