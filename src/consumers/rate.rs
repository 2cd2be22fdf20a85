// Sliding-window log rate per container (lines/sec)

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use super::LogConsumer;

const WINDOW: Duration = Duration::from_secs(1);
const IDLE_CUTOFF: Duration = Duration::from_secs(2);
const STALE_CUTOFF: Duration = Duration::from_secs(5 * 60);

/// Hard cap on buffered timestamps per container (5k lines/sec worst case).
const MAX_ENTRIES: usize = 5000;

#[derive(Debug)]
struct RateWindow {
    stamps: VecDeque<Instant>,
    last_update: Instant,
}

impl RateWindow {
    fn new(now: Instant) -> Self {
        RateWindow {
            stamps: VecDeque::new(),
            last_update: now,
        }
    }

    fn add(&mut self, now: Instant) {
        self.last_update = now;

        // Prune before appending so the buffer never grows past the cap
        let cutoff = now - WINDOW;
        while self.stamps.front().is_some_and(|t| *t <= cutoff) {
            self.stamps.pop_front();
        }

        if self.stamps.len() >= MAX_ENTRIES {
            // Drop the oldest quarter in one reallocation so the backing
            // storage is actually released
            let drop_count = MAX_ENTRIES / 4;
            let kept: VecDeque<Instant> = self.stamps.iter().skip(drop_count).copied().collect();
            self.stamps = kept;
        }

        self.stamps.push_back(now);
    }

    fn rate(&mut self, now: Instant) -> f64 {
        if now.saturating_duration_since(self.last_update) > IDLE_CUTOFF {
            return 0.0;
        }

        let cutoff = now - WINDOW;
        while self.stamps.front().is_some_and(|t| *t <= cutoff) {
            self.stamps.pop_front();
        }

        // Release slack capacity left behind by a burst
        if self.stamps.capacity() > 1000 && self.stamps.len() < self.stamps.capacity() / 4 {
            self.stamps.shrink_to_fit();
        }

        self.stamps.len() as f64
    }
}

/// Tracks per-container log rates. Lock layering: registry lock first, then
/// the per-container lock, never the other way around.
#[derive(Default)]
pub struct RateTrackerConsumer {
    rates: RwLock<HashMap<String, Mutex<RateWindow>>>,
}

impl RateTrackerConsumer {
    pub fn new() -> Self {
        RateTrackerConsumer::default()
    }

    pub fn rate(&self, container_id: &str) -> f64 {
        self.rate_at(container_id, Instant::now())
    }

    fn rate_at(&self, container_id: &str, now: Instant) -> f64 {
        let rates = self.rates.read().unwrap();
        match rates.get(container_id) {
            Some(window) => window.lock().unwrap().rate(now),
            None => 0.0,
        }
    }

    fn add_line_at(&self, container_id: &str, now: Instant) {
        {
            let rates = self.rates.read().unwrap();
            if let Some(window) = rates.get(container_id) {
                window.lock().unwrap().add(now);
                return;
            }
        }

        let mut rates = self.rates.write().unwrap();
        rates
            .entry(container_id.to_string())
            .or_insert_with(|| Mutex::new(RateWindow::new(now)))
            .lock()
            .unwrap()
            .add(now);
    }

    pub fn tracked_count(&self) -> usize {
        self.rates.read().unwrap().len()
    }

    /// Remove containers that have not logged for five minutes. Covers
    /// containers whose status-change notification never arrived.
    pub fn cleanup_stale(&self) {
        self.cleanup_stale_at(Instant::now())
    }

    fn cleanup_stale_at(&self, now: Instant) {
        // Phase 1: copy last-update stamps under the read lock
        let states: Vec<(String, Instant)> = {
            let rates = self.rates.read().unwrap();
            rates
                .iter()
                .map(|(id, window)| (id.clone(), window.lock().unwrap().last_update))
                .collect()
        };

        // Phase 2: pick the stale ids with no locks held
        let stale: Vec<String> = states
            .into_iter()
            .filter(|(_, last)| now.saturating_duration_since(*last) > STALE_CUTOFF)
            .map(|(id, _)| id)
            .collect();

        // Phase 3: delete under a single write lock
        if !stale.is_empty() {
            let mut rates = self.rates.write().unwrap();
            for id in &stale {
                rates.remove(id);
            }
        }
    }
}

impl LogConsumer for RateTrackerConsumer {
    fn on_line(&self, container_id: &str, _container_name: &str, _line: &str, at: Instant) {
        self.add_line_at(container_id, at);
    }

    fn on_status_change(&self, container_id: &str, running: bool) {
        if !running {
            self.rates.write().unwrap().remove(container_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn rate_counts_lines_inside_the_window() {
        let tracker = RateTrackerConsumer::new();
        let t0 = Instant::now();
        tracker.add_line_at("x", t0);
        tracker.add_line_at("x", t0 + 400 * MS);
        tracker.add_line_at("x", t0 + 900 * MS);

        assert_eq!(tracker.rate_at("x", t0 + 999 * MS), 3.0);
        // Half a second later only the last line is still inside the window
        assert_eq!(tracker.rate_at("x", t0 + 1500 * MS), 1.0);
    }

    #[test]
    fn rate_is_zero_after_two_idle_seconds() {
        let tracker = RateTrackerConsumer::new();
        let t0 = Instant::now();
        tracker.add_line_at("x", t0);
        assert_eq!(tracker.rate_at("x", t0 + 3100 * MS), 0.0);
    }

    #[test]
    fn rate_for_unknown_container_is_zero() {
        let tracker = RateTrackerConsumer::new();
        assert_eq!(tracker.rate("nope"), 0.0);
    }

    #[test]
    fn hard_cap_drops_oldest_quarter() {
        let mut window = RateWindow::new(Instant::now());
        let t0 = Instant::now();
        // All stamps inside the window so pruning cannot help
        for i in 0..MAX_ENTRIES {
            window.add(t0 + Duration::from_nanos(i as u64));
        }
        assert_eq!(window.stamps.len(), MAX_ENTRIES);
        window.add(t0 + Duration::from_nanos(MAX_ENTRIES as u64));
        assert_eq!(window.stamps.len(), MAX_ENTRIES - MAX_ENTRIES / 4 + 1);
    }

    #[test]
    fn status_change_to_stopped_removes_entry() {
        let tracker = RateTrackerConsumer::new();
        tracker.on_line("x", "web", "line", Instant::now());
        assert_eq!(tracker.tracked_count(), 1);
        tracker.on_status_change("x", false);
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn status_change_to_running_keeps_entry() {
        let tracker = RateTrackerConsumer::new();
        tracker.on_line("x", "web", "line", Instant::now());
        tracker.on_status_change("x", true);
        assert_eq!(tracker.tracked_count(), 1);
    }

    #[test]
    fn cleanup_removes_only_stale_entries() {
        let tracker = RateTrackerConsumer::new();
        let t0 = Instant::now();
        tracker.add_line_at("old", t0);
        tracker.add_line_at("fresh", t0 + Duration::from_secs(6 * 60));

        tracker.cleanup_stale_at(t0 + Duration::from_secs(6 * 60));
        assert_eq!(tracker.rate_at("fresh", t0 + Duration::from_secs(6 * 60)), 1.0);
        assert_eq!(tracker.tracked_count(), 1);
    }
}
