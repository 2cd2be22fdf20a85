// Log consumers: everything that receives decoded lines from the broker

mod rate;
mod ring;

pub use rate::RateTrackerConsumer;
pub use ring::{NotifyFn, RingBufferConsumer, NOTIFY_CHANNEL_CAPACITY};

use std::time::Instant;

/// Receives every decoded log line exactly once per fan-out. Implementations
/// must not block beyond local work; a consumer that needs asynchronous
/// delivery owns its own channel.
pub trait LogConsumer: Send + Sync {
    fn on_line(&self, container_id: &str, container_name: &str, line: &str, at: Instant);

    fn on_status_change(&self, container_id: &str, running: bool);
}
