// Bounded circular log store backing the logs viewport

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;

use super::LogConsumer;
use crate::models::LogEntry;

/// The notification channel carries presence, not content; a dropped
/// notification is recovered by the next buffer read.
pub const NOTIFY_CHANNEL_CAPACITY: usize = 100;

pub type NotifyFn = Box<dyn Fn(&LogEntry) + Send + Sync>;

struct RingState {
    buffer: Vec<LogEntry>,
    head: usize,
    size: usize,
}

/// Fixed-capacity circular buffer over the lines of a tracked set of
/// containers. Created fresh on each logs-view entry, registered on the
/// broker after preload, unregistered and detached on exit.
pub struct RingBufferConsumer {
    tracked: HashSet<String>,
    capacity: usize,
    state: RwLock<RingState>,
    // The callback runs under this read lock; detaching takes the write
    // lock, which waits out every in-flight callback.
    notify: RwLock<Option<NotifyFn>>,
    closing: Arc<AtomicBool>,
}

impl RingBufferConsumer {
    pub fn new(
        tracked: impl IntoIterator<Item = String>,
        capacity: usize,
        notify: Option<NotifyFn>,
        closing: Arc<AtomicBool>,
    ) -> Self {
        RingBufferConsumer {
            tracked: tracked.into_iter().collect(),
            capacity: capacity.max(1),
            state: RwLock::new(RingState {
                buffer: Vec::with_capacity(capacity.max(1)),
                head: 0,
                size: 0,
            }),
            notify: RwLock::new(notify),
            closing,
        }
    }

    /// Consumer wired to a fresh notification channel of capacity
    /// [`NOTIFY_CHANNEL_CAPACITY`]. A full channel drops the notification.
    pub fn with_channel(
        tracked: impl IntoIterator<Item = String>,
        capacity: usize,
        closing: Arc<AtomicBool>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let notify: NotifyFn = Box::new(move |_entry| {
            let _ = tx.try_send(());
        });
        let consumer = Arc::new(RingBufferConsumer::new(
            tracked,
            capacity,
            Some(notify),
            closing,
        ));
        (consumer, rx)
    }

    fn push(state: &mut RingState, capacity: usize, entry: LogEntry) {
        if state.buffer.len() < capacity {
            state.buffer.push(entry);
        } else {
            state.buffer[state.head] = entry;
        }
        state.head = (state.head + 1) % capacity;
        if state.size < capacity {
            state.size += 1;
        }
    }

    fn notify_entry(&self, entry: &LogEntry) {
        let notify = self.notify.read().unwrap();
        if let Some(callback) = notify.as_ref() {
            if !self.closing.load(Ordering::SeqCst) {
                // A notification target torn down mid-callback must not take
                // the stream task with it
                let _ = catch_unwind(AssertUnwindSafe(|| callback(entry)));
            }
        }
    }

    /// Chronological copy of the buffered entries.
    pub fn get_buffer(&self) -> Vec<LogEntry> {
        let state = self.state.read().unwrap();
        if state.size == 0 {
            return Vec::new();
        }

        let mut result = Vec::with_capacity(state.size);
        if state.size < self.capacity {
            result.extend_from_slice(&state.buffer[..state.size]);
        } else {
            // Oldest entry sits at the write head once the buffer wrapped
            result.extend_from_slice(&state.buffer[state.head..]);
            result.extend_from_slice(&state.buffer[..state.head]);
        }
        result
    }

    /// Reset head and size; capacity is untouched.
    pub fn clear(&self) {
        let mut state = self.state.write().unwrap();
        state.buffer.clear();
        state.head = 0;
        state.size = 0;
    }

    /// Append a user-inserted separator entry (empty line).
    pub fn insert_separator(&self) {
        let entry = LogEntry::separator();
        {
            let mut state = self.state.write().unwrap();
            Self::push(&mut state, self.capacity, entry.clone());
        }
        self.notify_entry(&entry);
    }

    /// Bulk-append preexisting logs. The caller's id order fixes the
    /// interleaving so repeated view entries render identically. The notify
    /// callback is not invoked.
    pub fn preload(
        &self,
        container_id_order: &[String],
        logs_by_id: &HashMap<String, Vec<String>>,
        names_by_id: &HashMap<String, String>,
    ) {
        let mut state = self.state.write().unwrap();
        for id in container_id_order {
            let Some(lines) = logs_by_id.get(id) else {
                continue;
            };
            let name = names_by_id.get(id).map(String::as_str).unwrap_or("");
            for line in lines {
                Self::push(&mut state, self.capacity, LogEntry::new(id, name, line));
            }
        }
    }

    /// Detach the notify callback: set the closing flag, wait out in-flight
    /// callbacks, drop the callback (closing its channel), reset the flag
    /// for the next session. Single-use per installed callback; idempotent.
    pub fn detach_notifier(&self) {
        self.closing.store(true, Ordering::SeqCst);
        {
            let mut notify = self.notify.write().unwrap();
            *notify = None;
        }
        self.closing.store(false, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogConsumer for RingBufferConsumer {
    fn on_line(&self, container_id: &str, container_name: &str, line: &str, _at: Instant) {
        if !self.tracked.contains(container_id) {
            return;
        }

        let entry = LogEntry::new(container_id, container_name, line);
        {
            let mut state = self.state.write().unwrap();
            Self::push(&mut state, self.capacity, entry.clone());
        }
        // Callback runs outside the buffer lock
        self.notify_entry(&entry);
    }

    fn on_status_change(&self, _container_id: &str, _running: bool) {}
}
