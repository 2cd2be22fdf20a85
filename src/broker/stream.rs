// Per-container stream task: Opening -> Reading -> (Reconnecting | Closed)

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::LogBroker;
use crate::engine::frames::FrameDecoder;
use crate::engine::LogStreamOptions;

/// Lines tailed on the very first open of a container's stream. Reconnects
/// tail zero; the marker lives on the broker.
pub const INITIAL_TAIL_LINES: u64 = 50;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(2);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const CHECK_INTERVAL: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

pub(super) struct StreamTask {
    pub broker: Arc<LogBroker>,
    pub id: String,
    pub name: String,
    pub generation: u64,
    pub cancel: CancellationToken,
}

/// Cleanup bound to every exit path of the task, panic included: drop the
/// table entry this task owns and tell consumers the container went away.
struct ExitGuard {
    broker: Arc<LogBroker>,
    id: String,
    generation: u64,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        // A consumer panicking here must not escalate into an abort while
        // this task is already unwinding
        let _ = catch_unwind(AssertUnwindSafe(|| {
            self.broker.remove_stream(&self.id, self.generation);
            self.broker.notify_status(&self.id, false);
        }));
    }
}

impl StreamTask {
    pub(super) async fn run(self) {
        let StreamTask {
            broker,
            id,
            name,
            generation,
            cancel,
        } = self;
        let _guard = ExitGuard {
            broker: broker.clone(),
            id: id.clone(),
            generation,
        };

        let mut first_iteration = true;
        let mut check = interval_at(Instant::now() + CHECK_INTERVAL, CHECK_INTERVAL);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if first_iteration {
                // Startup must be instantaneous; pacing applies from the
                // second pass. An unpaced retry loop can spawn thousands of
                // reads per second against a fast-failing engine.
                first_iteration = false;
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = check.tick() => {
                        match timeout(INSPECT_TIMEOUT, broker.engine().is_running(&id)).await {
                            Ok(Ok(true)) => {}
                            _ => return,
                        }
                    }
                }
            }

            let tail = if broker.initial_tail_done(&id) {
                0
            } else {
                INITIAL_TAIL_LINES
            };
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                r = timeout(OPEN_TIMEOUT, broker.engine().open_logs(&id, LogStreamOptions::follow(tail))) => r,
            };
            let mut stream = match opened {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    tracing::debug!(container = %name, error = %e, "log open failed");
                    if pause_or_cancel(&cancel, RECONNECT_PAUSE).await {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    tracing::debug!(container = %name, "log open timed out");
                    if pause_or_cancel(&cancel, RECONNECT_PAUSE).await {
                        return;
                    }
                    continue;
                }
            };

            let mut decoder = FrameDecoder::new();
            let mut consecutive_timeouts: u32 = 0;
            let mut tail_marked = broker.initial_tail_done(&id);

            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    break;
                }

                // A read may not start without a permit; waiting for one
                // counts against the same deadline as the read itself
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    p = timeout(READ_TIMEOUT, Arc::clone(broker.read_permits()).acquire_owned()) => p,
                };
                let permit = match permit {
                    Ok(Ok(p)) => p,
                    // Semaphore closed: the broker is gone
                    Ok(Err(_)) => return,
                    Err(_) => {
                        consecutive_timeouts += 1;
                        break;
                    }
                };

                let read = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = timeout(READ_TIMEOUT, stream.next()) => r,
                };
                drop(permit);

                match read {
                    // Read deadline: drop the connection so the blocked read
                    // cannot linger, then reconnect
                    Err(_) => {
                        consecutive_timeouts += 1;
                        break;
                    }
                    // EOF
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        tracing::debug!(container = %name, error = %e, "log read failed");
                        break;
                    }
                    Ok(Some(Ok(chunk))) => {
                        consecutive_timeouts = 0;
                        if !tail_marked {
                            broker.mark_initial_tail(&id);
                            tail_marked = true;
                        }

                        let out = decoder.feed(&chunk);
                        for frame in &out.frames {
                            let line = String::from_utf8_lossy(&frame.payload);
                            broker.fan_out(&id, &name, &line);
                        }
                        if out.protocol_error {
                            // Corrupt length: the chunk is gone but the
                            // connection may still be good
                            tracing::debug!(container = %name, "malformed frame length, chunk dropped");
                        }
                    }
                }
            }

            // Close the reader before pausing, then re-inspect via the
            // paced loop above
            drop(stream);
            if pause_or_cancel(&cancel, RECONNECT_PAUSE).await {
                return;
            }
        }
    }
}

/// Sleep under cancellation. True when the task was cancelled.
async fn pause_or_cancel(cancel: &CancellationToken, pause: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = sleep(pause) => false,
    }
}
