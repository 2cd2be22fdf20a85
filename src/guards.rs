// Resource and crash guards: panic-capturing task spawn, crash log sink,
// task-count watchdog, fd counter.

use std::any::Any;
use std::io::Write;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const CRASH_LOG_PATH: &str = "/tmp/whalewatch-crash.log";

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
const TASK_WARN_THRESHOLD: usize = 1_000;
const TASK_FATAL_THRESHOLD: usize = 10_000;

/// Spawn a background task that cannot take the process down: a panic is
/// captured, written to the crash log, and the task exits cleanly.
pub fn safe_spawn<F>(name: &str, task: F) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(payload) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
            let message = panic_message(payload.as_ref());
            write_crash_log(&name, &message);
            tracing::error!(task = %name, %message, "background task panicked");
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Append a crash report. Falls back to stderr when the log file cannot be
/// opened.
pub fn write_crash_log(task: &str, message: &str) {
    let report = format!(
        "\n===============================================================\n\
         CRASH REPORT - {}\n\
         ===============================================================\n\
         Task:             {}\n\
         Error:            {}\n\
         Alive tasks:      {}\n\
         File descriptors: {}\n\
         ===============================================================\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        task,
        message,
        alive_task_count(),
        open_fd_count(),
    );

    let written = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(CRASH_LOG_PATH)
        .and_then(|mut f| f.write_all(report.as_bytes()));
    if written.is_err() {
        eprintln!("{report}");
    }
}

/// Route panics through the crash log before the default hook runs. The hook
/// fires on the panicking stack, so the captured backtrace is the real one.
pub fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let location = info
            .location()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unknown location".to_string());
        let backtrace = std::backtrace::Backtrace::force_capture();
        write_crash_log(&location, &format!("{message}\n\n{backtrace}"));
        default_hook(info);
    }));
}

/// Open file descriptors of this process. Diagnostic only; 0 where the proc
/// filesystem is unavailable.
pub fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

/// Alive tasks on the current runtime; 0 outside a runtime.
pub fn alive_task_count() -> usize {
    tokio::runtime::Handle::try_current()
        .map(|h| h.metrics().num_alive_tasks())
        .unwrap_or(0)
}

/// Watchdog over the background task count. The fatal path prefers a fast
/// crash with a report over silent leak accumulation.
pub fn spawn_watchdog(debug_monitor: bool, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    safe_spawn("task-watchdog", async move {
        let mut tick = interval(WATCHDOG_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let tasks = alive_task_count();
            let fds = open_fd_count();
            if debug_monitor {
                tracing::info!(tasks, fds, "resource monitor");
            }
            if tasks > TASK_FATAL_THRESHOLD {
                let message = format!(
                    "task leak detected: {tasks} alive tasks (threshold {TASK_FATAL_THRESHOLD})"
                );
                write_crash_log("task-watchdog", &message);
                tracing::error!(tasks, "fatal: {message}");
                std::process::exit(1);
            }
            if tasks > TASK_WARN_THRESHOLD {
                tracing::warn!(tasks, "high background task count");
            }
        }
    })
}
