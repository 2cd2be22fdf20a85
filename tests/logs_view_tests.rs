// Logs-view session lifecycle: preload, register, live delivery with
// notifications, unregister, detach.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use whalewatch::broker::LogBroker;
use whalewatch::consumers::{LogConsumer, RingBufferConsumer};
use whalewatch::engine::fake::{FakeEngine, ScriptedConnection};
use whalewatch::engine::ContainerEngine;
use whalewatch::models::ContainerState;

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {what}");
}

#[tokio::test(start_paused = true)]
async fn logs_view_session_preloads_then_streams_with_notifications() {
    let fake = Arc::new(FakeEngine::new());
    let c1 = FakeEngine::container("c1", "web", ContainerState::Running);
    fake.set_containers(vec![c1.clone()]);
    // Oneshot preload fetch, then the live follow stream
    fake.push_connection(
        "c1",
        ScriptedConnection::then_eof(vec![FakeEngine::frame(1, b"old line\n")]),
    );
    fake.push_connection(
        "c1",
        ScriptedConnection::then_hold(vec![FakeEngine::frame(1, b"live line\n")]),
    );

    let engine: Arc<dyn ContainerEngine> = fake.clone();
    let broker = LogBroker::new(engine);
    // The broker learns the container list before any stream exists, so the
    // preload fetch resolves names without racing the follow stream
    let c1_stopped = FakeEngine::container("c1", "web", ContainerState::Exited);
    broker.start_streaming(vec![c1_stopped]);

    // Enter the logs view: preload from a oneshot fetch, then register
    let ids = vec!["c1".to_string()];
    let preloaded = broker.fetch_recent_logs(&ids, 50).await;
    let names = HashMap::from([("c1".to_string(), "web".to_string())]);

    let closing = Arc::new(AtomicBool::new(false));
    let (ring, mut notifications) = RingBufferConsumer::with_channel(ids.clone(), 100, closing);
    ring.preload(&ids, &preloaded, &names);
    assert_eq!(ring.len(), 1);
    assert!(
        notifications.try_recv().is_err(),
        "preload must not notify"
    );

    broker.register_consumer(ring.clone());
    broker.start_streaming(vec![c1]);
    wait_until("live line lands in the ring", || ring.len() == 2).await;

    let lines: Vec<String> = ring.get_buffer().into_iter().map(|e| e.line).collect();
    assert_eq!(lines, vec!["old line", "live line"]);
    assert!(notifications.try_recv().is_ok(), "live lines notify the viewport");

    // Leave the logs view
    let consumer: Arc<dyn LogConsumer> = ring.clone();
    broker.unregister_consumer(&consumer);
    ring.detach_notifier();
    assert!(matches!(
        notifications.try_recv(),
        Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
    ));

    broker.stop_all();
}
