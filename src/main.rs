use anyhow::Result;
use clap::Parser;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use whalewatch::*;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse().normalized();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Gateway sessions get their own append-only debug log next to the crash log
    let gateway_log_layer = if args.mcp_server {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(rpc::DEBUG_LOG_PATH)
            .ok()
            .map(|file| {
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTimer)
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
            })
    } else {
        None
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .with(gateway_log_layer)
        .init();

    guards::install_panic_hook();

    let engine: Arc<dyn engine::ContainerEngine> = Arc::new(engine::DockerEngine::connect()?);

    let broker = broker::LogBroker::new(engine.clone());
    let rate_tracker = Arc::new(consumers::RateTrackerConsumer::new());
    broker.register_consumer(rate_tracker.clone());

    let cache = Arc::new(cache::CpuCache::new());
    let containers = Arc::new(RwLock::new(Vec::new()));
    let root = CancellationToken::new();

    tracing::info!(
        version = version::VERSION,
        demo = args.demo,
        logs_buffer_length = args.logs_buffer_length,
        "starting {}",
        version::NAME
    );

    let inventory_handle = inventory::spawn(inventory::InventoryDeps {
        engine: engine.clone(),
        broker: broker.clone(),
        rate_tracker: rate_tracker.clone(),
        cache: cache.clone(),
        containers: containers.clone(),
        cancel: root.child_token(),
    });
    let sampler_handle = sampler::spawn(sampler::SamplerDeps {
        engine: engine.clone(),
        cache: cache.clone(),
        containers: containers.clone(),
        cancel: root.child_token(),
    });
    guards::spawn_watchdog(args.debug_monitor, root.child_token());

    if args.mcp_server {
        let state = rpc::RpcState::new(
            engine.clone(),
            broker.clone(),
            rate_tracker.clone(),
            cache.clone(),
            containers.clone(),
            args.demo,
        );
        rpc::spawn_session_reaper(state.clone(), root.child_token());

        let addr = format!("0.0.0.0:{}", args.mcp_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("gateway listening on http://{}/mcp", addr);

        tokio::select! {
            result = axum::serve(listener, rpc::app(state)) => {
                result?;
            }
            _ = shutdown_signal() => {
                tracing::info!("received shutdown signal");
            }
        }
    } else {
        shutdown_signal().await;
        tracing::info!("received shutdown signal");
    }

    root.cancel();
    broker.stop_all();
    let _ = inventory_handle.await;
    let _ = sampler_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
