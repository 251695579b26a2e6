#![doc = include_str!("../README.md")]

mod config;
mod processor;
mod telemetry;

use clap::Parser;
use config::{CliArgs, DemoConfig};
use leasehold::{Broker, CancellationToken, MemoryQueue};
use portable_atomic::Ordering;
use processor::Processor;
use telemetry::{init_telemetry, shutdown_telemetry};
use tokio::{signal, time::Instant};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = DemoConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let queue = MemoryQueue::new();
    let broker = Broker::new(queue.clone());
    seed(&broker, &config).await?;

    let cancel = CancellationToken::new();
    let processor = Processor::new(&config, cancel.clone());
    let stats = processor.stats();
    let signals = tokio::spawn(shutdown_signal(cancel.clone()));

    let start = Instant::now();
    let result = broker
        .subscribe(cancel, config.subscription.clone(), processor)
        .await;
    let elapsed = start.elapsed();
    signals.abort();

    let acked = stats.acked.load(Ordering::Relaxed);
    println!(
        "acked {acked}/{} in {elapsed:.2?} ({} skipped, {} failed acks, {} lease extensions, {} left in queue)",
        config.message_count,
        stats.skipped.load(Ordering::Relaxed),
        stats.failed.load(Ordering::Relaxed),
        queue.extend_count(),
        queue.len(&config.subscription.queue),
    );

    shutdown_telemetry(providers);
    result?;
    Ok(())
}

async fn seed(broker: &Broker<MemoryQueue>, config: &DemoConfig) -> anyhow::Result<()> {
    let queue = &config.subscription.queue;
    for i in 0..config.message_count {
        let group = format!("group-{}", i % config.group_count);
        broker.publish(queue, &group, i.to_string()).await?;
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Published {} messages to {queue} across {} groups",
        config.message_count,
        config.group_count
    );
    Ok(())
}

fn log_startup_info(_config: &DemoConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting demo with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting demo on {} with {} workers",
            _config.subscription.queue,
            _config.subscription.max_messages
        );
    }
}

/// Cancels `cancel` on Ctrl+C or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, draining handlers...");
    cancel.cancel();
}
