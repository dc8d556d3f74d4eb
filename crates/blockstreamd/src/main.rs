//! blockstreamd: streams produced blocks to block nodes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use blockstream_core::config::{BlockNodeRoster, BlockStreamConfig};
use blockstream_services::{BlockBufferService, BlockNodeConnectionManager, StreamStats};

mod producer;
mod transport;

use producer::SyntheticProducer;
use transport::TcpConnector;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = BlockStreamConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BlockStreamConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BlockStreamConfig::default()
    });
    tracing::info!(
        writer_mode = ?config.stream.writer_mode,
        stream_mode = ?config.stream.stream_mode,
        block_period = ?config.stream.block_period(),
        "blockstreamd starting"
    );

    // Buffer
    let stats = Arc::new(StreamStats::new());
    let buffer = Arc::new(BlockBufferService::new(&config, stats.clone()));
    if config.buffer.persistence_enabled {
        match buffer.load_buffer_from_disk() {
            Ok(restored) => tracing::info!(
                dir = %config.buffer.persistence_dir.display(),
                restored,
                "buffer persistence ready"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to restore buffer, starting empty"),
        }
    }

    // Block nodes
    let roster = if config.stream.streaming_enabled() {
        BlockNodeRoster::load(&config.connections.roster_path)
            .context("failed to load block node roster")?
            .nodes
    } else {
        Vec::new()
    };
    for node in &roster {
        tracing::info!(node = %node, priority = node.priority, "block node configured");
    }

    let manager = BlockNodeConnectionManager::new(
        roster,
        config.connections.clone(),
        buffer.clone(),
        Arc::new(TcpConnector::new(CONNECT_TIMEOUT)),
        stats.clone(),
    );
    manager.start().context("failed to start connection manager")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let prune_task = tokio::spawn(buffer.clone().run_prune_loop(shutdown_tx.subscribe()));
    let persist_task = tokio::spawn(buffer.clone().run_persist_loop(shutdown_tx.subscribe()));

    let stats_printer = {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                interval.tick().await;
                stats.print_stats();
            }
        })
    };

    let producer_task = if config.producer.enabled {
        let producer = SyntheticProducer::new(
            buffer.clone(),
            config.producer.clone(),
            config.stream.block_period(),
            shutdown_tx.subscribe(),
        );
        tokio::spawn(producer.run())
    } else {
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            Ok::<(), anyhow::Error>(())
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        biased;
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = prune_task          => tracing::error!("prune loop exited: {:?}", r),
        r = persist_task        => tracing::error!("persist loop exited: {:?}", r),
        r = stats_printer       => tracing::error!("stats printer exited: {:?}", r),
        r = producer_task       => tracing::error!("producer exited: {:?}", r),
    }

    manager.shutdown();
    buffer.shutdown();
    if config.buffer.persistence_enabled {
        buffer
            .persist_buffer()
            .context("failed to persist buffer on shutdown")?;
        tracing::info!("buffer persisted");
    }
    stats.print_stats();

    Ok(())
}
