//! Integration tests for block streaming.
//!
//! Every test wires a real `BlockBufferService` and
//! `BlockNodeConnectionManager` to simulated block nodes. A simulated node
//! records what it receives and answers the way a block node would, so the
//! tests exercise the whole pipeline without sockets.
//!
//! Run with:
//!   cargo test -p integration

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

pub use blockstream_core::config::{BlockNodeConfig, BlockStreamConfig, WriterMode};
pub use blockstream_core::wire::{
    BlockItem, EndOfStreamCode, EndStreamCode, ItemKind, PublishRequest, PublishResponse, NO_BLOCK,
};
pub use blockstream_services::transport::STREAM_CHANNEL_CAPACITY;
pub use blockstream_services::{
    BlockBufferService, BlockNodeConnectionManager, BlockNodeConnector, BlockNodeStream,
    NoopMetrics, StreamEvent,
};

mod backpressure;
mod failover;
mod streaming;

// ── Harness ──────────────────────────────────────────────────────────────────

pub const WAIT: Duration = Duration::from_secs(5);

/// One simulated block node.
pub struct SimNode {
    pub port: u16,
    up: AtomicBool,
    auto_ack: AtomicBool,
    connects: AtomicUsize,
    session: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    received: Mutex<Vec<u64>>,
    end_streams: Mutex<Vec<EndStreamCode>>,
}

impl SimNode {
    fn new(port: u16) -> Arc<Self> {
        Arc::new(Self {
            port,
            up: AtomicBool::new(true),
            auto_ack: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            session: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            end_streams: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self, priority: u32) -> BlockNodeConfig {
        BlockNodeConfig::new("127.0.0.1", self.port, priority)
    }

    /// Refuse (false) or accept (true) new connections.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    /// Acknowledge each block as soon as its proof arrives.
    pub fn set_auto_ack(&self, on: bool) {
        self.auto_ack.store(on, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Block numbers whose proof-carrying request arrived, in arrival order.
    pub fn received(&self) -> Vec<u64> {
        self.received.lock().unwrap().clone()
    }

    pub fn times_received(&self, block: u64) -> usize {
        self.received().iter().filter(|b| **b == block).count()
    }

    pub fn end_streams(&self) -> Vec<EndStreamCode> {
        self.end_streams.lock().unwrap().clone()
    }

    /// Answer on the most recent stream.
    pub fn respond(&self, response: PublishResponse) -> Result<()> {
        self.event(StreamEvent::Response(response))
    }

    /// Break the most recent stream with a transport error.
    pub fn fail(&self, reason: &str) -> Result<()> {
        self.event(StreamEvent::Error(reason.to_string()))
    }

    fn event(&self, event: StreamEvent) -> Result<()> {
        let session = self.session.lock().unwrap().clone();
        match session {
            Some(tx) => {
                if tx.try_send(event).is_err() {
                    bail!("node {} stream is gone", self.port);
                }
                Ok(())
            }
            None => bail!("node {} was never connected", self.port),
        }
    }

    fn record(&self, request: &PublishRequest) -> Option<u64> {
        match request {
            PublishRequest::BlockItems { block_number, items } => {
                if items.iter().any(|i| i.is_proof()) {
                    self.received.lock().unwrap().push(*block_number);
                    return Some(*block_number);
                }
                None
            }
            PublishRequest::EndStream { code, .. } => {
                self.end_streams.lock().unwrap().push(*code);
                None
            }
        }
    }
}

/// A set of simulated block nodes reachable through one connector.
pub struct SimNetwork {
    nodes: Vec<Arc<SimNode>>,
}

impl SimNetwork {
    pub fn new(ports: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            nodes: ports.iter().map(|p| SimNode::new(*p)).collect(),
        })
    }

    pub fn node(&self, port: u16) -> Arc<SimNode> {
        self.nodes
            .iter()
            .find(|n| n.port == port)
            .cloned()
            .unwrap_or_else(|| panic!("no simulated node on port {port}"))
    }

    /// Roster in declaration order: first node gets priority 1, and so on.
    pub fn roster(&self) -> Vec<BlockNodeConfig> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, n)| n.config(i as u32 + 1))
            .collect()
    }
}

impl BlockNodeConnector for SimNetwork {
    fn connect(&self, config: &BlockNodeConfig) -> BoxFuture<'static, Result<BlockNodeStream>> {
        let node = self.nodes.iter().find(|n| n.port == config.port).cloned();
        Box::pin(async move {
            let Some(node) = node else {
                bail!("unknown block node");
            };
            if !node.up.load(Ordering::SeqCst) {
                bail!("connection refused by node {}", node.port);
            }
            node.connects.fetch_add(1, Ordering::SeqCst);

            let (request_tx, mut request_rx) = mpsc::channel::<Arc<PublishRequest>>(STREAM_CHANNEL_CAPACITY);
            let (event_tx, event_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            *node.session.lock().unwrap() = Some(event_tx.clone());

            tokio::spawn(async move {
                while let Some(request) = request_rx.recv().await {
                    let Some(block_number) = node.record(&request) else {
                        continue;
                    };
                    if node.auto_ack.load(Ordering::SeqCst) {
                        let ack = PublishResponse::Acknowledgement {
                            block_number,
                            block_already_exists: false,
                        };
                        if event_tx.send(StreamEvent::Response(ack)).await.is_err() {
                            return;
                        }
                    }
                }
            });

            Ok(BlockNodeStream {
                requests: request_tx,
                events: event_rx,
            })
        })
    }
}

/// Streaming config with persistence off and fast timers.
pub fn test_config() -> BlockStreamConfig {
    let mut config = BlockStreamConfig::default();
    config.stream.writer_mode = WriterMode::Grpc;
    config.stream.block_period_ms = 1_000;
    config.buffer.block_ttl_secs = 60;
    config.buffer.prune_interval_ms = 50;
    config.buffer.persistence_enabled = false;
    config
}

/// Fresh persistence directory for one test.
pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("blockstream-it-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

pub struct Pipeline {
    pub buffer: Arc<BlockBufferService>,
    pub manager: Arc<BlockNodeConnectionManager>,
    pub network: Arc<SimNetwork>,
}

impl Pipeline {
    pub fn new(config: &BlockStreamConfig, network: Arc<SimNetwork>) -> Self {
        let buffer = Arc::new(BlockBufferService::new(config, Arc::new(NoopMetrics)));
        Self::with_buffer(config, buffer, network)
    }

    pub fn with_buffer(config: &BlockStreamConfig, buffer: Arc<BlockBufferService>, network: Arc<SimNetwork>) -> Self {
        let manager = BlockNodeConnectionManager::new(
            network.roster(),
            config.connections.clone(),
            buffer.clone(),
            network.clone(),
            Arc::new(NoopMetrics),
        );
        Self {
            buffer,
            manager,
            network,
        }
    }

    pub async fn start(&self) -> Result<()> {
        self.manager.start()?;
        if !self.manager.wait_for_connection(WAIT).await {
            bail!("no connection became active");
        }
        Ok(())
    }

    pub fn active_port(&self) -> Option<u16> {
        self.manager.active_connection().map(|c| c.node().port)
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
        self.buffer.shutdown();
    }
}

/// Produce one complete block: header, `txs` transactions, proof.
pub fn produce_block(buffer: &BlockBufferService, block: u64, txs: usize) -> Result<()> {
    buffer.open_block(block as i64)?;
    buffer.add_item(block, BlockItem::new(ItemKind::BlockHeader, block.to_be_bytes().to_vec()))?;
    for i in 0..txs {
        buffer.add_item(block, BlockItem::new(ItemKind::Transaction, Bytes::from(vec![i as u8; 32])))?;
    }
    buffer.add_item(block, BlockItem::new(ItemKind::BlockProof, vec![0xAB; 48]))?;
    buffer.close_block(block)?;
    Ok(())
}

pub fn produce_blocks(buffer: &BlockBufferService, blocks: std::ops::Range<u64>) -> Result<()> {
    for block in blocks {
        produce_block(buffer, block, 3)?;
    }
    Ok(())
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn manager_connects_to_highest_priority_node() -> Result<()> {
    let network = SimNetwork::new(&[7001, 7002, 7003]);
    let pipeline = Pipeline::new(&test_config(), network.clone());
    pipeline.start().await?;

    assert_eq!(pipeline.active_port(), Some(7001));
    assert_eq!(network.node(7002).connects(), 0);
    assert_eq!(network.node(7003).connects(), 0);
    println!("active node: {:?}", pipeline.active_port());

    pipeline.shutdown();
    Ok(())
}

#[tokio::test]
async fn start_fails_when_streaming_has_no_nodes() -> Result<()> {
    let network = SimNetwork::new(&[]);
    let pipeline = Pipeline::new(&test_config(), network);
    assert!(pipeline.manager.start().is_err());
    assert!(!pipeline.manager.is_running());
    Ok(())
}

#[tokio::test]
async fn file_only_mode_never_connects() -> Result<()> {
    let mut config = test_config();
    config.stream.writer_mode = WriterMode::File;
    let network = SimNetwork::new(&[7011]);
    let pipeline = Pipeline::new(&config, network.clone());

    pipeline.manager.start()?;
    produce_blocks(&pipeline.buffer, 0..3)?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(network.node(7011).connects(), 0);
    assert_eq!(pipeline.buffer.buffered_block_count(), 0);
    Ok(())
}
