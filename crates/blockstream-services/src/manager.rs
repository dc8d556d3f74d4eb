//! Block node connection manager.
//!
//! Picks which block node to stream to, owns every connection, and reacts to
//! what connections report. Exactly one connection is active at a time.
//! Others may exist briefly as scheduled attempts; a node with any live or
//! scheduled connection is not selected again.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use blockstream_core::config::{BlockNodeConfig, ConnectionSettings};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::ack_tracker::AckTracker;
use crate::backoff::{jittered, RetryBackoff};
use crate::buffer::{BlockBufferService, StreamController};
use crate::connection::{BlockNodeConnection, ConnectionEvents};
use crate::metrics::StreamMetrics;
use crate::node_stats::EndOfStreamStats;
use crate::transport::BlockNodeConnector;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("no block nodes available to connect to")]
    NoBlockNodesAvailable,

    #[error("connection manager already started")]
    AlreadyStarted,
}

pub struct BlockNodeConnectionManager {
    roster: Vec<BlockNodeConfig>,
    settings: ConnectionSettings,
    buffer: Arc<BlockBufferService>,
    tracker: AckTracker,
    connector: Arc<dyn BlockNodeConnector>,
    metrics: Arc<dyn StreamMetrics>,
    connections: DashMap<BlockNodeConfig, Arc<BlockNodeConnection>>,
    active: Mutex<Option<Arc<BlockNodeConnection>>>,
    active_id: watch::Sender<Option<u64>>,
    end_of_streams: DashMap<BlockNodeConfig, EndOfStreamStats>,
    running: AtomicBool,
    next_id: AtomicU64,
    self_ref: Weak<Self>,
}

impl BlockNodeConnectionManager {
    /// Build the manager and register it as the buffer's stream controller.
    pub fn new(
        roster: Vec<BlockNodeConfig>,
        settings: ConnectionSettings,
        buffer: Arc<BlockBufferService>,
        connector: Arc<dyn BlockNodeConnector>,
        metrics: Arc<dyn StreamMetrics>,
    ) -> Arc<Self> {
        let tracker = AckTracker::new(buffer.clone(), settings.delete_files_on_ack);
        let (active_id, _) = watch::channel(None);

        let manager = Arc::new_cyclic(|self_ref| Self {
            roster,
            settings,
            buffer: buffer.clone(),
            tracker,
            connector,
            metrics,
            connections: DashMap::new(),
            active: Mutex::new(None),
            active_id,
            end_of_streams: DashMap::new(),
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            self_ref: self_ref.clone(),
        });

        let controller: Weak<dyn StreamController> = Arc::downgrade(&manager) as Weak<dyn StreamController>;
        buffer.set_controller(controller);
        manager
    }

    pub fn start(&self) -> Result<(), ManagerError> {
        if !self.buffer.is_streaming_enabled() {
            tracing::info!("block streaming disabled, connection manager idle");
            return Ok(());
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ManagerError::AlreadyStarted);
        }
        if !self.select_new_block_node_for_streaming(false) {
            self.running.store(false, Ordering::Release);
            return Err(ManagerError::NoBlockNodesAvailable);
        }
        tracing::info!(nodes = self.roster.len(), "connection manager started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
        self.active.lock().take();
        self.active_id.send_replace(None);
        tracing::info!("connection manager shut down");
    }

    // ── Selection ─────────────────────────────────────────────────────────────

    /// Schedule an attempt to the best free node. False if none is free.
    pub fn select_new_block_node_for_streaming(&self, force: bool) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.find_available_node() {
            Some(node) => {
                tracing::info!(node = %node, priority = node.priority, force, "selected block node");
                self.schedule_connection_attempt(node, Duration::ZERO, None, force);
                true
            }
            None => {
                tracing::warn!("no available block node to stream to");
                false
            }
        }
    }

    /// Lowest priority group first, random order within a group.
    fn find_available_node(&self) -> Option<BlockNodeConfig> {
        let mut groups: BTreeMap<u32, Vec<&BlockNodeConfig>> = BTreeMap::new();
        for node in &self.roster {
            groups.entry(node.priority).or_default().push(node);
        }

        let mut rng = rand::thread_rng();
        for (_, mut nodes) in groups {
            nodes.retain(|n| !self.connections.contains_key(*n));
            nodes.shuffle(&mut rng);
            if let Some(node) = nodes.first() {
                return Some((*node).clone());
            }
        }
        None
    }

    fn schedule_connection_attempt(&self, node: BlockNodeConfig, delay: Duration, block: Option<u64>, force: bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let events: Weak<dyn ConnectionEvents> = self.self_ref.clone() as Weak<dyn ConnectionEvents>;
        let connection = Arc::new(BlockNodeConnection::new(
            id,
            node.clone(),
            self.buffer.clone(),
            events,
            self.metrics.clone(),
        ));
        self.connections.insert(node, connection.clone());

        let manager = self.self_ref.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = connection.closed() => return,
                }
            }
            if let Some(manager) = manager.upgrade() {
                manager.run_connection_task(connection, block, force).await;
            }
        });
    }

    async fn run_connection_task(&self, connection: Arc<BlockNodeConnection>, block: Option<u64>, force: bool) {
        let mut backoff = RetryBackoff::new();
        loop {
            if !self.is_running() {
                connection.close();
                self.remove_connection(&connection);
                return;
            }
            if connection.is_closed() {
                return;
            }
            if !self.may_take_over(&connection, force) {
                connection.close();
                self.remove_connection(&connection);
                return;
            }

            match self.connector.connect(connection.node()).await {
                Ok(stream) => {
                    let previous = {
                        let mut active = self.active.lock();
                        if !self.may_take_over_locked(active.as_ref(), &connection, force) {
                            None
                        } else {
                            Some(active.replace(connection.clone()))
                        }
                    };
                    let Some(previous) = previous else {
                        drop(stream);
                        connection.close();
                        self.remove_connection(&connection);
                        return;
                    };

                    connection.start(stream);
                    connection.activate(block);
                    self.active_id.send_replace(Some(connection.id()));
                    tracing::info!(
                        node = %connection.node(),
                        connection = connection.id(),
                        "streaming to block node"
                    );

                    if let Some(previous) = previous.filter(|p| p.id() != connection.id()) {
                        previous.close();
                        self.connections
                            .remove_if(previous.node(), |_, c| c.id() == previous.id());
                    }
                    return;
                }
                Err(e) => {
                    let delay = jittered(backoff.next_delay());
                    tracing::warn!(
                        node = %connection.node(),
                        error = %e,
                        retry_in = ?delay,
                        "failed to connect to block node"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = connection.closed() => return,
                    }
                }
            }
        }
    }

    fn may_take_over(&self, connection: &BlockNodeConnection, force: bool) -> bool {
        let active = self.active.lock();
        self.may_take_over_locked(active.as_ref(), connection, force)
    }

    /// No active connection, forced, or strictly better priority.
    fn may_take_over_locked(
        &self,
        active: Option<&Arc<BlockNodeConnection>>,
        connection: &BlockNodeConnection,
        force: bool,
    ) -> bool {
        match active {
            None => true,
            Some(current) => {
                let better = connection.node().priority < current.node().priority;
                if !force && !better {
                    tracing::debug!(
                        node = %connection.node(),
                        active = %current.node(),
                        "active connection has equal or better priority"
                    );
                }
                force || better
            }
        }
    }

    fn remove_connection(&self, connection: &BlockNodeConnection) {
        self.connections
            .remove_if(connection.node(), |_, c| c.id() == connection.id());
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|a| a.id() == connection.id()) {
            active.take();
            self.active_id.send_replace(None);
        }
    }

    // ── Recovery ──────────────────────────────────────────────────────────────

    pub fn reschedule_connection(&self, connection: &Arc<BlockNodeConnection>, delay: Duration) {
        self.remove_connection(connection);
        if !self.is_running() {
            return;
        }
        let node = connection.node().clone();
        if self.roster.len() == 1 {
            tracing::info!(node = %node, "single block node configured, reconnecting");
            self.schedule_connection_attempt(node, Duration::ZERO, None, true);
        } else {
            tracing::info!(node = %node, retry_in = ?delay, "rescheduling block node");
            self.schedule_connection_attempt(node, delay, None, false);
            self.select_new_block_node_for_streaming(true);
        }
    }

    pub fn restart_connection(&self, connection: &Arc<BlockNodeConnection>, block: Option<u64>) {
        self.remove_connection(connection);
        if !self.is_running() {
            return;
        }
        tracing::info!(node = %connection.node(), ?block, "restarting connection");
        self.schedule_connection_attempt(connection.node().clone(), Duration::ZERO, block, true);
    }

    pub fn connection_resets_stream(&self, connection: &Arc<BlockNodeConnection>) {
        self.remove_connection(connection);
        if self.is_running() {
            self.select_new_block_node_for_streaming(true);
        }
    }

    pub fn record_end_of_stream_and_check_limit(&self, node: &BlockNodeConfig) -> bool {
        let exceeded = self
            .end_of_streams
            .entry(node.clone())
            .or_default()
            .record_and_check(
                Instant::now(),
                self.settings.end_of_stream_window(),
                self.settings.max_end_of_streams_allowed,
            );
        if exceeded {
            tracing::warn!(
                node = %node,
                max = self.settings.max_end_of_streams_allowed,
                window = ?self.settings.end_of_stream_window(),
                "end of stream limit exceeded"
            );
        }
        exceeded
    }

    // ── Streaming state ───────────────────────────────────────────────────────

    pub fn active_connection(&self) -> Option<Arc<BlockNodeConnection>> {
        self.active.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn jump_to_block(&self, block: u64) {
        if let Some(active) = self.active_connection() {
            active.jump_to_block(block);
        }
    }

    pub fn current_streaming_block_number(&self) -> i64 {
        self.active_connection()
            .map(|c| c.current_streaming_block_number())
            .unwrap_or(-1)
    }

    pub fn open_block(&self, block: u64) {
        if let Some(active) = self.active_connection() {
            active.on_block_opened(block);
        }
    }

    pub fn block_updated(&self, _block: u64) {
        if let Some(active) = self.active_connection() {
            active.on_block_updated();
        }
    }

    pub fn update_last_verified_block(&self, node: &BlockNodeConfig, block: u64) {
        self.tracker.track_block_acknowledgement(&node.to_string(), block);
        self.buffer.set_latest_acknowledged_block(block);
    }

    pub fn last_verified_block(&self) -> i64 {
        self.tracker.get_last_verified_block()
    }

    pub fn last_verified_block_for(&self, node: &BlockNodeConfig) -> i64 {
        self.tracker.get_last_verified_block_for(&node.to_string())
    }

    /// True once a connection is active, false on timeout.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.active_id.subscribe();
        tokio::time::timeout(timeout, async {
            rx.wait_for(|id| id.is_some()).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }
}

impl StreamController for BlockNodeConnectionManager {
    fn block_opened(&self, block: u64) {
        self.open_block(block);
    }

    fn block_updated(&self, block: u64) {
        BlockNodeConnectionManager::block_updated(self, block);
    }

    fn select_new_block_node_for_streaming(&self, force: bool) {
        BlockNodeConnectionManager::select_new_block_node_for_streaming(self, force);
    }
}

impl ConnectionEvents for BlockNodeConnectionManager {
    fn update_last_verified_block(&self, node: &BlockNodeConfig, block: u64) {
        BlockNodeConnectionManager::update_last_verified_block(self, node, block);
    }

    fn record_end_of_stream_and_check_limit(&self, node: &BlockNodeConfig) -> bool {
        BlockNodeConnectionManager::record_end_of_stream_and_check_limit(self, node)
    }

    fn end_of_stream_schedule_delay(&self) -> Duration {
        self.settings.end_of_stream_schedule_delay()
    }

    fn reschedule_connection(&self, connection: &Arc<BlockNodeConnection>, delay: Duration) {
        BlockNodeConnectionManager::reschedule_connection(self, connection, delay);
    }

    fn restart_connection(&self, connection: &Arc<BlockNodeConnection>, block: Option<u64>) {
        BlockNodeConnectionManager::restart_connection(self, connection, block);
    }

    fn connection_resets_stream(&self, connection: &Arc<BlockNodeConnection>) {
        BlockNodeConnectionManager::connection_resets_stream(self, connection);
    }
}
