//! Block buffer service.
//!
//! Owns every block that has been produced but not yet acknowledged. The
//! producer opens, fills and closes blocks here; connections read from it;
//! acknowledgements drain it. A periodic check prunes acknowledged blocks,
//! measures how full the buffer is against its ideal size, and engages
//! backpressure on the producer when it saturates.
//!
//! Regimes, by saturation:
//!   below action stage  - nothing to do
//!   action stage        - try a different block node
//!   saturated           - also block the producer until recovered

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use blockstream_core::config::{BlockStreamConfig, StreamMode};
use blockstream_core::record::PersistedBlock;
use blockstream_core::wire::BlockItem;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::ack_tracker::CleanupHandler;
use crate::block_unit::BlockUnit;
use crate::metrics::StreamMetrics;
use crate::persistence::BlockBufferStore;

/// Ideal buffer size when the block period is zero.
pub const DEFAULT_IDEAL_BUFFER_SIZE: u64 = 150;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("block number must be non-negative, got {0}")]
    NegativeBlockNumber(i64),

    #[error("block {0} already sent its proof and cannot be reopened")]
    ProofAlreadySent(u64),

    #[error("block {0} is not in the buffer")]
    BlockNotFound(u64),

    #[error("block {0} is closed")]
    BlockClosed(u64),
}

impl BufferError {
    /// Caller broke the producer contract: a negative number, or reopening a
    /// block whose proof already went out.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BufferError::NegativeBlockNumber(_) | BufferError::ProofAlreadySent(_)
        )
    }
}

// ── Collaborators ─────────────────────────────────────────────────────────────

/// What the buffer needs from whoever is streaming it.
pub trait StreamController: Send + Sync {
    fn block_opened(&self, block: u64);
    fn block_updated(&self, block: u64);
    fn select_new_block_node_for_streaming(&self, force: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureGate {
    Open,
    Engaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regime {
    BelowActionStage,
    ActionStage,
    Saturated,
}

/// Outcome of one prune pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PruneResult {
    pub ideal_max_buffer_size: u64,
    pub checked: usize,
    pub pending_ack: usize,
    pub pruned: usize,
    /// Age of the oldest closed, unacknowledged block, or -1.
    pub oldest_unacked_age_ms: i64,
    pub saturation_percent: f64,
    pub is_saturated: bool,
}

impl PruneResult {
    pub fn new(ideal: u64, checked: usize, pending_ack: usize, pruned: usize, oldest_unacked_age_ms: i64) -> Self {
        let (saturation_percent, is_saturated) = saturation(pending_ack as u64, ideal);
        Self {
            ideal_max_buffer_size: ideal,
            checked,
            pending_ack,
            pruned,
            oldest_unacked_age_ms,
            saturation_percent,
            is_saturated,
        }
    }
}

/// Percentage of the ideal size in use, rounded to 6 decimals of the ratio.
fn saturation(pending: u64, ideal: u64) -> (f64, bool) {
    if ideal == 0 {
        return (0.0, false);
    }
    let ratio = pending as f64 / ideal as f64;
    let percent = (ratio * 1_000_000.0).round() / 10_000.0;
    (percent, pending >= ideal)
}

struct CheckState {
    regime: Regime,
    awaiting_recovery: bool,
    last_switch: Option<Instant>,
    last_result: Option<PruneResult>,
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct BlockBufferService {
    blocks: DashMap<u64, Arc<BlockUnit>>,
    earliest: AtomicI64,
    last_produced: AtomicI64,
    highest_acked: AtomicI64,

    streaming_enabled: bool,
    backpressure_applies: bool,
    batch_size: usize,
    max_request_bytes: usize,
    block_ttl: Duration,
    block_period: Duration,
    prune_interval: Duration,
    persist_interval: Duration,
    action_stage_threshold: f64,
    action_grace_period: Duration,
    recovery_threshold: f64,

    gate: watch::Sender<BackpressureGate>,
    check: Mutex<CheckState>,
    stopped: AtomicBool,
    controller: RwLock<Option<Weak<dyn StreamController>>>,
    metrics: Arc<dyn StreamMetrics>,
    store: Option<BlockBufferStore>,
}

impl BlockBufferService {
    pub fn new(config: &BlockStreamConfig, metrics: Arc<dyn StreamMetrics>) -> Self {
        let streaming_enabled = config.stream.streaming_enabled();
        let store = config
            .buffer
            .persistence_enabled
            .then(|| BlockBufferStore::new(config.buffer.persistence_dir.clone()));
        let (gate, _) = watch::channel(BackpressureGate::Open);

        Self {
            blocks: DashMap::new(),
            earliest: AtomicI64::new(-1),
            last_produced: AtomicI64::new(-1),
            highest_acked: AtomicI64::new(-1),
            streaming_enabled,
            backpressure_applies: streaming_enabled && config.stream.stream_mode == StreamMode::Blocks,
            batch_size: config.stream.block_item_batch_size,
            max_request_bytes: config.stream.max_request_bytes,
            block_ttl: config.buffer.block_ttl(),
            block_period: config.stream.block_period(),
            prune_interval: config.buffer.prune_interval(),
            persist_interval: config.buffer.persist_interval(),
            action_stage_threshold: config.buffer.action_stage_threshold,
            action_grace_period: config.buffer.action_grace_period(),
            recovery_threshold: config.buffer.recovery_threshold,
            gate,
            check: Mutex::new(CheckState {
                regime: Regime::BelowActionStage,
                awaiting_recovery: false,
                last_switch: None,
                last_result: None,
            }),
            stopped: AtomicBool::new(false),
            controller: RwLock::new(None),
            metrics,
            store,
        }
    }

    pub fn set_controller(&self, controller: Weak<dyn StreamController>) {
        *self.controller.write() = Some(controller);
    }

    fn controller(&self) -> Option<Arc<dyn StreamController>> {
        self.controller.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_streaming_enabled(&self) -> bool {
        self.streaming_enabled
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_request_bytes(&self) -> usize {
        self.max_request_bytes
    }

    // ── Producer operations ───────────────────────────────────────────────────

    pub fn open_block(&self, block_number: i64) -> Result<(), BufferError> {
        if block_number < 0 {
            return Err(BufferError::NegativeBlockNumber(block_number));
        }
        if !self.streaming_enabled {
            return Ok(());
        }
        let n = block_number as u64;

        if self.is_acked(n) {
            tracing::debug!(block = n, "opening pre-acknowledged block");
        }
        if let Some(existing) = self.blocks.get(&n) {
            if existing.proof_sent() {
                return Err(BufferError::ProofAlreadySent(n));
            }
        }

        self.blocks.insert(n, Arc::new(BlockUnit::new(n)));
        self.last_produced.fetch_max(block_number, Ordering::AcqRel);
        self.lower_earliest(block_number);
        self.metrics.set_producing_block(block_number);

        tracing::debug!(block = n, "block opened");
        if let Some(controller) = self.controller() {
            controller.block_opened(n);
        }
        Ok(())
    }

    pub fn add_item(&self, block_number: u64, item: BlockItem) -> Result<(), BufferError> {
        if !self.streaming_enabled {
            return Ok(());
        }
        let unit = self
            .get_block_state(block_number)
            .ok_or(BufferError::BlockNotFound(block_number))?;
        unit.add_item(item)?;
        if let Some(controller) = self.controller() {
            controller.block_updated(block_number);
        }
        Ok(())
    }

    pub fn close_block(&self, block_number: u64) -> Result<(), BufferError> {
        if !self.streaming_enabled {
            return Ok(());
        }
        let unit = self
            .get_block_state(block_number)
            .ok_or(BufferError::BlockNotFound(block_number))?;
        unit.close_block()?;
        tracing::debug!(block = block_number, items = unit.item_count(), "block closed");
        if let Some(controller) = self.controller() {
            controller.block_updated(block_number);
        }
        Ok(())
    }

    /// Wait until the producer may start another block.
    pub async fn ensure_new_blocks_permitted(&self) {
        let mut rx = self.gate.subscribe();
        if *rx.borrow() == BackpressureGate::Engaged {
            tracing::info!("backpressure engaged, waiting for buffer to recover");
        }
        // The sender lives as long as `self`, so this only returns once open.
        let _ = rx.wait_for(|g| *g == BackpressureGate::Open).await;
    }

    pub fn is_backpressure_engaged(&self) -> bool {
        *self.gate.borrow() == BackpressureGate::Engaged
    }

    // ── Acknowledgement ───────────────────────────────────────────────────────

    pub fn set_latest_acknowledged_block(&self, block_number: u64) {
        if !self.streaming_enabled {
            return;
        }
        let previous = self.highest_acked.fetch_max(block_number as i64, Ordering::AcqRel);
        let current = previous.max(block_number as i64);
        self.metrics.set_latest_acked_block(current);
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn get_block_state(&self, block_number: u64) -> Option<Arc<BlockUnit>> {
        self.blocks.get(&block_number).map(|u| Arc::clone(u.value()))
    }

    pub fn is_acked(&self, block_number: u64) -> bool {
        (block_number as i64) <= self.highest_acked.load(Ordering::Acquire)
    }

    pub fn earliest_available_block_number(&self) -> i64 {
        self.earliest.load(Ordering::Acquire)
    }

    pub fn last_block_number_produced(&self) -> i64 {
        self.last_produced.load(Ordering::Acquire)
    }

    pub fn highest_acked_block_number(&self) -> i64 {
        self.highest_acked.load(Ordering::Acquire)
    }

    /// The block after the acknowledged watermark, or the earliest buffered
    /// block before anything has been acknowledged.
    pub fn lowest_unacked_block_number(&self) -> i64 {
        let acked = self.highest_acked.load(Ordering::Acquire);
        if acked >= 0 {
            acked + 1
        } else {
            self.earliest_available_block_number()
        }
    }

    pub fn buffered_block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn last_prune_result(&self) -> Option<PruneResult> {
        self.check.lock().last_result.clone()
    }

    fn lower_earliest(&self, block_number: i64) {
        let _ = self
            .earliest
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < 0 || block_number < current).then_some(block_number)
            });
    }

    fn recompute_earliest(&self) {
        let earliest = self.blocks.iter().map(|e| *e.key() as i64).min().unwrap_or(-1);
        self.earliest.store(earliest, Ordering::Release);
    }

    // ── Prune and saturation ──────────────────────────────────────────────────

    pub fn ideal_max_buffer_size(&self) -> u64 {
        let period_ms = self.block_period.as_millis() as u64;
        if period_ms == 0 {
            return DEFAULT_IDEAL_BUFFER_SIZE;
        }
        self.block_ttl.as_millis() as u64 / period_ms
    }

    fn prune(&self) -> PruneResult {
        let ideal = self.ideal_max_buffer_size();
        let now = SystemTime::now();
        let mut checked = 0;
        let mut pending_ack = 0;
        let mut oldest_unacked: Option<SystemTime> = None;
        let mut to_remove = Vec::new();

        for entry in self.blocks.iter() {
            checked += 1;
            let Some(closed_at) = entry.value().closed_at() else {
                continue;
            };
            if self.is_acked(*entry.key()) {
                to_remove.push(*entry.key());
            } else {
                pending_ack += 1;
                oldest_unacked = Some(match oldest_unacked {
                    Some(t) if t <= closed_at => t,
                    _ => closed_at,
                });
            }
        }

        for n in &to_remove {
            self.blocks.remove(n);
        }
        self.recompute_earliest();

        let age_ms = oldest_unacked
            .map(|t| now.duration_since(t).map(|d| d.as_millis() as i64).unwrap_or(0))
            .unwrap_or(-1);

        if !to_remove.is_empty() {
            tracing::debug!(pruned = to_remove.len(), pending_ack, "pruned acknowledged blocks");
        }
        PruneResult::new(ideal, checked, pending_ack, to_remove.len(), age_ms)
    }

    /// Run one prune pass and react to the resulting saturation.
    pub fn check_buffer(&self) -> PruneResult {
        let result = self.prune();

        self.metrics.set_buffer_saturation(result.saturation_percent);
        self.metrics.set_oldest_unacked_age_ms(result.oldest_unacked_age_ms);
        self.metrics.set_latest_acked_block(self.highest_acked_block_number());

        let current = if result.is_saturated {
            Regime::Saturated
        } else if result.saturation_percent >= self.action_stage_threshold {
            Regime::ActionStage
        } else {
            Regime::BelowActionStage
        };

        let mut check = self.check.lock();
        let previous = check.regime;
        match (previous, current) {
            (_, Regime::Saturated) => {
                self.enable_backpressure(&result);
                self.switch_block_node_if_permitted(&mut check);
            }
            (Regime::BelowActionStage | Regime::ActionStage, Regime::ActionStage) => {
                self.switch_block_node_if_permitted(&mut check);
            }
            (Regime::Saturated, _) => {
                self.disable_backpressure_if_recovered(&mut check, &result);
            }
            (_, Regime::BelowActionStage) => {}
        }

        if check.awaiting_recovery && !result.is_saturated {
            self.disable_backpressure_if_recovered(&mut check, &result);
        }

        if previous != current {
            tracing::info!(
                from = ?previous,
                to = ?current,
                saturation = result.saturation_percent,
                pending = result.pending_ack,
                ideal = result.ideal_max_buffer_size,
                "buffer regime changed"
            );
        }
        check.regime = current;
        check.last_result = Some(result.clone());
        result
    }

    fn enable_backpressure(&self, result: &PruneResult) {
        if !self.backpressure_applies || self.stopped.load(Ordering::Acquire) {
            return;
        }
        let previous = self.gate.send_replace(BackpressureGate::Engaged);
        if previous == BackpressureGate::Open {
            tracing::warn!(
                saturation = result.saturation_percent,
                pending = result.pending_ack,
                "buffer saturated, engaging backpressure"
            );
        }
    }

    fn disable_backpressure_if_recovered(&self, check: &mut CheckState, result: &PruneResult) {
        if result.saturation_percent > self.recovery_threshold {
            check.awaiting_recovery = true;
            tracing::debug!(
                saturation = result.saturation_percent,
                recovery_threshold = self.recovery_threshold,
                "buffer not yet recovered"
            );
            return;
        }
        check.awaiting_recovery = false;
        let previous = self.gate.send_replace(BackpressureGate::Open);
        if previous == BackpressureGate::Engaged {
            tracing::info!(saturation = result.saturation_percent, "buffer recovered, releasing backpressure");
        }
    }

    fn switch_block_node_if_permitted(&self, check: &mut CheckState) {
        let now = Instant::now();
        if let Some(last) = check.last_switch {
            if now.duration_since(last) < self.action_grace_period {
                return;
            }
        }
        check.last_switch = Some(now);
        if let Some(controller) = self.controller() {
            tracing::info!("buffer in action stage, selecting a new block node");
            controller.select_new_block_node_for_streaming(true);
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Snapshot every closed block to disk.
    pub fn persist_buffer(&self) -> anyhow::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let mut blocks: Vec<PersistedBlock> = self
            .blocks
            .iter()
            .filter_map(|entry| {
                let unit = entry.value();
                let closed_at = unit.closed_at()?;
                Some(PersistedBlock {
                    block_number: unit.block_number(),
                    closed_at,
                    proof_sent: unit.proof_sent(),
                    acknowledged: self.is_acked(unit.block_number()),
                    items: unit.items(),
                })
            })
            .collect();
        blocks.sort_by_key(|b| b.block_number);

        store.write(&blocks)?;
        Ok(())
    }

    /// Rebuild the buffer from the newest snapshot. Returns blocks restored.
    pub fn load_buffer_from_disk(&self) -> anyhow::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let persisted = store.read()?;
        let restored = persisted.len();
        for block in persisted {
            let n = block.block_number;
            let unit = BlockUnit::new(n);
            for item in block.items {
                unit.add_item(item)?;
            }
            unit.close_block_at(block.closed_at)?;
            unit.process_pending_items(self.batch_size, self.max_request_bytes);
            if block.proof_sent {
                unit.mark_all_requests_sent();
            }
            self.blocks.insert(n, Arc::new(unit));
            self.last_produced.fetch_max(n as i64, Ordering::AcqRel);
            self.lower_earliest(n as i64);
            if block.acknowledged {
                self.highest_acked.fetch_max(n as i64, Ordering::AcqRel);
            }
        }

        if restored > 0 {
            tracing::info!(
                blocks = restored,
                earliest = self.earliest_available_block_number(),
                latest = self.last_block_number_produced(),
                acked = self.highest_acked_block_number(),
                "buffer restored from disk"
            );
        }
        Ok(restored)
    }

    // ── Loops ─────────────────────────────────────────────────────────────────

    pub async fn run_prune_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        // A zero interval disables checks but the loop keeps ticking.
        let period = if self.prune_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.prune_interval
        };
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if !self.prune_interval.is_zero() && !self.stopped.load(Ordering::Acquire) {
                        self.check_buffer();
                    }
                }
            }
        }
        tracing::debug!("prune loop stopped");
        Ok(())
    }

    pub async fn run_persist_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        if self.store.is_none() || self.persist_interval.is_zero() {
            let _ = shutdown.recv().await;
            return Ok(());
        }

        let mut interval = tokio::time::interval(self.persist_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.persist_buffer() {
                        tracing::warn!(error = %e, "failed to persist buffer");
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop reacting to saturation and release any waiting producer.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.gate.send_replace(BackpressureGate::Open);
        tracing::info!("block buffer shut down");
    }
}

impl CleanupHandler for BlockBufferService {
    fn remove_block_states_up_to(&self, block: u64) {
        self.blocks
            .retain(|n, unit| *n > block || !unit.is_closed());
        self.recompute_earliest();
    }

    fn on_block_ready_for_cleanup(&self, block: u64) {
        let Some(store) = &self.store else {
            return;
        };
        match store.delete_blocks_up_to(block) {
            Ok(removed) => tracing::debug!(block, removed, "deleted persisted blocks"),
            Err(e) => tracing::warn!(block, error = %e, "failed to delete persisted blocks"),
        }
    }
}
