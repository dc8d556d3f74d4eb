//! Acknowledgement tracker.
//!
//! Keeps each block node's verified watermark. A block becomes "ready" the
//! first time any node acknowledges a number above every number that was
//! ready before it (first acker wins). Readiness drives buffer cleanup and,
//! if configured, deletion of the persisted files.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Receives cleanup callbacks once a block is acknowledged.
pub trait CleanupHandler: Send + Sync {
    /// Drop in-memory state for closed blocks `<= block`.
    fn remove_block_states_up_to(&self, block: u64);

    /// Delete persisted state for blocks `<= block`.
    fn on_block_ready_for_cleanup(&self, block: u64);
}

pub struct AckTracker {
    per_node: DashMap<String, u64>,
    /// Highest ready block, -1 before the first ack.
    highest_ready: AtomicI64,
    handler: Arc<dyn CleanupHandler>,
    delete_files_on_disk: bool,
}

impl AckTracker {
    pub fn new(handler: Arc<dyn CleanupHandler>, delete_files_on_disk: bool) -> Self {
        Self {
            per_node: DashMap::new(),
            highest_ready: AtomicI64::new(-1),
            handler,
            delete_files_on_disk,
        }
    }

    pub fn track_block_acknowledgement(&self, node: &str, block: u64) {
        {
            let mut entry = self.per_node.entry(node.to_string()).or_insert(block);
            if *entry > block {
                return;
            }
            *entry = block;
        }

        let previous = self.highest_ready.fetch_max(block as i64, Ordering::AcqRel);
        if (block as i64) <= previous {
            return;
        }

        tracing::debug!(node, block, "block ready for cleanup");
        self.handler.remove_block_states_up_to(block);
        if self.delete_files_on_disk {
            self.handler.on_block_ready_for_cleanup(block);
        }
    }

    /// Highest block any node has verified, or -1.
    pub fn get_last_verified_block(&self) -> i64 {
        self.highest_ready.load(Ordering::Acquire)
    }

    pub fn get_last_verified_block_for(&self, node: &str) -> i64 {
        self.per_node
            .get(node)
            .map(|b| *b as i64)
            .unwrap_or(-1)
    }
}
