//! Synthetic block producer.
//!
//! Stands in for the node's block production when `producer.enabled` is set:
//! one block per block period, each a header, a run of transactions and a
//! proof. Honors backpressure exactly as a real producer must.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use blockstream_core::config::ProducerSettings;
use blockstream_core::wire::{BlockItem, ItemKind};
use blockstream_services::{BlockBufferService, BufferError};

pub struct SyntheticProducer {
    buffer: Arc<BlockBufferService>,
    settings: ProducerSettings,
    period: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl SyntheticProducer {
    pub fn new(
        buffer: Arc<BlockBufferService>,
        settings: ProducerSettings,
        period: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            buffer,
            settings,
            period,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let period = if self.period.is_zero() {
            Duration::from_secs(1)
        } else {
            self.period
        };
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let resume = (self.buffer.last_block_number_produced() + 1).max(0) as u64;
        let mut next = resume.max(self.settings.first_block);
        tracing::info!(first_block = next, period = ?period, "synthetic producer started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = self.buffer.ensure_new_blocks_permitted() => {}
            }

            match self.produce_block(next) {
                Ok(()) => {
                    tracing::debug!(block = next, "synthetic block produced");
                    next += 1;
                }
                Err(e) => {
                    tracing::warn!(block = next, error = %e, "failed to produce block");
                    next += 1;
                }
            }
        }
        tracing::info!(last_block = next, "synthetic producer stopped");
        Ok(())
    }

    fn produce_block(&self, block: u64) -> Result<(), BufferError> {
        self.buffer.open_block(block as i64)?;

        let fill = (block % 251) as u8;
        self.buffer
            .add_item(block, BlockItem::new(ItemKind::BlockHeader, block.to_be_bytes().to_vec()))?;
        for _ in 0..self.settings.items_per_block {
            let payload = Bytes::from(vec![fill; self.settings.item_bytes]);
            self.buffer
                .add_item(block, BlockItem::new(ItemKind::Transaction, payload))?;
        }
        self.buffer
            .add_item(block, BlockItem::new(ItemKind::BlockProof, vec![fill; 48]))?;
        self.buffer.close_block(block)
    }
}
