//! Metrics sink for the streaming pipeline.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use blockstream_core::wire::EndOfStreamCode;

/// Where the buffer and connections report what they observe.
pub trait StreamMetrics: Send + Sync {
    fn set_buffer_saturation(&self, percent: f64);
    fn set_oldest_unacked_age_ms(&self, age_ms: i64);
    fn set_latest_acked_block(&self, block: i64);
    fn set_producing_block(&self, block: i64);
    fn record_ack(&self, block: u64);
    fn record_skip(&self, block: u64);
    fn record_resend(&self, block: u64);
    fn record_end_of_stream(&self, code: EndOfStreamCode);
    fn record_request_sent(&self, block: u64);
}

pub struct NoopMetrics;

impl StreamMetrics for NoopMetrics {
    fn set_buffer_saturation(&self, _percent: f64) {}
    fn set_oldest_unacked_age_ms(&self, _age_ms: i64) {}
    fn set_latest_acked_block(&self, _block: i64) {}
    fn set_producing_block(&self, _block: i64) {}
    fn record_ack(&self, _block: u64) {}
    fn record_skip(&self, _block: u64) {}
    fn record_resend(&self, _block: u64) {}
    fn record_end_of_stream(&self, _code: EndOfStreamCode) {}
    fn record_request_sent(&self, _block: u64) {}
}

/// Atomics-backed metrics with a point-in-time snapshot.
pub struct StreamStats {
    /// Saturation percent, stored as f64 bits.
    saturation_bits: AtomicU64,
    oldest_unacked_age_ms: AtomicI64,
    latest_acked: AtomicI64,
    producing: AtomicI64,
    acks: AtomicU64,
    skips: AtomicU64,
    resends: AtomicU64,
    end_of_streams: AtomicU64,
    requests_sent: AtomicU64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub saturation_percent: f64,
    pub oldest_unacked_age_ms: i64,
    pub latest_acked_block: i64,
    pub producing_block: i64,
    pub acks: u64,
    pub skips: u64,
    pub resends: u64,
    pub end_of_streams: u64,
    pub requests_sent: u64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self {
            saturation_bits: AtomicU64::new(0f64.to_bits()),
            oldest_unacked_age_ms: AtomicI64::new(-1),
            latest_acked: AtomicI64::new(-1),
            producing: AtomicI64::new(-1),
            acks: AtomicU64::new(0),
            skips: AtomicU64::new(0),
            resends: AtomicU64::new(0),
            end_of_streams: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            saturation_percent: f64::from_bits(self.saturation_bits.load(Ordering::Relaxed)),
            oldest_unacked_age_ms: self.oldest_unacked_age_ms.load(Ordering::Relaxed),
            latest_acked_block: self.latest_acked.load(Ordering::Relaxed),
            producing_block: self.producing.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            resends: self.resends.load(Ordering::Relaxed),
            end_of_streams: self.end_of_streams.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
        }
    }

    pub fn print_stats(&self) {
        let s = self.snapshot();
        tracing::info!(
            saturation = s.saturation_percent,
            oldest_unacked_ms = s.oldest_unacked_age_ms,
            latest_acked = s.latest_acked_block,
            producing = s.producing_block,
            acks = s.acks,
            skips = s.skips,
            resends = s.resends,
            end_of_streams = s.end_of_streams,
            requests_sent = s.requests_sent,
            "stream stats"
        );
    }
}

impl Default for StreamStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamMetrics for StreamStats {
    fn set_buffer_saturation(&self, percent: f64) {
        self.saturation_bits.store(percent.to_bits(), Ordering::Relaxed);
    }

    fn set_oldest_unacked_age_ms(&self, age_ms: i64) {
        self.oldest_unacked_age_ms.store(age_ms, Ordering::Relaxed);
    }

    fn set_latest_acked_block(&self, block: i64) {
        self.latest_acked.store(block, Ordering::Relaxed);
    }

    fn set_producing_block(&self, block: i64) {
        self.producing.store(block, Ordering::Relaxed);
    }

    fn record_ack(&self, _block: u64) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    fn record_skip(&self, _block: u64) {
        self.skips.fetch_add(1, Ordering::Relaxed);
    }

    fn record_resend(&self, _block: u64) {
        self.resends.fetch_add(1, Ordering::Relaxed);
    }

    fn record_end_of_stream(&self, code: EndOfStreamCode) {
        tracing::trace!(?code, "end of stream recorded");
        self.end_of_streams.fetch_add(1, Ordering::Relaxed);
    }

    fn record_request_sent(&self, _block: u64) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }
}
