//! One stream to one block node.
//!
//! A connection is created `Uninitialized` when the manager schedules an
//! attempt, becomes `Active` once the manager hands it a stream and makes it
//! the streaming target, and ends `Closed`. It never reopens; recovery always
//! builds a fresh connection.
//!
//! Two tasks run per active connection:
//!   send loop      - walks the buffer block by block, one request at a time
//!   response loop  - applies acks, skips, resends and end-of-stream codes

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use blockstream_core::config::BlockNodeConfig;
use blockstream_core::wire::{EndOfStreamCode, EndStreamCode, PublishRequest, PublishResponse, NO_BLOCK};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use crate::backoff::INITIAL_RETRY_DELAY;
use crate::buffer::BlockBufferService;
use crate::metrics::StreamMetrics;
use crate::transport::{BlockNodeStream, StreamEvent};

/// Delay before retrying a node that asked for a block we no longer hold.
pub const LONGER_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Active,
    Closed,
}

/// What a connection reports back to its manager.
pub trait ConnectionEvents: Send + Sync {
    fn update_last_verified_block(&self, node: &BlockNodeConfig, block: u64);

    /// Count one EndOfStream from `node`; true if it is now over the limit.
    fn record_end_of_stream_and_check_limit(&self, node: &BlockNodeConfig) -> bool;

    fn end_of_stream_schedule_delay(&self) -> Duration;

    /// Fail over: retry this node after `delay` and stream elsewhere now.
    fn reschedule_connection(&self, connection: &Arc<BlockNodeConnection>, delay: Duration);

    /// Reconnect to the same node immediately, starting at `block`.
    fn restart_connection(&self, connection: &Arc<BlockNodeConnection>, block: Option<u64>);

    /// This connection ended its own stream; pick another node.
    fn connection_resets_stream(&self, connection: &Arc<BlockNodeConnection>);
}

pub struct BlockNodeConnection {
    id: u64,
    node: BlockNodeConfig,
    buffer: Arc<BlockBufferService>,
    events: Weak<dyn ConnectionEvents>,
    metrics: Arc<dyn StreamMetrics>,
    state: watch::Sender<ConnectionState>,
    /// Block the send loop is on, -1 before the first target.
    streaming_block: AtomicI64,
    /// Pending jump, -1 when none.
    jump_target: AtomicI64,
    request_index: AtomicUsize,
    new_block: Notify,
    new_request: Notify,
    requests: Mutex<Option<mpsc::Sender<Arc<PublishRequest>>>>,
}

impl BlockNodeConnection {
    pub fn new(
        id: u64,
        node: BlockNodeConfig,
        buffer: Arc<BlockBufferService>,
        events: Weak<dyn ConnectionEvents>,
        metrics: Arc<dyn StreamMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            id,
            node,
            buffer,
            events,
            metrics,
            state,
            streaming_block: AtomicI64::new(-1),
            jump_target: AtomicI64::new(-1),
            request_index: AtomicUsize::new(0),
            new_block: Notify::new(),
            new_request: Notify::new(),
            requests: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> &BlockNodeConfig {
        &self.node
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn current_streaming_block_number(&self) -> i64 {
        self.streaming_block.load(Ordering::Acquire)
    }

    pub fn jump_target(&self) -> i64 {
        self.jump_target.load(Ordering::Acquire)
    }

    pub fn request_index(&self) -> usize {
        self.request_index.load(Ordering::Acquire)
    }

    /// Wait until this connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Attach the transport and spawn both loops. The send loop idles until
    /// the connection is activated.
    pub fn start(self: &Arc<Self>, stream: BlockNodeStream) {
        *self.requests.lock() = Some(stream.requests);
        tokio::spawn(Arc::clone(self).run_send_loop());
        tokio::spawn(Arc::clone(self).run_response_loop(stream.events));
    }

    /// Make this the streaming connection and point it at `block`, else the
    /// lowest unacknowledged block, else the earliest buffered one.
    pub fn activate(&self, block: Option<u64>) -> bool {
        let activated = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Uninitialized {
                *s = ConnectionState::Active;
                true
            } else {
                false
            }
        });
        if !activated {
            return false;
        }

        let target = match block {
            Some(n) => n as i64,
            None => match self.buffer.lowest_unacked_block_number() {
                n if n >= 0 => n,
                _ => self.buffer.earliest_available_block_number(),
            },
        };
        if target >= 0 {
            self.jump_to_block(target as u64);
        }
        tracing::info!(node = %self.node, connection = self.id, start_block = target, "connection active");
        true
    }

    /// Close the stream. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        let previous = self.state.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return false;
        }
        // Dropping the sender ends the outbound half.
        self.requests.lock().take();
        self.new_block.notify_waiters();
        self.new_request.notify_waiters();
        tracing::info!(node = %self.node, connection = self.id, "connection closed");
        true
    }

    pub fn jump_to_block(&self, block: u64) {
        tracing::debug!(node = %self.node, block, "jumping to block");
        self.jump_target.store(block as i64, Ordering::Release);
        self.new_block.notify_one();
    }

    /// A new block was opened in the buffer.
    pub fn on_block_opened(&self, block: u64) {
        if self.current_streaming_block_number() < 0 && self.jump_target() < 0 {
            self.jump_to_block(block);
        } else {
            self.new_block.notify_one();
        }
    }

    /// Items were added to, or a close was recorded on, a buffered block.
    pub fn on_block_updated(&self) {
        self.new_request.notify_one();
    }

    /// Tell the node we are resetting, then reconnect at `block`.
    pub async fn end_stream_and_restart_at_block(self: &Arc<Self>, block: u64) {
        self.send_end_stream(EndStreamCode::Reset).await;
        if self.close() {
            if let Some(events) = self.events.upgrade() {
                events.restart_connection(self, Some(block));
            }
        }
    }

    fn close_and_reschedule(self: &Arc<Self>, delay: Duration) {
        if self.close() {
            if let Some(events) = self.events.upgrade() {
                events.reschedule_connection(self, delay);
            }
        }
    }

    fn close_and_restart(self: &Arc<Self>, block: Option<u64>) {
        if self.close() {
            if let Some(events) = self.events.upgrade() {
                events.restart_connection(self, block);
            }
        }
    }

    async fn send_end_stream(&self, code: EndStreamCode) {
        let as_wire = |n: i64| if n < 0 { NO_BLOCK } else { n as u64 };
        let request = PublishRequest::EndStream {
            code,
            earliest_block: as_wire(self.buffer.earliest_available_block_number()),
            latest_block: as_wire(self.buffer.last_block_number_produced()),
        };
        tracing::info!(node = %self.node, ?code, "ending stream");
        self.send_request(Arc::new(request)).await;
    }

    async fn send_request(&self, request: Arc<PublishRequest>) -> bool {
        let sender = self.requests.lock().clone();
        match sender {
            Some(sender) => sender.send(request).await.is_ok(),
            None => false,
        }
    }

    // ── Send loop ─────────────────────────────────────────────────────────────

    async fn run_send_loop(self: Arc<Self>) {
        let mut state = self.state.subscribe();
        let active = state
            .wait_for(|s| *s != ConnectionState::Uninitialized)
            .await
            .map(|s| *s == ConnectionState::Active)
            .unwrap_or(false);
        if !active {
            return;
        }

        let batch_size = self.buffer.batch_size();
        let max_request_bytes = self.buffer.max_request_bytes();

        loop {
            if self.is_closed() {
                break;
            }

            let jump = self.jump_target.swap(-1, Ordering::AcqRel);
            if jump >= 0 {
                self.streaming_block.store(jump, Ordering::Release);
                self.request_index.store(0, Ordering::Release);
            }

            let block = self.current_streaming_block_number();
            if block < 0 {
                self.wait_for_block_signal().await;
                continue;
            }

            let Some(unit) = self.buffer.get_block_state(block as u64) else {
                if self.jump_target() >= 0 {
                    continue;
                }
                if self.buffer.last_block_number_produced() > block {
                    tracing::warn!(
                        node = %self.node,
                        block,
                        "block no longer buffered, rescheduling connection"
                    );
                    self.close_and_reschedule(LONGER_RETRY_DELAY);
                    break;
                }
                self.wait_for_block_signal().await;
                continue;
            };

            unit.process_pending_items(batch_size, max_request_bytes);
            let count = unit.request_count();
            let mut index = self.request_index();
            if index > count {
                tracing::warn!(node = %self.node, block, index, count, "request index out of range, resetting");
                index = 0;
                self.request_index.store(0, Ordering::Release);
            }

            if index < count {
                if let Some(request) = unit.get_request(index) {
                    if !self.send_request(request).await {
                        tracing::warn!(node = %self.node, block, "request stream gone");
                        self.close_and_reschedule(INITIAL_RETRY_DELAY);
                        break;
                    }
                    unit.mark_request_sent(index);
                    self.metrics.record_request_sent(block as u64);
                    tracing::trace!(node = %self.node, block, index, "request sent");
                    // A jump taken while sending resets the index at the top.
                    let _ = self.request_index.compare_exchange(
                        index,
                        index + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    continue;
                }
            }

            if index == count && unit.is_complete() {
                if self
                    .streaming_block
                    .compare_exchange(block, block + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.request_index.store(0, Ordering::Release);
                    tracing::debug!(node = %self.node, block, "block fully sent");
                }
                continue;
            }

            self.wait_for_any_signal().await;
        }
        tracing::debug!(node = %self.node, connection = self.id, "send loop stopped");
    }

    async fn wait_for_block_signal(&self) {
        tokio::select! {
            _ = self.new_block.notified() => {}
            _ = self.closed() => {}
        }
    }

    async fn wait_for_any_signal(&self) {
        tokio::select! {
            _ = self.new_block.notified() => {}
            _ = self.new_request.notified() => {}
            _ = self.closed() => {}
        }
    }

    // ── Response loop ─────────────────────────────────────────────────────────

    async fn run_response_loop(self: Arc<Self>, mut events: mpsc::Receiver<StreamEvent>) {
        loop {
            // No watch guard may be held across `handle_response`.
            tokio::select! {
                _ = self.closed() => break,
                event = events.recv() => match event {
                    Some(StreamEvent::Response(response)) => self.handle_response(response).await,
                    Some(StreamEvent::Error(error)) => {
                        tracing::warn!(node = %self.node, %error, "stream error");
                        self.close_and_reschedule(INITIAL_RETRY_DELAY);
                        break;
                    }
                    None => {
                        if !self.is_closed() {
                            tracing::info!(node = %self.node, "stream completed by block node");
                        }
                        self.close_and_reschedule(INITIAL_RETRY_DELAY);
                        break;
                    }
                },
            }
        }
    }

    async fn handle_response(self: &Arc<Self>, response: PublishResponse) {
        match response {
            PublishResponse::Acknowledgement {
                block_number,
                block_already_exists,
            } => {
                if block_number == NO_BLOCK {
                    tracing::warn!(node = %self.node, "ignoring acknowledgement without a block number");
                    return;
                }
                self.metrics.record_ack(block_number);
                tracing::debug!(node = %self.node, block = block_number, block_already_exists, "block acknowledged");
                if block_number as i64 >= self.current_streaming_block_number() {
                    if let Some(next) = next_block(block_number) {
                        self.jump_to_block(next);
                    }
                }
                if let Some(events) = self.events.upgrade() {
                    events.update_last_verified_block(&self.node, block_number);
                }
            }
            PublishResponse::SkipBlock { block_number } => {
                self.metrics.record_skip(block_number);
                let current = self.current_streaming_block_number();
                if current >= 0 && block_number as i64 == current {
                    if let Some(next) = next_block(block_number) {
                        tracing::debug!(node = %self.node, block = block_number, "skipping block");
                        self.jump_to_block(next);
                    }
                }
            }
            PublishResponse::ResendBlock { block_number } => {
                self.metrics.record_resend(block_number);
                if self.buffer.get_block_state(block_number).is_some() {
                    tracing::info!(node = %self.node, block = block_number, "resending block");
                    self.jump_to_block(block_number);
                } else {
                    tracing::warn!(node = %self.node, block = block_number, "resend requested for block not in buffer");
                    self.close_and_reschedule(INITIAL_RETRY_DELAY);
                }
            }
            PublishResponse::EndOfStream { code, block_number } => {
                self.metrics.record_end_of_stream(code);
                self.handle_end_of_stream(code, block_number).await;
            }
        }
    }

    async fn handle_end_of_stream(self: &Arc<Self>, code: EndOfStreamCode, last_verified: u64) {
        let Some(events) = self.events.upgrade() else {
            self.close();
            return;
        };

        tracing::info!(node = %self.node, ?code, last_verified, "end of stream received");
        if events.record_end_of_stream_and_check_limit(&self.node) {
            let delay = events.end_of_stream_schedule_delay();
            tracing::warn!(node = %self.node, retry_in = ?delay, "too many end of streams, backing off");
            if self.close() {
                events.reschedule_connection(self, delay);
            }
            return;
        }

        match code {
            EndOfStreamCode::Success
            | EndOfStreamCode::InternalError
            | EndOfStreamCode::PersistenceFailed
            | EndOfStreamCode::Unknown(_) => {
                self.close_and_reschedule(INITIAL_RETRY_DELAY);
            }
            EndOfStreamCode::Timeout | EndOfStreamCode::OutOfOrder | EndOfStreamCode::BadStateProof => {
                let restart = next_block(last_verified);
                self.close_and_restart(restart);
            }
            EndOfStreamCode::Behind => {
                let target = if last_verified == NO_BLOCK {
                    Some(0)
                } else {
                    next_block(last_verified)
                };
                if let Some(target) = target.filter(|t| self.buffer.get_block_state(*t).is_some()) {
                    tracing::info!(node = %self.node, block = target, "block node behind, catching it up");
                    self.jump_to_block(target);
                } else {
                    tracing::warn!(node = %self.node, last_verified, "block node too far behind");
                    self.send_end_stream(EndStreamCode::TooFarBehind).await;
                    if self.close() {
                        events.connection_resets_stream(self);
                    }
                }
            }
        }
    }
}

/// The block after `n`, or `None` for `NO_BLOCK` and on overflow.
fn next_block(n: u64) -> Option<u64> {
    if n == NO_BLOCK {
        return None;
    }
    n.checked_add(1)
}

impl std::fmt::Debug for BlockNodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockNodeConnection")
            .field("id", &self.id)
            .field("node", &self.node.to_string())
            .field("state", &self.state())
            .field("streaming_block", &self.current_streaming_block_number())
            .finish()
    }
}
