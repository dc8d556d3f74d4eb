//! One buffered block: its items and the requests generated from them.
//!
//! Items are appended while the block is open. `process_pending_items` packs
//! whatever has not been packed yet into `PublishRequest::BlockItems`
//! requests. A trailing partial request is only sealed once the block is
//! closed or the proof item has arrived, so an open block never emits a
//! short request that a later item could have joined.

use std::sync::Arc;
use std::time::SystemTime;

use blockstream_core::wire::{BlockItem, PublishRequest};
use parking_lot::Mutex;

use crate::buffer::BufferError;

struct GeneratedRequest {
    request: Arc<PublishRequest>,
    carries_proof: bool,
    sent: bool,
}

#[derive(Default)]
struct UnitState {
    items: Vec<BlockItem>,
    /// Index into `items` of the first item not yet packed.
    packed: usize,
    requests: Vec<GeneratedRequest>,
    closed_at: Option<SystemTime>,
    proof_sent: bool,
}

pub struct BlockUnit {
    block_number: u64,
    state: Mutex<UnitState>,
}

impl BlockUnit {
    pub fn new(block_number: u64) -> Self {
        Self {
            block_number,
            state: Mutex::new(UnitState::default()),
        }
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn add_item(&self, item: BlockItem) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        if state.closed_at.is_some() {
            return Err(BufferError::BlockClosed(self.block_number));
        }
        state.items.push(item);
        Ok(())
    }

    /// Pack unpacked items into requests. Calling it again with nothing new
    /// to pack changes nothing.
    ///
    /// A request is sealed when it holds `batch_size` items (0 = no count
    /// limit) or when its encoded size first exceeds `max_request_bytes`.
    /// An item that alone exceeds `max_request_bytes` is dropped. A sealed
    /// request can therefore approach twice `max_request_bytes`;
    /// `wire::MAX_FRAME_BYTES` is sized to carry it.
    pub fn process_pending_items(&self, batch_size: usize, max_request_bytes: usize) {
        let mut state = self.state.lock();
        let flush_tail = state.closed_at.is_some()
            || state.items[state.packed..].iter().any(BlockItem::is_proof);

        let mut batch: Vec<BlockItem> = Vec::new();
        let mut batch_bytes = 0usize;
        let mut batch_start = state.packed;
        let mut cursor = state.packed;
        let mut sealed = Vec::new();

        while cursor < state.items.len() {
            let item = &state.items[cursor];
            cursor += 1;

            let len = item.encoded_len();
            if len > max_request_bytes {
                tracing::warn!(
                    block = self.block_number,
                    item_bytes = len,
                    max_request_bytes,
                    "dropping oversize block item"
                );
                if batch.is_empty() {
                    batch_start = cursor;
                }
                continue;
            }

            batch.push(item.clone());
            batch_bytes += len;

            let full = batch_size != 0 && batch.len() >= batch_size;
            if full || batch_bytes > max_request_bytes {
                sealed.push(std::mem::take(&mut batch));
                batch_bytes = 0;
                batch_start = cursor;
            }
        }

        if !batch.is_empty() && flush_tail {
            sealed.push(std::mem::take(&mut batch));
            batch_start = cursor;
        }

        // Unsealed tail items stay unpacked for the next call.
        state.packed = if batch.is_empty() { cursor } else { batch_start };

        for items in sealed {
            let carries_proof = items.iter().any(BlockItem::is_proof);
            state.requests.push(GeneratedRequest {
                request: Arc::new(PublishRequest::BlockItems {
                    block_number: self.block_number,
                    items,
                }),
                carries_proof,
                sent: false,
            });
        }
    }

    pub fn get_request(&self, index: usize) -> Option<Arc<PublishRequest>> {
        self.state
            .lock()
            .requests
            .get(index)
            .map(|r| Arc::clone(&r.request))
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn mark_request_sent(&self, index: usize) {
        let mut state = self.state.lock();
        let Some(request) = state.requests.get_mut(index) else {
            return;
        };
        request.sent = true;
        if request.carries_proof {
            state.proof_sent = true;
        }
    }

    /// Mark every generated request as sent. Used when restoring a block
    /// whose proof already went out before a restart.
    pub fn mark_all_requests_sent(&self) {
        let mut state = self.state.lock();
        let mut proof = false;
        for request in state.requests.iter_mut() {
            request.sent = true;
            proof |= request.carries_proof;
        }
        state.proof_sent |= proof;
    }

    pub fn close_block(&self) -> Result<(), BufferError> {
        self.close_block_at(SystemTime::now())
    }

    pub fn close_block_at(&self, at: SystemTime) -> Result<(), BufferError> {
        let mut state = self.state.lock();
        if state.closed_at.is_some() {
            return Err(BufferError::BlockClosed(self.block_number));
        }
        state.closed_at = Some(at);
        Ok(())
    }

    pub fn closed_at(&self) -> Option<SystemTime> {
        self.state.lock().closed_at
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed_at.is_some()
    }

    pub fn proof_sent(&self) -> bool {
        self.state.lock().proof_sent
    }

    pub fn items(&self) -> Vec<BlockItem> {
        self.state.lock().items.clone()
    }

    pub fn item_count(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.closed_at.is_some()
            && state.packed == state.items.len()
            && state.requests.iter().all(|r| r.sent)
    }
}

impl std::fmt::Debug for BlockUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BlockUnit")
            .field("block_number", &self.block_number)
            .field("items", &state.items.len())
            .field("requests", &state.requests.len())
            .field("closed_at", &state.closed_at)
            .field("proof_sent", &state.proof_sent)
            .finish()
    }
}
