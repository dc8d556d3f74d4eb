//! On-disk record for one buffered block.
//!
//! A persisted file is `[u32 BE record_len][RecordHeader][payload]`, where the
//! payload is the block's item list in the same encoding the wire uses.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::wire::{decode_items, encode_items, BlockItem, WireError};

pub const RECORD_VERSION: u8 = 1;
pub const RECORD_HEADER_LEN: usize = 27;

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Wire size: 27 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct RecordHeader {
    pub version: u8,
    pub block_number: U64<BigEndian>,
    pub closed_secs: U64<BigEndian>,
    pub closed_nanos: U32<BigEndian>,
    pub proof_sent: u8,
    pub acknowledged: u8,
    /// Length of the encoded item list that follows.
    pub payload_len: U32<BigEndian>,
}

assert_eq_size!(RecordHeader, [u8; 27]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedBlock {
    pub block_number: u64,
    pub closed_at: SystemTime,
    pub proof_sent: bool,
    pub acknowledged: bool,
    pub items: Vec<BlockItem>,
}

impl PersistedBlock {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = BytesMut::new();
        encode_items(&self.items, &mut payload);

        // Pre-epoch close times cannot come from a live clock; clamp to zero.
        let since_epoch = self
            .closed_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        let header = RecordHeader {
            version: RECORD_VERSION,
            block_number: U64::new(self.block_number),
            closed_secs: U64::new(since_epoch.as_secs()),
            closed_nanos: U32::new(since_epoch.subsec_nanos()),
            proof_sent: u8::from(self.proof_sent),
            acknowledged: u8::from(self.acknowledged),
            payload_len: U32::new(payload.len() as u32),
        };

        let record_len = RECORD_HEADER_LEN + payload.len();
        let mut out = BytesMut::with_capacity(4 + record_len);
        out.put_u32(record_len as u32);
        out.put_slice(header.as_bytes());
        out.put_slice(&payload);
        out.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < 4 {
            return Err(RecordError::Truncated);
        }
        let record_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let record = bytes.get(4..4 + record_len).ok_or(RecordError::Truncated)?;

        let header = RecordHeader::read_from_prefix(record).ok_or(RecordError::Truncated)?;
        if header.version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(header.version));
        }

        let payload_len = header.payload_len.get() as usize;
        if RECORD_HEADER_LEN + payload_len != record_len {
            return Err(RecordError::LengthMismatch {
                declared: record_len,
                actual: RECORD_HEADER_LEN + payload_len,
            });
        }

        let mut payload = &record[RECORD_HEADER_LEN..];
        let items = decode_items(&mut payload)?;

        let (secs, nanos) = (header.closed_secs.get(), header.closed_nanos.get());
        if nanos >= NANOS_PER_SEC {
            return Err(RecordError::InvalidTimestamp { secs, nanos });
        }
        let closed_at = UNIX_EPOCH
            .checked_add(Duration::new(secs, nanos))
            .ok_or(RecordError::InvalidTimestamp { secs, nanos })?;

        Ok(Self {
            block_number: header.block_number.get(),
            closed_at,
            proof_sent: header.proof_sent != 0,
            acknowledged: header.acknowledged != 0,
            items,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record truncated")]
    Truncated,

    #[error("unsupported record version: {0}")]
    UnsupportedVersion(u8),

    #[error("record length {declared} does not match header ({actual})")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("close time out of range: {secs}s {nanos}ns")]
    InvalidTimestamp { secs: u64, nanos: u32 },

    #[error("bad item list: {0}")]
    Items(#[from] WireError),
}
