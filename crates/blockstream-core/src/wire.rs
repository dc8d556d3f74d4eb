//! blockstream wire format: the frames exchanged with a block node.
//!
//! Every frame is a fixed 8-byte `FrameHeader` followed by `length` bytes of
//! body. Multi-byte integers are big-endian throughout. The header is a
//! zerocopy type so it can be read straight out of a socket buffer; bodies
//! are small and variable, so they are written with `bytes::BufMut`.
//!
//! Outbound (node → block node):
//!   BlockItems  - one request: a slice of a block's items
//!   EndStream   - we are closing our side of the stream
//!
//! Inbound (block node → node):
//!   Acknowledgement, SkipBlock, ResendBlock, EndOfStream

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Precedes every frame on the stream.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Wire format version. Currently 0x01.
    pub version: u8,
    /// One of `FrameKind`.
    pub kind: u8,
    /// Must be zero.
    pub reserved: [u8; 2],
    /// Body length in bytes, not including this header.
    pub length: U32<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 8]);

impl FrameHeader {
    pub fn new(kind: FrameKind, length: usize) -> Self {
        Self {
            version: WIRE_VERSION,
            kind: kind.into(),
            reserved: [0; 2],
            length: U32::new(length as u32),
        }
    }

    /// Parse and validate a header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<(Self, FrameKind), WireError> {
        let header = Self::read_from_prefix(bytes).ok_or(WireError::Truncated)?;
        if header.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.reserved != [0; 2] {
            return Err(WireError::ReservedBytesSet);
        }
        let length = header.length.get() as usize;
        if length > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge(length));
        }
        let kind = FrameKind::try_from(header.kind)?;
        Ok((header, kind))
    }

    pub fn body_len(&self) -> usize {
        self.length.get() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    BlockItems = 0x01,
    EndStream = 0x02,
    Acknowledgement = 0x10,
    SkipBlock = 0x11,
    ResendBlock = 0x12,
    EndOfStream = 0x13,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::BlockItems),
            0x02 => Ok(FrameKind::EndStream),
            0x10 => Ok(FrameKind::Acknowledgement),
            0x11 => Ok(FrameKind::SkipBlock),
            0x12 => Ok(FrameKind::ResendBlock),
            0x13 => Ok(FrameKind::EndOfStream),
            other => Err(WireError::UnknownFrameKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Block Items ───────────────────────────────────────────────────────────────

/// What an item carries. The pipeline only cares about `BlockProof`, which
/// terminates a block; everything else is opaque payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemKind {
    BlockHeader = 0x01,
    EventHeader = 0x02,
    Transaction = 0x03,
    StateChanges = 0x04,
    BlockProof = 0x05,
}

impl TryFrom<u8> for ItemKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ItemKind::BlockHeader),
            0x02 => Ok(ItemKind::EventHeader),
            0x03 => Ok(ItemKind::Transaction),
            0x04 => Ok(ItemKind::StateChanges),
            0x05 => Ok(ItemKind::BlockProof),
            other => Err(WireError::UnknownItemKind(other)),
        }
    }
}

impl From<ItemKind> for u8 {
    fn from(k: ItemKind) -> u8 {
        k as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockItem {
    pub kind: ItemKind,
    pub payload: Bytes,
}

impl BlockItem {
    pub fn new(kind: ItemKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn is_proof(&self) -> bool {
        self.kind == ItemKind::BlockProof
    }

    /// Bytes this item occupies inside a request body.
    pub fn encoded_len(&self) -> usize {
        ITEM_HEADER_LEN + self.payload.len()
    }
}

/// `[count u32][kind u8][len u32][payload]...`
pub fn encode_items(items: &[BlockItem], buf: &mut BytesMut) {
    buf.put_u32(items.len() as u32);
    for item in items {
        buf.put_u8(item.kind.into());
        buf.put_u32(item.payload.len() as u32);
        buf.put_slice(&item.payload);
    }
}

pub fn decode_items(buf: &mut &[u8]) -> Result<Vec<BlockItem>, WireError> {
    let count = take_u32(buf)? as usize;
    // Every item costs at least its header; don't trust `count` for allocation.
    let mut items = Vec::with_capacity(count.min(buf.len() / ITEM_HEADER_LEN));
    for _ in 0..count {
        let kind = ItemKind::try_from(take_u8(buf)?)?;
        let len = take_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(WireError::Truncated);
        }
        let payload = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);
        items.push(BlockItem { kind, payload });
    }
    Ok(items)
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// Why we are closing our side of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndStreamCode {
    Reset = 0x01,
    Timeout = 0x02,
    Error = 0x03,
    TooFarBehind = 0x04,
}

impl TryFrom<u8> for EndStreamCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(EndStreamCode::Reset),
            0x02 => Ok(EndStreamCode::Timeout),
            0x03 => Ok(EndStreamCode::Error),
            0x04 => Ok(EndStreamCode::TooFarBehind),
            other => Err(WireError::UnknownEndStreamCode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishRequest {
    BlockItems {
        block_number: u64,
        items: Vec<BlockItem>,
    },
    EndStream {
        code: EndStreamCode,
        /// `NO_BLOCK` when nothing is buffered.
        earliest_block: u64,
        latest_block: u64,
    },
}

impl PublishRequest {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        let kind = match self {
            PublishRequest::BlockItems {
                block_number,
                items,
            } => {
                body.put_u64(*block_number);
                encode_items(items, &mut body);
                FrameKind::BlockItems
            }
            PublishRequest::EndStream {
                code,
                earliest_block,
                latest_block,
            } => {
                body.put_u8(*code as u8);
                body.put_u64(*earliest_block);
                body.put_u64(*latest_block);
                FrameKind::EndStream
            }
        };
        frame(kind, body)
    }

    pub fn decode(kind: FrameKind, mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        match kind {
            FrameKind::BlockItems => {
                let block_number = take_u64(buf)?;
                let items = decode_items(buf)?;
                Ok(PublishRequest::BlockItems {
                    block_number,
                    items,
                })
            }
            FrameKind::EndStream => Ok(PublishRequest::EndStream {
                code: EndStreamCode::try_from(take_u8(buf)?)?,
                earliest_block: take_u64(buf)?,
                latest_block: take_u64(buf)?,
            }),
            other => Err(WireError::UnexpectedFrame(other as u8)),
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Code carried by a block node's EndOfStream.
///
/// Unknown codes are preserved rather than rejected: the connection treats
/// them as terminal and fails over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfStreamCode {
    Success,
    InternalError,
    PersistenceFailed,
    Timeout,
    OutOfOrder,
    BadStateProof,
    Behind,
    Unknown(u8),
}

impl From<u8> for EndOfStreamCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => EndOfStreamCode::Success,
            0x02 => EndOfStreamCode::InternalError,
            0x03 => EndOfStreamCode::PersistenceFailed,
            0x04 => EndOfStreamCode::Timeout,
            0x05 => EndOfStreamCode::OutOfOrder,
            0x06 => EndOfStreamCode::BadStateProof,
            0x07 => EndOfStreamCode::Behind,
            other => EndOfStreamCode::Unknown(other),
        }
    }
}

impl From<EndOfStreamCode> for u8 {
    fn from(c: EndOfStreamCode) -> u8 {
        match c {
            EndOfStreamCode::Success => 0x01,
            EndOfStreamCode::InternalError => 0x02,
            EndOfStreamCode::PersistenceFailed => 0x03,
            EndOfStreamCode::Timeout => 0x04,
            EndOfStreamCode::OutOfOrder => 0x05,
            EndOfStreamCode::BadStateProof => 0x06,
            EndOfStreamCode::Behind => 0x07,
            EndOfStreamCode::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResponse {
    Acknowledgement {
        block_number: u64,
        block_already_exists: bool,
    },
    SkipBlock {
        block_number: u64,
    },
    ResendBlock {
        block_number: u64,
    },
    EndOfStream {
        code: EndOfStreamCode,
        /// Last block the node verified, or `NO_BLOCK`.
        block_number: u64,
    },
}

impl PublishResponse {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        let kind = match self {
            PublishResponse::Acknowledgement {
                block_number,
                block_already_exists,
            } => {
                body.put_u64(*block_number);
                body.put_u8(u8::from(*block_already_exists));
                FrameKind::Acknowledgement
            }
            PublishResponse::SkipBlock { block_number } => {
                body.put_u64(*block_number);
                FrameKind::SkipBlock
            }
            PublishResponse::ResendBlock { block_number } => {
                body.put_u64(*block_number);
                FrameKind::ResendBlock
            }
            PublishResponse::EndOfStream { code, block_number } => {
                body.put_u8((*code).into());
                body.put_u64(*block_number);
                FrameKind::EndOfStream
            }
        };
        frame(kind, body)
    }

    pub fn decode(kind: FrameKind, mut body: &[u8]) -> Result<Self, WireError> {
        let buf = &mut body;
        match kind {
            FrameKind::Acknowledgement => Ok(PublishResponse::Acknowledgement {
                block_number: take_u64(buf)?,
                block_already_exists: take_u8(buf)? != 0,
            }),
            FrameKind::SkipBlock => Ok(PublishResponse::SkipBlock {
                block_number: take_u64(buf)?,
            }),
            FrameKind::ResendBlock => Ok(PublishResponse::ResendBlock {
                block_number: take_u64(buf)?,
            }),
            FrameKind::EndOfStream => Ok(PublishResponse::EndOfStream {
                code: EndOfStreamCode::from(take_u8(buf)?),
                block_number: take_u64(buf)?,
            }),
            other => Err(WireError::UnexpectedFrame(other as u8)),
        }
    }
}

// ── Framing helpers ───────────────────────────────────────────────────────────

fn frame(kind: FrameKind, body: BytesMut) -> Bytes {
    let header = FrameHeader::new(kind, body.len());
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    out.put_slice(header.as_bytes());
    out.put_slice(&body);
    out.freeze()
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32())
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64())
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current frame format version.
pub const WIRE_VERSION: u8 = 0x01;

pub const FRAME_HEADER_LEN: usize = 8;

/// `[kind u8][len u32]` in front of every item payload.
pub const ITEM_HEADER_LEN: usize = 5;

/// Message cap agreed with block nodes.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Headroom left under the message cap for framing and the request envelope.
pub const REQUEST_HEADER_RESERVE: usize = 1024;

pub const DEFAULT_MAX_REQUEST_BYTES: usize = MAX_MESSAGE_BYTES - REQUEST_HEADER_RESERVE;

/// Largest body a reader accepts. The per-request limit is soft and may be
/// overshot by one item, so this is twice the message cap.
pub const MAX_FRAME_BYTES: usize = 2 * MAX_MESSAGE_BYTES;

/// Sentinel for "no block" in u64 wire fields.
pub const NO_BLOCK: u64 = u64::MAX;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved header bytes are non-zero")]
    ReservedBytesSet,

    #[error("frame body of {0} bytes exceeds maximum {}", MAX_FRAME_BYTES)]
    FrameTooLarge(usize),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownFrameKind(u8),

    #[error("frame kind 0x{0:02x} not valid in this direction")]
    UnexpectedFrame(u8),

    #[error("unknown item kind: 0x{0:02x}")]
    UnknownItemKind(u8),

    #[error("unknown end-stream code: 0x{0:02x}")]
    UnknownEndStreamCode(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
