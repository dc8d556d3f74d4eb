//! blockstream-core: configuration, wire format, and the on-disk block record.
//! All other blockstream crates depend on this one.

pub mod config;
pub mod record;
pub mod wire;

pub use config::{BlockNodeConfig, BlockNodeRoster, BlockStreamConfig, StreamMode, WriterMode};
pub use record::PersistedBlock;
pub use wire::{BlockItem, ItemKind, PublishRequest, PublishResponse};
