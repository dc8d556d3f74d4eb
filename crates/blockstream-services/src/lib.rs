//! blockstream-services: the buffer, connection and acknowledgement machinery
//! that moves produced blocks to block nodes.

pub mod ack_tracker;
pub mod backoff;
pub mod block_unit;
pub mod buffer;
pub mod connection;
pub mod manager;
pub mod metrics;
pub mod node_stats;
pub mod persistence;
pub mod transport;

pub use ack_tracker::{AckTracker, CleanupHandler};
pub use block_unit::BlockUnit;
pub use buffer::{BlockBufferService, BufferError, PruneResult, StreamController};
pub use connection::{BlockNodeConnection, ConnectionEvents, ConnectionState};
pub use manager::{BlockNodeConnectionManager, ManagerError};
pub use metrics::{NoopMetrics, StatsSnapshot, StreamMetrics, StreamStats};
pub use persistence::BlockBufferStore;
pub use transport::{BlockNodeConnector, BlockNodeStream, StreamEvent};
