//! The seam between connections and whatever carries frames to a block node.
//!
//! A connector opens one bidirectional stream per connection. Requests go
//! out on `requests`; responses and transport failures come back on
//! `events`. The stream is over when `events` yields `None`.

use std::sync::Arc;

use blockstream_core::config::BlockNodeConfig;
use blockstream_core::wire::{PublishRequest, PublishResponse};
use futures::future::BoxFuture;
use tokio::sync::mpsc;

/// Bound on in-flight requests per stream.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum StreamEvent {
    Response(PublishResponse),
    /// The transport failed. The stream is unusable afterwards.
    Error(String),
}

pub struct BlockNodeStream {
    pub requests: mpsc::Sender<Arc<PublishRequest>>,
    pub events: mpsc::Receiver<StreamEvent>,
}

pub trait BlockNodeConnector: Send + Sync {
    fn connect(&self, node: &BlockNodeConfig) -> BoxFuture<'static, anyhow::Result<BlockNodeStream>>;
}
