//! TCP transport to block nodes.
//!
//! One TCP stream per connection. The write half drains the request channel
//! and encodes each request as a frame; the read half decodes response
//! frames and forwards them as `StreamEvent`s. The event channel closes
//! when the block node closes its side.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use blockstream_core::config::BlockNodeConfig;
use blockstream_core::wire::{FrameHeader, PublishRequest, PublishResponse, FRAME_HEADER_LEN};
use blockstream_services::transport::STREAM_CHANNEL_CAPACITY;
use blockstream_services::{BlockNodeConnector, BlockNodeStream, StreamEvent};

const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl BlockNodeConnector for TcpConnector {
    fn connect(&self, node: &BlockNodeConfig) -> BoxFuture<'static, Result<BlockNodeStream>> {
        let addr = node.to_string();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
                .await
                .with_context(|| format!("timed out connecting to {addr}"))?
                .with_context(|| format!("failed to connect to {addr}"))?;
            stream.set_nodelay(true).context("TCP_NODELAY")?;

            let keepalive = TcpKeepalive::new()
                .with_time(KEEPALIVE_TIME)
                .with_interval(KEEPALIVE_INTERVAL);
            SockRef::from(&stream)
                .set_tcp_keepalive(&keepalive)
                .context("SO_KEEPALIVE")?;

            let (read, write) = stream.into_split();
            let (request_tx, request_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
            let (event_tx, event_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

            tokio::spawn(write_loop(addr.clone(), write, request_rx));
            tokio::spawn(read_loop(addr.clone(), read, event_tx));
            tracing::debug!(node = %addr, "tcp stream open");

            Ok(BlockNodeStream {
                requests: request_tx,
                events: event_rx,
            })
        })
    }
}

async fn write_loop(addr: String, mut write: OwnedWriteHalf, mut requests: mpsc::Receiver<Arc<PublishRequest>>) {
    while let Some(request) = requests.recv().await {
        if let Err(e) = write.write_all(&request.encode()).await {
            tracing::warn!(node = %addr, error = %e, "write to block node failed");
            return;
        }
    }
    // Request sender dropped: the connection closed our side.
    let _ = write.shutdown().await;
}

async fn read_loop(addr: String, mut read: OwnedReadHalf, events: mpsc::Sender<StreamEvent>) {
    loop {
        match read_response(&mut read).await {
            Ok(Some(response)) => {
                if events.send(StreamEvent::Response(response)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!(node = %addr, "block node closed stream");
                return;
            }
            Err(e) => {
                let _ = events.send(StreamEvent::Error(format!("{e:#}"))).await;
                return;
            }
        }
    }
}

/// Read one response frame. `None` on a clean EOF between frames.
async fn read_response(read: &mut OwnedReadHalf) -> Result<Option<PublishResponse>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame header"),
    }

    let (frame, kind) = FrameHeader::parse(&header)?;
    let mut body = vec![0u8; frame.body_len()];
    read.read_exact(&mut body)
        .await
        .context("failed to read frame body")?;

    Ok(Some(PublishResponse::decode(kind, &body)?))
}
