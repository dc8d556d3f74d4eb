//! Configuration system for blockstream.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BLOCKSTREAM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/blockstream/config.toml
//!   3. ~/.config/blockstream/config.toml
//!
//! The block node roster lives in a separate JSON file (`block-nodes.json`)
//! so operators can swap destinations without touching tuning knobs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::DEFAULT_MAX_REQUEST_BYTES;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockStreamConfig {
    pub stream: StreamSettings,
    pub buffer: BufferSettings,
    pub connections: ConnectionSettings,
    pub producer: ProducerSettings,
}

/// Where finished blocks are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterMode {
    /// Local block files only. Streaming is off.
    File,
    /// Stream to block nodes only.
    Grpc,
    FileAndGrpc,
}

/// What the node emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Blocks are the only output; the buffer may apply backpressure.
    Blocks,
    /// Blocks alongside legacy record streams. Never blocks production.
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub writer_mode: WriterMode,
    pub stream_mode: StreamMode,
    /// Expected time between blocks.
    pub block_period_ms: u64,
    /// Max items per request. 0 = unlimited.
    pub block_item_batch_size: usize,
    /// Soft byte limit per request.
    pub max_request_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// How long a closed block is expected to wait for an acknowledgement.
    pub block_ttl_secs: u64,
    /// 0 = saturation checks disabled.
    pub prune_interval_ms: u64,
    /// Saturation percent at which a node switch is attempted.
    pub action_stage_threshold: f64,
    /// Minimum time between two node switches triggered by saturation.
    pub action_grace_period_ms: u64,
    /// Saturation percent at or below which backpressure is released.
    pub recovery_threshold: f64,
    pub persistence_enabled: bool,
    pub persistence_dir: PathBuf,
    /// 0 = persist only on explicit request and at shutdown.
    pub persist_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Path to block-nodes.json.
    pub roster_path: PathBuf,
    pub max_end_of_streams_allowed: usize,
    pub end_of_stream_window_secs: u64,
    /// Delay before retrying a node that exceeded the end-of-stream limit.
    pub end_of_stream_schedule_delay_secs: u64,
    /// Delete persisted block files once acknowledged.
    pub delete_files_on_ack: bool,
}

/// Synthetic block producer used by the daemon for soak runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    pub enabled: bool,
    pub first_block: u64,
    pub items_per_block: usize,
    pub item_bytes: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BlockStreamConfig {
    fn default() -> Self {
        Self {
            stream: StreamSettings::default(),
            buffer: BufferSettings::default(),
            connections: ConnectionSettings::default(),
            producer: ProducerSettings::default(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            writer_mode: WriterMode::FileAndGrpc,
            stream_mode: StreamMode::Blocks,
            block_period_ms: 2_000,
            block_item_batch_size: 256,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            block_ttl_secs: 300,
            prune_interval_ms: 1_000,
            action_stage_threshold: 50.0,
            action_grace_period_ms: 20_000,
            recovery_threshold: 70.0,
            persistence_enabled: true,
            persistence_dir: data_dir().join("buffer"),
            persist_interval_secs: 0,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            roster_path: config_dir().join("block-nodes.json"),
            max_end_of_streams_allowed: 5,
            end_of_stream_window_secs: 30,
            end_of_stream_schedule_delay_secs: 30,
            delete_files_on_ack: false,
        }
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            first_block: 0,
            items_per_block: 16,
            item_bytes: 512,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl StreamSettings {
    pub fn block_period(&self) -> Duration {
        Duration::from_millis(self.block_period_ms)
    }

    /// Streaming to block nodes is on unless only files are written.
    pub fn streaming_enabled(&self) -> bool {
        self.writer_mode != WriterMode::File
    }
}

impl BufferSettings {
    pub fn block_ttl(&self) -> Duration {
        Duration::from_secs(self.block_ttl_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn action_grace_period(&self) -> Duration {
        Duration::from_millis(self.action_grace_period_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }
}

impl ConnectionSettings {
    pub fn end_of_stream_window(&self) -> Duration {
        Duration::from_secs(self.end_of_stream_window_secs)
    }

    pub fn end_of_stream_schedule_delay(&self) -> Duration {
        Duration::from_secs(self.end_of_stream_schedule_delay_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("blockstream")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("blockstream")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Block node roster ─────────────────────────────────────────────────────────

/// One candidate destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockNodeConfig {
    pub address: String,
    pub port: u16,
    /// Lower is preferred.
    #[serde(default)]
    pub priority: u32,
}

impl BlockNodeConfig {
    pub fn new(address: impl Into<String>, port: u16, priority: u32) -> Self {
        Self {
            address: address.into(),
            port,
            priority,
        }
    }
}

impl std::fmt::Display for BlockNodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockNodeRoster {
    pub nodes: Vec<BlockNodeConfig>,
}

impl BlockNodeRoster {
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RosterError::ReadFailed(path.to_path_buf(), e))?;
        let roster: BlockNodeRoster = serde_json::from_str(&text)
            .map_err(|e| RosterError::ParseFailed(path.to_path_buf(), e))?;
        if roster.nodes.is_empty() {
            return Err(RosterError::Empty(path.to_path_buf()));
        }
        Ok(roster)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("failed to read roster {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse roster {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),
    #[error("roster {0} lists no block nodes")]
    Empty(PathBuf),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BlockStreamConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BlockStreamConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BLOCKSTREAM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BlockStreamConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply BLOCKSTREAM_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BLOCKSTREAM_STREAM__WRITER_MODE") {
            match v.as_str() {
                "file" => self.stream.writer_mode = WriterMode::File,
                "grpc" => self.stream.writer_mode = WriterMode::Grpc,
                "file_and_grpc" => self.stream.writer_mode = WriterMode::FileAndGrpc,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_STREAM__STREAM_MODE") {
            match v.as_str() {
                "blocks" => self.stream.stream_mode = StreamMode::Blocks,
                "both" => self.stream.stream_mode = StreamMode::Both,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_STREAM__BLOCK_PERIOD_MS") {
            if let Ok(ms) = v.parse() {
                self.stream.block_period_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_STREAM__BLOCK_ITEM_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.stream.block_item_batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_BUFFER__BLOCK_TTL_SECS") {
            if let Ok(s) = v.parse() {
                self.buffer.block_ttl_secs = s;
            }
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_BUFFER__PERSISTENCE_ENABLED") {
            self.buffer.persistence_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_BUFFER__PERSISTENCE_DIR") {
            self.buffer.persistence_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_CONNECTIONS__ROSTER_PATH") {
            self.connections.roster_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BLOCKSTREAM_PRODUCER__ENABLED") {
            self.producer.enabled = v == "true" || v == "1";
        }
    }
}
