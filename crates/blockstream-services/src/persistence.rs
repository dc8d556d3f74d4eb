//! Disk persistence for buffered blocks.
//!
//! Each write goes into a fresh directory named by its creation time:
//!   {root}/{millis}/block-{n}.bin
//!
//! Only the newest directory is ever read. Older ones are deleted once a
//! write completes, so a crash mid-write leaves the previous snapshot intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use blockstream_core::record::{PersistedBlock, RecordError};
use memmap2::Mmap;

#[derive(Clone, Debug)]
pub struct BlockBufferStore {
    root: PathBuf,
}

impl BlockBufferStore {
    /// For production: $XDG_DATA_HOME/blockstream/buffer
    /// For testing: /tmp/blockstream-buffer-{pid}
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `blocks` as a new snapshot and drop every older one.
    pub fn write(&self, blocks: &[PersistedBlock]) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create buffer root: {}", self.root.display()))?;

        let mut stamp = now_millis();
        let mut dir = self.root.join(stamp.to_string());
        while dir.exists() {
            stamp += 1;
            dir = self.root.join(stamp.to_string());
        }
        fs::create_dir(&dir)
            .with_context(|| format!("failed to create snapshot dir: {}", dir.display()))?;

        for block in blocks {
            let path = dir.join(file_name(block.block_number));
            let tmp_path = path.with_extension("tmp");
            {
                let mut file = fs::File::create(&tmp_path)
                    .with_context(|| format!("failed to create {}", tmp_path.display()))?;
                file.write_all(&block.encode())
                    .context("failed to write block record")?;
                file.sync_all().context("failed to sync block record")?;
            }
            fs::rename(&tmp_path, &path)
                .with_context(|| format!("failed to rename {}", tmp_path.display()))?;
        }

        for (_, old) in self.snapshot_dirs()? {
            if old != dir {
                if let Err(e) = fs::remove_dir_all(&old) {
                    tracing::warn!(dir = %old.display(), error = %e, "failed to remove old snapshot");
                }
            }
        }

        tracing::debug!(dir = %dir.display(), blocks = blocks.len(), "buffer persisted");
        Ok(dir)
    }

    /// Read the newest snapshot. Unreadable or unsupported files are skipped.
    pub fn read(&self) -> Result<Vec<PersistedBlock>> {
        let Some((_, dir)) = self.snapshot_dirs()?.into_iter().max_by_key(|(stamp, _)| *stamp)
        else {
            return Ok(Vec::new());
        };

        let mut blocks = Vec::new();
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to list snapshot: {}", dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if parse_file_name(&path).is_none() {
                continue;
            }
            match read_record(&path) {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping persisted block");
                }
            }
        }

        blocks.sort_by_key(|b| b.block_number);
        tracing::info!(dir = %dir.display(), blocks = blocks.len(), "buffer snapshot read");
        Ok(blocks)
    }

    /// Remove persisted files for blocks `<= block` from every snapshot.
    pub fn delete_blocks_up_to(&self, block: u64) -> Result<usize> {
        let mut removed = 0;
        for (_, dir) in self.snapshot_dirs()? {
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("failed to list snapshot: {}", dir.display()))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if matches!(parse_file_name(&path), Some(n) if n <= block) {
                    fs::remove_file(&path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn snapshot_dirs(&self) -> Result<Vec<(u128, PathBuf)>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list buffer root: {}", self.root.display()))?;
        Ok(entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let stamp = e.file_name().to_str()?.parse::<u128>().ok()?;
                Some((stamp, e.path()))
            })
            .collect())
    }
}

fn read_record(path: &Path) -> Result<PersistedBlock> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let len = file.metadata().context("failed to stat block file")?.len();
    if len == 0 {
        return Err(RecordError::Truncated.into());
    }

    // Safety: file is opened read-only and we don't mutate the mmap
    let mmap = unsafe { Mmap::map(&file).with_context(|| format!("failed to mmap {}", path.display()))? };

    Ok(PersistedBlock::decode(&mmap)?)
}

fn file_name(block: u64) -> String {
    format!("block-{block}.bin")
}

fn parse_file_name(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("block-")?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
