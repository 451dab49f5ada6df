//! Operation log: the sequence of CRDT updates a room has accepted.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            OperationLog                   │
//! │                                          │
//! │  Base ◄── update ◄── update ◄── update   │
//! │  (merged)  (LZ4)     (LZ4)      (LZ4)    │
//! │                                          │
//! │  Compaction: merge N updates → new base  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Versions increase by one per accepted update. A peer that reconnects with
//! a known version receives only the updates after it; a peer older than the
//! base receives the merged state instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Compaction threshold used by rooms unless configured otherwise.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 100;

/// A compressed update entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedUpdate {
    pub version: u64,
    pub original_size: u32,
    pub compressed: Vec<u8>,
}

impl CompressedUpdate {
    pub fn compress(version: u64, data: &[u8]) -> Self {
        Self {
            version,
            original_size: data.len() as u32,
            compressed: lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(&self) -> Result<Vec<u8>, OpLogError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| OpLogError::DecompressionFailed(e.to_string()))
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.len()
    }
}

#[derive(Debug, Clone, Error)]
pub enum OpLogError {
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    #[error("Failed to merge updates: {0}")]
    MergeFailed(String),
    #[error("Operation log is empty")]
    EmptyLog,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpLogStats {
    pub pending_updates: u64,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    pub base_version: u64,
    pub head_version: u64,
}

/// What a peer at some version needs to catch up.
#[derive(Debug, Clone, PartialEq)]
pub enum CatchUp {
    /// Apply these updates in order.
    Updates(Vec<(u64, Vec<u8>)>),
    /// The peer predates the base; apply the full merged state.
    Snapshot(Vec<u8>),
}

pub struct OperationLog {
    base: Option<Vec<u8>>,
    base_version: u64,
    entries: Vec<CompressedUpdate>,
    version: u64,
    compaction_threshold: usize,
}

impl OperationLog {
    pub fn new(compaction_threshold: usize) -> Self {
        Self {
            base: None,
            base_version: 0,
            entries: Vec::new(),
            version: 0,
            compaction_threshold: compaction_threshold.max(1),
        }
    }

    /// Start from a persisted base at `base_version`.
    pub fn from_base(base: Vec<u8>, base_version: u64, compaction_threshold: usize) -> Self {
        let mut log = Self::new(compaction_threshold);
        log.base = Some(base);
        log.base_version = base_version;
        log.version = base_version;
        log
    }

    /// Record an accepted update. Returns its version.
    pub fn append(&mut self, update: &[u8]) -> u64 {
        self.version += 1;
        self.entries
            .push(CompressedUpdate::compress(self.version, update));
        self.version
    }

    /// Replay a persisted update at a known version.
    ///
    /// Versions at or below the current head are ignored.
    pub fn restore(&mut self, version: u64, update: &[u8]) {
        if version <= self.version {
            return;
        }
        self.version = version;
        self.entries.push(CompressedUpdate::compress(version, update));
    }

    pub fn needs_compaction(&self) -> bool {
        self.entries.len() >= self.compaction_threshold
    }

    /// Merge the base and all pending updates into a new base.
    pub fn compact(&mut self) -> Result<OpLogStats, OpLogError> {
        if self.entries.is_empty() {
            return Err(OpLogError::EmptyLog);
        }
        let before = self.stats();
        let merged = self.merged()?;
        self.base = Some(merged);
        self.base_version = self.version;
        self.entries.clear();
        Ok(before)
    }

    /// Updates after `version`, or the merged state if `version` predates
    /// the base.
    pub fn since(&self, version: u64) -> Result<CatchUp, OpLogError> {
        if version < self.base_version && self.base.is_some() {
            return Ok(CatchUp::Snapshot(self.merged()?));
        }
        let updates = self
            .entries
            .iter()
            .filter(|e| e.version > version)
            .map(|e| Ok((e.version, e.decompress()?)))
            .collect::<Result<Vec<_>, OpLogError>>()?;
        Ok(CatchUp::Updates(updates))
    }

    /// The base with every pending update merged in.
    pub fn merged(&self) -> Result<Vec<u8>, OpLogError> {
        let mut owned = Vec::with_capacity(self.entries.len() + 1);
        if let Some(base) = &self.base {
            owned.push(base.clone());
        }
        for entry in &self.entries {
            owned.push(entry.decompress()?);
        }
        match owned.len() {
            0 => Err(OpLogError::EmptyLog),
            1 => Ok(owned.remove(0)),
            _ => {
                let slices: Vec<&[u8]> = owned.iter().map(|u| u.as_slice()).collect();
                yrs::merge_updates_v1(&slices).map_err(|e| OpLogError::MergeFailed(e.to_string()))
            }
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> OpLogStats {
        OpLogStats {
            pending_updates: self.entries.len() as u64,
            total_original_bytes: self.entries.iter().map(|e| e.original_size as u64).sum(),
            total_compressed_bytes: self.entries.iter().map(|e| e.compressed.len() as u64).sum(),
            base_version: self.base_version,
            head_version: self.version,
        }
    }
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new(DEFAULT_COMPACTION_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RoomDocument;

    #[test]
    fn test_compressed_update_decompress() {
        let data = b"a CRDT update with some structured content, content, content";
        let entry = CompressedUpdate::compress(3, data);
        assert_eq!(entry.version, 3);
        assert_eq!(entry.original_size, data.len() as u32);
        assert_eq!(entry.decompress().unwrap(), data.to_vec());
    }

    #[test]
    fn test_append_assigns_versions() {
        let mut log = OperationLog::new(10);
        assert_eq!(log.append(b"one"), 1);
        assert_eq!(log.append(b"two"), 2);
        assert_eq!(log.version(), 2);
        assert_eq!(log.pending(), 2);
    }

    #[test]
    fn test_since_returns_tail() {
        let mut log = OperationLog::new(10);
        for i in 0..5u8 {
            log.append(&[i; 4]);
        }
        match log.since(3).unwrap() {
            CatchUp::Updates(updates) => {
                assert_eq!(updates.len(), 2);
                assert_eq!(updates[0].0, 4);
                assert_eq!(updates[1].1, vec![4u8; 4]);
            }
            other => panic!("expected updates, got {other:?}"),
        }
    }

    #[test]
    fn test_compaction_merges_real_updates() {
        let doc = RoomDocument::new();
        let mut log = OperationLog::new(3);

        log.append(&doc.insert(0, "Hello").unwrap());
        log.append(&doc.insert(5, " there").unwrap());
        assert!(!log.needs_compaction());
        log.append(&doc.insert(11, "!").unwrap());
        assert!(log.needs_compaction());

        let stats = log.compact().unwrap();
        assert_eq!(stats.pending_updates, 3);
        assert_eq!(log.pending(), 0);
        assert_eq!(log.base_version(), 3);

        let replica = RoomDocument::from_snapshot(&log.merged().unwrap()).unwrap();
        assert_eq!(replica.content(), "Hello there!");
    }

    #[test]
    fn test_since_before_base_returns_snapshot() {
        let doc = RoomDocument::new();
        let mut log = OperationLog::new(2);
        log.append(&doc.insert(0, "ab").unwrap());
        log.append(&doc.insert(2, "cd").unwrap());
        log.compact().unwrap();
        log.append(&doc.insert(4, "ef").unwrap());

        match log.since(1).unwrap() {
            CatchUp::Snapshot(state) => {
                let replica = RoomDocument::from_snapshot(&state).unwrap();
                assert_eq!(replica.content(), "abcdef");
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        match log.since(2).unwrap() {
            CatchUp::Updates(updates) => assert_eq!(updates.len(), 1),
            other => panic!("expected updates, got {other:?}"),
        }
    }

    #[test]
    fn test_compact_empty_log() {
        let mut log = OperationLog::default();
        assert!(matches!(log.compact(), Err(OpLogError::EmptyLog)));
        assert!(log.merged().is_err());
    }

    #[test]
    fn test_restore_ignores_old_versions() {
        let mut log = OperationLog::from_base(vec![1, 2, 3], 10, 50);
        log.restore(9, b"old");
        log.restore(11, b"new");
        assert_eq!(log.version(), 11);
        assert_eq!(log.pending(), 1);
    }
}
