//! CRDT document engine backed by a Yrs `Doc`.
//!
//! Every room owns one `RoomDocument`. Concurrent edits from different peers
//! arrive as Yrs v1 updates and are merged by the CRDT; applying the same
//! set of updates in any order converges to the same content.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the shared text holding the document body.
pub const CONTENT_FIELD: &str = "content";

#[derive(Debug, Clone, Error)]
pub enum DocumentError {
    #[error("Malformed update: {0}")]
    InvalidUpdate(String),
    #[error("Malformed state vector: {0}")]
    InvalidStateVector(String),
    #[error("Failed to apply update: {0}")]
    ApplyFailed(String),
    #[error("Edit range {index}..{end} outside content of length {len}")]
    OutOfBounds { index: u32, end: u32, len: u32 },
}

/// State vector of an empty document: answering it yields the full state.
pub fn empty_state_vector() -> Vec<u8> {
    StateVector::default().encode_v1()
}

/// Authoritative (server) or local (client) replica of a room's content.
pub struct RoomDocument {
    doc: yrs::Doc,
    content: TextRef,
}

impl RoomDocument {
    pub fn new() -> Self {
        let doc = yrs::Doc::new();
        let content = doc.get_or_insert_text(CONTENT_FIELD);
        Self { doc, content }
    }

    /// Restore from a full-state update (snapshot).
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, DocumentError> {
        let document = Self::new();
        document.apply_update(snapshot)?;
        Ok(document)
    }

    /// Apply a remote v1 update.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::ApplyFailed(e.to_string()))?;
        Ok(())
    }

    /// Encoded state vector for the sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything the holder of `remote_sv` is missing.
    pub fn diff_since(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|e| DocumentError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert text locally, returning the update to broadcast.
    pub fn insert(&self, index: u32, chunk: &str) -> Result<Vec<u8>, DocumentError> {
        let before = self.state_vector_raw();
        {
            let mut txn = self.doc.transact_mut();
            let len = self.content.len(&txn);
            if index > len {
                return Err(DocumentError::OutOfBounds { index, end: index, len });
            }
            self.content.insert(&mut txn, index, chunk);
        }
        Ok(self.diff_from(&before))
    }

    /// Delete `count` characters starting at `index`, returning the update.
    pub fn delete(&self, index: u32, count: u32) -> Result<Vec<u8>, DocumentError> {
        let before = self.state_vector_raw();
        {
            let mut txn = self.doc.transact_mut();
            let len = self.content.len(&txn);
            let end = index.saturating_add(count);
            if end > len {
                return Err(DocumentError::OutOfBounds { index, end, len });
            }
            self.content.remove_range(&mut txn, index, count);
        }
        Ok(self.diff_from(&before))
    }

    fn state_vector_raw(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    fn diff_from(&self, sv: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_diff_v1(sv)
    }
}

impl Default for RoomDocument {
    fn default() -> Self {
        Self::new()
    }
}
