//! Persistent storage layer for rooms.
//!
//! ```text
//! ┌──────────────┐   room records   ┌──────────────┐
//! │ RoomRegistry │ ───────────────► │ DocumentStore│
//! │ (in-memory)  │   updates        │ (RocksDB)    │
//! └──────┬───────┘                  └──────┬───────┘
//!        │ on startup                      │ column families
//!        ▼                                 ▼
//! ┌──────────────┐     ┌──────────────────────────────────┐
//! │ RoomDocument │     │ CF "rooms"    : room records     │
//! │ (restored)   │     │ CF "documents": CRDT snapshots   │
//! └──────────────┘     │ CF "deltas"   : compressed edits │
//!                      └──────────────────────────────────┘
//! ```
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{DocumentStore, SnapshotInfo, StoreConfig, StoreError};
