//! # folio-collab: Collaborative document core for Folio
//!
//! Rooms with a title, a collaborator list and CRDT content, synchronized
//! over WebSocket and persisted in RocksDB.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐                         ┌──────────────┐
//! │ CollaborativeRoom│                         │  SyncServer  │
//! │  TitleEditor ────┼── PersistenceGateway ──►│  (sessions)  │
//! │  presence header │                         └──────┬───────┘
//! └────────┬─────────┘                                │
//!          │ SyncEvent                                ▼
//! ┌────────┴─────────┐      WebSocket          ┌──────────────┐
//! │   SyncClient     │ ◄─────────────────────► │ RoomRegistry │── PermissionGate
//! └──────────────────┘     Binary Proto        │  Yrs Doc     │
//!                                              │  OperationLog│
//!                                              │  Broadcast   │
//!                                              └──────┬───────┘
//!                                                     ▼
//!                                              ┌──────────────┐
//!                                              │DocumentStore │
//!                                              │  (RocksDB)   │
//!                                              └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`room`]: Room, collaborator and document types
//! - [`permission`]: Role/action permission gate
//! - [`document`]: Yrs document wrapper
//! - [`oplog`]: Compressed operation log with compaction
//! - [`storage`]: RocksDB document store
//! - [`registry`]: Authoritative rooms; every mutation is checked here
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Room-based fan-out with backpressure
//! - [`presence`]: Presence identities and awareness
//! - [`server`]: WebSocket session coordinator
//! - [`client`]: WebSocket client with offline queue
//! - [`gateway`]: Title persistence gateway and retry policy
//! - [`title`]: Title edit state machine and driver
//! - [`events`]: Pointer events with scoped listeners
//! - [`room_view`]: Room facade for the view layer

pub mod error;
pub mod room;
pub mod permission;
pub mod document;
pub mod oplog;
pub mod storage;
pub mod registry;
pub mod protocol;
pub mod broadcast;
pub mod presence;
pub mod server;
pub mod client;
pub mod gateway;
pub mod title;
pub mod events;
pub mod room_view;

// Re-exports for convenience
pub use error::RoomError;
pub use room::{CollaboratorRef, Document, Room, RoomId, RoomMetadata, UserId, UserRole, MAX_TITLE_LEN};
pub use permission::{Action, PermissionGate, RolePolicy, UserType};
pub use document::{DocumentError, RoomDocument};
pub use oplog::{OpLogError, OperationLog};
pub use storage::{DocumentStore, SnapshotInfo, StoreConfig, StoreError};
pub use registry::{RegistryConfig, RequestSeq, RoomHandle, RoomRegistry, TitleUpdate};
pub use protocol::{
    DeniedNotice, JoinRequest, MessageType, ProtocolError, RequestFailure, RoomRequest,
    RoomResponse, SyncMessage, Welcome,
};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use presence::{AwarenessMessage, CursorColor, PresenceIdentity, PresenceRoom};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use gateway::{
    GatewayError, LocalGateway, PersistenceGateway, RemoteGateway, RetryPolicy, RetryingGateway,
};
pub use title::{Affordance, TitleEditController, TitleEditor, TitleError, TitleState, TitleView};
pub use events::{ListenerGuard, PointerEvent, PointerEvents, PointerKind};
pub use room_view::{CollaborativeRoom, ShareView};
