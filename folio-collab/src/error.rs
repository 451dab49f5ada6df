//! Error taxonomy for room operations.
//!
//! Storage, protocol and gateway errors live next to the code that raises
//! them; `RoomError` is what the registry returns to the session layer and to
//! in-process callers.

use thiserror::Error;

use crate::document::DocumentError;
use crate::permission::Action;
use crate::room::{RoomId, UserId};
use crate::storage::StoreError;

#[derive(Debug, Clone, Error)]
pub enum RoomError {
    #[error("Room not found: {0}")]
    NotFound(RoomId),

    #[error("Room already exists: {0}")]
    AlreadyExists(RoomId),

    #[error("User {0} is not a collaborator of this room")]
    NotCollaborator(UserId),

    #[error("Permission denied: {user} may not {action}")]
    PermissionDenied { user: UserId, action: Action },

    #[error("Invalid title: {0}")]
    InvalidTitle(String),

    #[error("The room creator cannot be changed or removed")]
    CreatorImmutable,

    #[error("Rejected content update: {0}")]
    Document(#[from] DocumentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl RoomError {
    /// Whether the failure is a rejection by the permission gate.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. } | Self::NotCollaborator(_))
    }
}
