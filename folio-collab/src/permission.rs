//! Permission gate: which roles may perform which actions on a room.
//!
//! The gate is consulted by the registry for every mutating request, so a
//! client that hides its edit controls is not the only line of defense.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RoomError;
use crate::room::{UserId, UserRole};

/// Operations subject to permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Read,
    EditTitle,
    EditContent,
    Share,
    RemoveCollaborator,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Read => "read the room",
            Action::EditTitle => "edit the title",
            Action::EditContent => "edit the content",
            Action::Share => "share the room",
            Action::RemoveCollaborator => "remove collaborators",
            Action::Delete => "delete the room",
        };
        f.write_str(s)
    }
}

/// The caller's user type as seen by the view layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Editor,
    Viewer,
}

impl UserType {
    pub fn is_editor(self) -> bool {
        self == UserType::Editor
    }
}

impl From<UserRole> for UserType {
    fn from(role: UserRole) -> Self {
        if role.is_editor() {
            UserType::Editor
        } else {
            UserType::Viewer
        }
    }
}

/// Evaluates a role against an action.
pub trait PermissionGate: Send + Sync {
    fn allows(&self, role: UserRole, action: Action) -> bool;

    /// Resolve and check in one step. `role` is `None` for non-members.
    fn check(&self, user: &UserId, role: Option<UserRole>, action: Action) -> Result<UserRole, RoomError> {
        let role = role.ok_or_else(|| RoomError::NotCollaborator(user.clone()))?;
        if self.allows(role, action) {
            Ok(role)
        } else {
            Err(RoomError::PermissionDenied {
                user: user.clone(),
                action,
            })
        }
    }
}

/// Default policy: creators may do everything, editors everything but
/// delete, viewers only read.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePolicy;

impl PermissionGate for RolePolicy {
    fn allows(&self, role: UserRole, action: Action) -> bool {
        match role {
            UserRole::Creator => true,
            UserRole::Editor => action != Action::Delete,
            UserRole::Viewer => action == Action::Read,
        }
    }
}
