//! Room data model: identifiers, roles, metadata and the persisted room
//! record.
//!
//! A room is the unit of collaboration. Its metadata carries the title and
//! the creator; the creator is fixed at creation and is always present in the
//! collaborator list with the `Creator` role.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::RoomError;

/// Maximum title length in characters.
pub const MAX_TITLE_LEN: usize = 256;

/// Namespace for deriving fixed-width storage keys from room ids.
const ROOM_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6a0f_3c1e_9b7d_4f25_a8e2_51c0_d4b7_93e6);

/// Stable, unique identifier of a room (one per document).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 16-byte key used by the document store.
    ///
    /// Deterministic: the same room id always maps to the same key.
    pub fn storage_key(&self) -> Uuid {
        Uuid::new_v5(&ROOM_KEY_NAMESPACE, self.0.as_bytes())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier issued by the external authentication service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Role of a collaborator within one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Creator,
    Editor,
    Viewer,
}

impl UserRole {
    /// Creators edit with the same rights as editors.
    pub fn is_editor(self) -> bool {
        matches!(self, UserRole::Creator | UserRole::Editor)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Creator => f.write_str("creator"),
            UserRole::Editor => f.write_str("editor"),
            UserRole::Viewer => f.write_str("viewer"),
        }
    }
}

/// A user's membership in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorRef {
    pub id: UserId,
    pub role: UserRole,
}

impl CollaboratorRef {
    pub fn new(id: impl Into<UserId>, role: UserRole) -> Self {
        Self { id: id.into(), role }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub title: String,
    pub creator_id: UserId,
}

/// Result of a successful persistence call, as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub room_id: RoomId,
    pub metadata: RoomMetadata,
    pub collaborators: Vec<CollaboratorRef>,
    /// Incremented on every accepted title change
    pub title_version: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

/// Authoritative room record held by the registry and persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    id: RoomId,
    metadata: RoomMetadata,
    collaborators: Vec<CollaboratorRef>,
    title_version: u64,
    created_at: u64,
    updated_at: u64,
}

/// Check a title against length rules.
pub fn validate_title(title: &str) -> Result<(), RoomError> {
    if title.is_empty() {
        return Err(RoomError::InvalidTitle("title must not be empty".into()));
    }
    let len = title.chars().count();
    if len > MAX_TITLE_LEN {
        return Err(RoomError::InvalidTitle(format!(
            "title is {len} characters, maximum is {MAX_TITLE_LEN}"
        )));
    }
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Room {
    /// Create a room whose only collaborator is its creator.
    pub fn new(
        id: impl Into<RoomId>,
        creator: impl Into<UserId>,
        title: impl Into<String>,
    ) -> Result<Self, RoomError> {
        let title = title.into();
        validate_title(&title)?;
        let creator = creator.into();
        let now = now_secs();
        Ok(Self {
            id: id.into(),
            metadata: RoomMetadata {
                title,
                creator_id: creator.clone(),
            },
            collaborators: vec![CollaboratorRef::new(creator, UserRole::Creator)],
            title_version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn metadata(&self) -> &RoomMetadata {
        &self.metadata
    }

    pub fn title(&self) -> &str {
        &self.metadata.title
    }

    pub fn creator_id(&self) -> &UserId {
        &self.metadata.creator_id
    }

    pub fn collaborators(&self) -> &[CollaboratorRef] {
        &self.collaborators
    }

    pub fn title_version(&self) -> u64 {
        self.title_version
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    /// Role of `user` in this room, `None` if not a collaborator.
    pub fn role_of(&self, user: &UserId) -> Option<UserRole> {
        self.collaborators
            .iter()
            .find(|c| &c.id == user)
            .map(|c| c.role)
    }

    /// Replace the title. Returns `false` when the title is unchanged.
    pub fn set_title(&mut self, title: &str) -> Result<bool, RoomError> {
        validate_title(title)?;
        if self.metadata.title == title {
            return Ok(false);
        }
        self.metadata.title = title.to_string();
        self.title_version += 1;
        self.updated_at = now_secs();
        Ok(true)
    }

    /// Add a collaborator or change an existing collaborator's role.
    pub fn upsert_collaborator(&mut self, user: UserId, role: UserRole) -> Result<(), RoomError> {
        if role == UserRole::Creator || &user == self.creator_id() {
            return Err(RoomError::CreatorImmutable);
        }
        match self.collaborators.iter_mut().find(|c| c.id == user) {
            Some(existing) => existing.role = role,
            None => self.collaborators.push(CollaboratorRef::new(user, role)),
        }
        self.updated_at = now_secs();
        Ok(())
    }

    /// Remove a collaborator. Returns `false` if the user was not one.
    pub fn remove_collaborator(&mut self, user: &UserId) -> Result<bool, RoomError> {
        if user == self.creator_id() {
            return Err(RoomError::CreatorImmutable);
        }
        let before = self.collaborators.len();
        self.collaborators.retain(|c| &c.id != user);
        let removed = self.collaborators.len() != before;
        if removed {
            self.updated_at = now_secs();
        }
        Ok(removed)
    }

    /// Snapshot handed back to gateway callers.
    pub fn to_document(&self) -> Document {
        Document {
            room_id: self.id.clone(),
            metadata: self.metadata.clone(),
            collaborators: self.collaborators.clone(),
            title_version: self.title_version,
            updated_at: self.updated_at,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (room, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(room)
    }
}
