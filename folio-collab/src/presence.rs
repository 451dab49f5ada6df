//! Presence: who is in a room, where their cursor is, what they selected.
//!
//! Presence is transient per-connection state. It is never persisted and is
//! not part of the document.
//!
//! ```text
//! Local caret move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()   (rate-limited)
//!       │
//!       ▼
//! AwarenessMessage::Cursor { index, timestamp }
//!       │   (WebSocket, relayed by the server)
//!       ▼
//! Remote PresenceRoom::handle_message()  (stale timestamps dropped)
//!       │
//!       ▼
//! PresenceHeader / cursor overlay
//! ```
//!
//! Reference: Kleppmann, Chapter 8, Broadcast Protocols

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::room::{UserId, UserRole};

/// Namespace for hashing user ids into colors.
const COLOR_NAMESPACE: Uuid = Uuid::from_u128(0x1d3b_77a0_5c2e_4e8b_9f41_0b6d_c2a9_e185);

/// Default minimum interval between outgoing cursor updates (30 per second).
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

/// Default time after which a silent peer is dropped from presence.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// RGBA color for cursor and avatar rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable color for a user: the same user id always yields the same
    /// color, on every connection and every device.
    pub fn for_user(user: &UserId) -> Self {
        let hash = Uuid::new_v5(&COLOR_NAMESPACE, user.as_str().as_bytes()).as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb` form for web clients.
    pub fn to_hex(&self) -> String {
        let c = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", c(self.r), c(self.g), c(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Identity the server assigns to a connection when it joins a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceIdentity {
    /// Unique per connection; one user may hold several
    pub connection_id: Uuid,
    pub user_id: UserId,
    pub name: String,
    pub color: CursorColor,
    pub role: UserRole,
}

impl PresenceIdentity {
    pub fn new(connection_id: Uuid, user_id: UserId, name: impl Into<String>, role: UserRole) -> Self {
        let color = CursorColor::for_user(&user_id);
        Self {
            connection_id,
            user_id,
            name: name.into(),
            color,
            role,
        }
    }

    pub fn can_edit(&self) -> bool {
        self.role.is_editor()
    }
}

/// Awareness messages carried in `Awareness` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    Join { identity: PresenceIdentity },
    Leave { connection_id: Uuid },
    /// Caret position as a character index into the content.
    Cursor {
        connection_id: Uuid,
        index: u32,
        /// Sender-side monotonic counter
        timestamp: u64,
    },
    Selection {
        connection_id: Uuid,
        anchor: u32,
        head: u32,
    },
}

impl AwarenessMessage {
    pub fn connection_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { identity } => identity.connection_id,
            AwarenessMessage::Leave { connection_id }
            | AwarenessMessage::Cursor { connection_id, .. }
            | AwarenessMessage::Selection { connection_id, .. } => *connection_id,
        }
    }

    /// Rewrite the sender so a client cannot speak for another connection.
    pub fn attributed_to(mut self, id: Uuid) -> Self {
        match &mut self {
            AwarenessMessage::Join { identity } => identity.connection_id = id,
            AwarenessMessage::Leave { connection_id }
            | AwarenessMessage::Cursor { connection_id, .. }
            | AwarenessMessage::Selection { connection_id, .. } => *connection_id = id,
        }
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(msg)
    }
}

/// A remote peer's presence as tracked locally.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub identity: PresenceIdentity,
    pub cursor: Option<u32>,
    /// `(anchor, head)`; anchor may be after head for backwards selections
    pub selection: Option<(u32, u32)>,
    last_update: Instant,
    last_timestamp: u64,
}

impl PeerPresence {
    pub fn new(identity: PresenceIdentity) -> Self {
        Self {
            identity,
            cursor: None,
            selection: None,
            last_update: Instant::now(),
            last_timestamp: 0,
        }
    }

    /// Apply a cursor move. Returns `false` for a stale timestamp.
    pub fn update_cursor(&mut self, index: u32, timestamp: u64) -> bool {
        if timestamp < self.last_timestamp {
            return false;
        }
        self.cursor = Some(index);
        self.last_timestamp = timestamp;
        self.last_update = Instant::now();
        true
    }

    pub fn update_selection(&mut self, anchor: u32, head: u32) {
        self.selection = Some((anchor, head));
        self.last_update = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }

    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }
}

/// Presence state of every peer in one room, seen from `local_id`.
///
/// The server tracks a room with `Uuid::nil()` as its local id.
pub struct PresenceRoom {
    local_id: Uuid,
    peers: HashMap<Uuid, PeerPresence>,
    last_cursor_broadcast: Option<Instant>,
    cursor_broadcast_interval: Duration,
    idle_timeout: Duration,
    local_cursor: Option<u32>,
    timestamp_counter: u64,
}

impl PresenceRoom {
    pub fn new(local_id: Uuid) -> Self {
        Self::with_timeouts(local_id, CURSOR_BROADCAST_INTERVAL, IDLE_TIMEOUT)
    }

    pub fn with_timeouts(local_id: Uuid, cursor_interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
            last_cursor_broadcast: None,
            cursor_broadcast_interval: cursor_interval,
            idle_timeout,
            local_cursor: None,
            timestamp_counter: 0,
        }
    }

    /// Apply a message from the network. Returns whether it changed state
    /// (and so should be relayed or rendered).
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.connection_id() == self.local_id {
            return false;
        }

        match msg {
            AwarenessMessage::Join { identity } => {
                self.peers
                    .insert(identity.connection_id, PeerPresence::new(identity.clone()));
                true
            }
            AwarenessMessage::Leave { connection_id } => self.peers.remove(connection_id).is_some(),
            AwarenessMessage::Cursor {
                connection_id,
                index,
                timestamp,
            } => match self.peers.get_mut(connection_id) {
                Some(peer) => peer.update_cursor(*index, *timestamp),
                None => {
                    log::trace!("Cursor from unknown peer {connection_id}");
                    false
                }
            },
            AwarenessMessage::Selection {
                connection_id,
                anchor,
                head,
            } => match self.peers.get_mut(connection_id) {
                Some(peer) => {
                    peer.update_selection(*anchor, *head);
                    true
                }
                None => false,
            },
        }
    }

    /// Record a local caret move. Returns a message unless throttled.
    pub fn update_local_cursor(&mut self, index: u32) -> Option<AwarenessMessage> {
        self.local_cursor = Some(index);
        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.cursor_broadcast_interval {
                return None;
            }
        }
        self.timestamp_counter += 1;
        self.last_cursor_broadcast = Some(Instant::now());
        Some(AwarenessMessage::Cursor {
            connection_id: self.local_id,
            index,
            timestamp: self.timestamp_counter,
        })
    }

    pub fn update_local_selection(&self, anchor: u32, head: u32) -> AwarenessMessage {
        AwarenessMessage::Selection {
            connection_id: self.local_id,
            anchor,
            head,
        }
    }

    pub fn create_leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            connection_id: self.local_id,
        }
    }

    pub fn peer(&self, connection_id: &Uuid) -> Option<&PeerPresence> {
        self.peers.get(connection_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerPresence> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Distinct users present, for a presence header. Sorted by name.
    pub fn present_users(&self) -> Vec<&PresenceIdentity> {
        let mut seen = std::collections::HashSet::new();
        let mut users: Vec<&PresenceIdentity> = self
            .peers
            .values()
            .map(|p| &p.identity)
            .filter(|id| seen.insert(id.user_id.clone()))
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    /// Drop peers that have been silent longer than the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn local_cursor(&self) -> Option<u32> {
        self.local_cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, user: &str) -> PresenceIdentity {
        PresenceIdentity::new(Uuid::new_v4(), UserId::from(user), name, UserRole::Editor)
    }

    #[test]
    fn test_color_stable_per_user() {
        let a = CursorColor::for_user(&UserId::from("alice"));
        let b = CursorColor::for_user(&UserId::from("alice"));
        assert_eq!(a, b);
        assert_eq!(a.a, 1.0);
        assert_eq!(a.to_hex().len(), 7);
    }

    #[test]
    fn test_same_user_same_color_across_connections() {
        let one = identity("Alice", "alice");
        let two = identity("Alice", "alice");
        assert_ne!(one.connection_id, two.connection_id);
        assert_eq!(one.color, two.color);
    }

    #[test]
    fn test_hsl_achromatic() {
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.5), (0.5, 0.5, 0.5));
    }

    #[test]
    fn test_awareness_encoding() {
        let msg = AwarenessMessage::Cursor {
            connection_id: Uuid::new_v4(),
            index: 42,
            timestamp: 7,
        };
        let decoded = AwarenessMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_attributed_to_rewrites_sender() {
        let real = Uuid::new_v4();
        let msg = AwarenessMessage::Selection {
            connection_id: Uuid::new_v4(),
            anchor: 1,
            head: 4,
        }
        .attributed_to(real);
        assert_eq!(msg.connection_id(), real);
    }

    #[test]
    fn test_join_cursor_leave() {
        let mut room = PresenceRoom::new(Uuid::nil());
        let bob = identity("Bob", "bob");
        let id = bob.connection_id;

        assert!(room.handle_message(&AwarenessMessage::Join { identity: bob }));
        assert!(room.handle_message(&AwarenessMessage::Cursor {
            connection_id: id,
            index: 3,
            timestamp: 1,
        }));
        assert_eq!(room.peer(&id).unwrap().cursor, Some(3));

        assert!(room.handle_message(&AwarenessMessage::Leave { connection_id: id }));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_stale_cursor_rejected() {
        let mut room = PresenceRoom::new(Uuid::nil());
        let bob = identity("Bob", "bob");
        let id = bob.connection_id;
        room.handle_message(&AwarenessMessage::Join { identity: bob });

        room.handle_message(&AwarenessMessage::Cursor { connection_id: id, index: 10, timestamp: 5 });
        let applied = room.handle_message(&AwarenessMessage::Cursor {
            connection_id: id,
            index: 2,
            timestamp: 4,
        });
        assert!(!applied);
        assert_eq!(room.peer(&id).unwrap().cursor, Some(10));
        assert_eq!(room.peer(&id).unwrap().last_timestamp(), 5);
    }

    #[test]
    fn test_unknown_peer_cursor_ignored() {
        let mut room = PresenceRoom::new(Uuid::nil());
        assert!(!room.handle_message(&AwarenessMessage::Cursor {
            connection_id: Uuid::new_v4(),
            index: 0,
            timestamp: 1,
        }));
    }

    #[test]
    fn test_own_messages_ignored() {
        let me = Uuid::new_v4();
        let mut room = PresenceRoom::new(me);
        let mut ident = identity("Me", "me");
        ident.connection_id = me;
        assert!(!room.handle_message(&AwarenessMessage::Join { identity: ident }));
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_local_cursor_rate_limited() {
        let mut room = PresenceRoom::with_timeouts(Uuid::new_v4(), Duration::from_secs(60), IDLE_TIMEOUT);
        assert!(room.update_local_cursor(1).is_some());
        assert!(room.update_local_cursor(2).is_none());
        assert_eq!(room.local_cursor(), Some(2));
    }

    #[test]
    fn test_local_cursor_timestamps_increase() {
        let mut room = PresenceRoom::with_timeouts(Uuid::new_v4(), Duration::ZERO, IDLE_TIMEOUT);
        let t = |m: Option<AwarenessMessage>| match m {
            Some(AwarenessMessage::Cursor { timestamp, .. }) => timestamp,
            other => panic!("expected cursor, got {other:?}"),
        };
        let first = t(room.update_local_cursor(1));
        let second = t(room.update_local_cursor(2));
        assert!(second > first);
    }

    #[test]
    fn test_idle_peers_expire() {
        let mut room = PresenceRoom::with_timeouts(Uuid::nil(), CURSOR_BROADCAST_INTERVAL, Duration::ZERO);
        let bob = identity("Bob", "bob");
        let id = bob.connection_id;
        room.handle_message(&AwarenessMessage::Join { identity: bob });
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(room.cleanup_idle_peers(), vec![id]);
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_present_users_dedupes_connections() {
        let mut room = PresenceRoom::new(Uuid::nil());
        room.handle_message(&AwarenessMessage::Join { identity: identity("Bob", "bob") });
        room.handle_message(&AwarenessMessage::Join { identity: identity("Bob", "bob") });
        room.handle_message(&AwarenessMessage::Join { identity: identity("Ann", "ann") });

        let users = room.present_users();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].name, "Ann");
    }
}
