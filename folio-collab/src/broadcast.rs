//! Fan-out broadcast to the peers of a room, with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a receiver that falls further behind lags and skips frames.
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::presence::PresenceIdentity;
use crate::protocol::{ProtocolError, SyncMessage};
use crate::room::{UserId, UserRole};

/// Pre-encoded frame plus the connection that caused it.
///
/// Sessions skip frames whose origin is their own connection. Server
/// notifications use `Uuid::nil()` and reach everyone.
#[derive(Debug)]
pub struct Frame {
    pub origin: Uuid,
    pub bytes: Vec<u8>,
    /// Connections that deliver this frame and then close
    pub closes: Vec<Uuid>,
}

impl Frame {
    pub fn closes_connection(&self, connection_id: &Uuid) -> bool {
        self.closes.contains(connection_id)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,

    /// Connected peers in this room
    peers: RwLock<HashMap<Uuid, PresenceIdentity>>,

    capacity: usize,

    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, identity: PresenceIdentity) -> broadcast::Receiver<Arc<Frame>> {
        let mut peers = self.peers.write().await;
        peers.insert(identity.connection_id, identity);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<PresenceIdentity> {
        self.peers.write().await.remove(connection_id)
    }

    /// Encode once and fan out. Returns the number of receivers.
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.broadcast_raw(origin, bytes))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, origin: Uuid, bytes: Vec<u8>) -> usize {
        self.send_frame(Frame {
            origin,
            bytes,
            closes: Vec::new(),
        })
    }

    /// Detach every connection of `user`. Their sessions deliver `notice`
    /// and close; frames sent afterwards never reach them.
    pub async fn evict_user(&self, user: &UserId, notice: &SyncMessage) -> Result<Vec<Uuid>, ProtocolError> {
        let bytes = notice.encode()?;
        let mut peers = self.peers.write().await;
        let evicted: Vec<Uuid> = peers
            .values()
            .filter(|p| &p.user_id == user)
            .map(|p| p.connection_id)
            .collect();
        if evicted.is_empty() {
            return Ok(evicted);
        }
        for id in &evicted {
            peers.remove(id);
        }
        self.send_frame(Frame {
            origin: Uuid::nil(),
            bytes,
            closes: evicted.clone(),
        });
        Ok(evicted)
    }

    /// Detach every connection of the room.
    pub async fn close_all(&self, notice: &SyncMessage) -> Result<Vec<Uuid>, ProtocolError> {
        let bytes = notice.encode()?;
        let mut peers = self.peers.write().await;
        let evicted: Vec<Uuid> = peers.drain().map(|(id, _)| id).collect();
        if !evicted.is_empty() {
            self.send_frame(Frame {
                origin: Uuid::nil(),
                bytes,
                closes: evicted.clone(),
            });
        }
        Ok(evicted)
    }

    fn send_frame(&self, frame: Frame) -> usize {
        let count = self.sender.send(Arc::new(frame)).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, skipped: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PresenceIdentity> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    /// Update the role shown for every connection of `user`.
    pub async fn set_role(&self, user: &UserId, role: UserRole) {
        let mut peers = self.peers.write().await;
        for identity in peers.values_mut().filter(|p| &p.user_id == user) {
            identity.role = role;
        }
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeniedNotice, MessageType};
    use crate::room::RoomId;

    fn identity(name: &str) -> PresenceIdentity {
        PresenceIdentity::new(Uuid::new_v4(), UserId::from(name), name, UserRole::Editor)
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = identity("alice");
        let id = peer.connection_id;

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        assert!(group.remove_peer(&id).await.is_some());
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_tags_origin() {
        let group = BroadcastGroup::new(16);
        let alice = identity("alice");
        let origin = alice.connection_id;

        let mut rx1 = group.add_peer(alice).await;
        let mut rx2 = group.add_peer(identity("bob")).await;

        let msg = SyncMessage::delta(origin, RoomId::from("r"), 1, vec![1, 2, 3]);
        assert_eq!(group.broadcast(origin, &msg).unwrap(), 2);

        // Filtering by origin is the session's job
        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        assert_eq!(f1.origin, origin);
        assert_eq!(SyncMessage::decode(&f2.bytes).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(identity("slow")).await;
        for i in 0..5u8 {
            group.broadcast_raw(Uuid::nil(), vec![i]);
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
    }

    #[tokio::test]
    async fn test_set_role_updates_all_connections() {
        let group = BroadcastGroup::new(16);
        let a1 = identity("alice");
        let mut a2 = identity("alice");
        a2.connection_id = Uuid::new_v4();
        let _r1 = group.add_peer(a1).await;
        let _r2 = group.add_peer(a2).await;

        group.set_role(&UserId::from("alice"), UserRole::Viewer).await;
        assert!(group.peers().await.iter().all(|p| p.role == UserRole::Viewer));
    }

    fn notice(reason: &str) -> SyncMessage {
        SyncMessage::denied(
            RoomId::from("r"),
            &DeniedNotice {
                rejected: MessageType::Join,
                reason: reason.into(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_evict_user_detaches_only_their_connections() {
        let group = BroadcastGroup::new(16);
        let bob1 = identity("bob");
        let bob2 = identity("bob");
        let carol = identity("carol");
        let (b1, b2, c) = (bob1.connection_id, bob2.connection_id, carol.connection_id);
        let mut rx_bob = group.add_peer(bob1).await;
        let _rx_bob2 = group.add_peer(bob2).await;
        let mut rx_carol = group.add_peer(carol).await;

        let mut evicted = group.evict_user(&UserId::from("bob"), &notice("revoked")).await.unwrap();
        evicted.sort();
        let mut expected = vec![b1, b2];
        expected.sort();
        assert_eq!(evicted, expected);
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&c).await);

        // Everyone sees the frame; only bob's connections act on it
        let frame = rx_bob.recv().await.unwrap();
        assert!(frame.closes_connection(&b1));
        assert!(!frame.closes_connection(&c));
        assert_eq!(SyncMessage::decode(&frame.bytes).unwrap().msg_type, MessageType::Denied);
        assert!(!rx_carol.recv().await.unwrap().closes_connection(&c));
    }

    #[tokio::test]
    async fn test_evict_absent_user_sends_nothing() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_peer(identity("carol")).await;
        assert!(group.evict_user(&UserId::from("bob"), &notice("revoked")).await.unwrap().is_empty());
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_close_all_detaches_everyone() {
        let group = BroadcastGroup::new(16);
        let alice = identity("alice");
        let a = alice.connection_id;
        let mut rx = group.add_peer(alice).await;
        let _rx2 = group.add_peer(identity("bob")).await;

        assert_eq!(group.close_all(&notice("deleted")).await.unwrap().len(), 2);
        assert_eq!(group.peer_count().await, 0);
        assert!(rx.recv().await.unwrap().closes_connection(&a));
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast_raw(Uuid::nil(), vec![0]), 0);
        assert_eq!(group.capacity(), 4);
    }
}
