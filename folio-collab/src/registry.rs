//! Room registry: the authoritative in-memory rooms, backed by the store.
//!
//! ```text
//!                 ┌──────────────────── RoomHandle ─────────────────────┐
//! RoomRegistry ──►│ Mutex<LiveRoom>                     BroadcastGroup  │
//!  (RoomId map)   │   Room (metadata, collaborators)     (fan-out)      │
//!                 │   RoomDocument (Yrs)                                │
//!                 │   OperationLog                                      │
//!                 │   PresenceRoom, writer sequences                    │
//!                 └──────────────┬──────────────────────────────────────┘
//!                                │ put_room / store_delta / save_snapshot
//!                                ▼
//!                          DocumentStore
//! ```
//!
//! Every mutation goes through the permission gate here, whatever the
//! caller's UI offered. Frames are broadcast while the room lock is held so
//! every subscriber sees room events in the order they were applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Frame};
use crate::document::RoomDocument;
use crate::error::RoomError;
use crate::oplog::{CatchUp, OperationLog, DEFAULT_COMPACTION_THRESHOLD};
use crate::permission::{Action, PermissionGate, RolePolicy};
use crate::presence::{AwarenessMessage, PresenceIdentity, PresenceRoom};
use crate::protocol::{DeniedNotice, MessageType, SyncMessage, Welcome};
use crate::room::{Document, Room, RoomId, UserId, UserRole};
use crate::storage::{DocumentStore, StoreError};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Op-log entries before the log is merged into a new snapshot
    pub compaction_threshold: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

impl RegistryConfig {
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 32,
            compaction_threshold: 8,
        }
    }
}

/// Identifies one request in a writer's stream of title updates.
///
/// A writer is one gateway or one connection; its sequence numbers only
/// ever increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSeq {
    pub writer: Uuid,
    pub seq: u64,
}

/// Result of a title update.
#[derive(Debug, Clone, PartialEq)]
pub enum TitleUpdate {
    Updated(Document),
    /// Title already had this value; nothing was written
    Unchanged(Document),
    /// A newer request from the same writer was already applied
    Superseded,
}

impl TitleUpdate {
    pub fn document(&self) -> Option<&Document> {
        match self {
            TitleUpdate::Updated(doc) | TitleUpdate::Unchanged(doc) => Some(doc),
            TitleUpdate::Superseded => None,
        }
    }
}

/// Counters exposed through server stats.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub rooms: usize,
    pub persisted_deltas: u64,
    pub persisted_snapshots: u64,
    pub rejected_mutations: u64,
}

struct LiveRoom {
    room: Room,
    document: RoomDocument,
    log: OperationLog,
    presence: PresenceRoom,
    writer_seqs: HashMap<Uuid, u64>,
    deleted: bool,
}

pub struct RoomHandle {
    id: RoomId,
    state: Mutex<LiveRoom>,
    broadcast: BroadcastGroup,
}

impl RoomHandle {
    fn new(room: Room, document: RoomDocument, log: OperationLog, capacity: usize) -> Self {
        Self {
            id: room.id().clone(),
            state: Mutex::new(LiveRoom {
                room,
                document,
                log,
                presence: PresenceRoom::new(Uuid::nil()),
                writer_seqs: HashMap::new(),
                deleted: false,
            }),
            broadcast: BroadcastGroup::new(capacity),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Current room content (for inspection and tests).
    pub async fn content(&self) -> String {
        self.state.lock().await.document.content()
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.log.version()
    }

    pub async fn document(&self) -> Document {
        self.state.lock().await.room.to_document()
    }
}

/// Everything a session needs after a successful join.
pub struct JoinedRoom {
    pub handle: Arc<RoomHandle>,
    pub welcome: Welcome,
    /// What the session sends after `Welcome` to bring the peer to
    /// `welcome.version`
    pub catch_up: CatchUp,
    /// Subscribed before the state was taken: nothing is missed
    pub receiver: broadcast::Receiver<Arc<Frame>>,
}

struct AtomicRegistryStats {
    persisted_deltas: AtomicU64,
    persisted_snapshots: AtomicU64,
    rejected_mutations: AtomicU64,
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<RoomHandle>>>,
    store: Option<Arc<DocumentStore>>,
    gate: Arc<dyn PermissionGate>,
    config: RegistryConfig,
    stats: AtomicRegistryStats,
}

impl RoomRegistry {
    pub fn new(store: Option<Arc<DocumentStore>>, gate: Arc<dyn PermissionGate>, config: RegistryConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            gate,
            config,
            stats: AtomicRegistryStats {
                persisted_deltas: AtomicU64::new(0),
                persisted_snapshots: AtomicU64::new(0),
                rejected_mutations: AtomicU64::new(0),
            },
        }
    }

    /// In-memory registry with the default role policy.
    pub fn in_memory() -> Self {
        Self::new(None, Arc::new(RolePolicy), RegistryConfig::default())
    }

    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }

    /// Load every persisted room: record, snapshot, then newer deltas.
    pub async fn recover(&self) -> Result<usize, RoomError> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(0),
        };

        let persisted = store.list_rooms()?;
        let total = persisted.len();
        let mut rooms = self.rooms.write().await;

        for room in persisted {
            let id = room.id().clone();
            let (document, mut oplog) = match store.load_snapshot(&id) {
                Ok((version, snapshot)) => match RoomDocument::from_snapshot(&snapshot) {
                    Ok(doc) => (
                        doc,
                        OperationLog::from_base(snapshot, version, self.config.compaction_threshold),
                    ),
                    Err(e) => {
                        log::error!("Corrupt snapshot for room {id}: {e}");
                        continue;
                    }
                },
                Err(StoreError::NotFound(_)) => (
                    RoomDocument::new(),
                    OperationLog::new(self.config.compaction_threshold),
                ),
                Err(e) => return Err(e.into()),
            };

            let since = oplog.version() + 1;
            for (version, delta) in store.load_deltas_since(&id, since)? {
                if let Err(e) = document.apply_update(&delta) {
                    log::warn!("Skipping unreadable delta {version} of room {id}: {e}");
                    continue;
                }
                oplog.restore(version, &delta);
            }

            log::info!("Recovered room {id} at version {}", oplog.version());
            rooms.insert(
                id,
                Arc::new(RoomHandle::new(room, document, oplog, self.config.broadcast_capacity)),
            );
        }

        log::info!("Recovery complete: {}/{total} rooms restored", rooms.len());
        Ok(rooms.len())
    }

    async fn handle(&self, room_id: &RoomId) -> Result<Arc<RoomHandle>, RoomError> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))
    }

    fn check(&self, live: &LiveRoom, user: &UserId, action: Action) -> Result<UserRole, RoomError> {
        if live.deleted {
            return Err(RoomError::NotFound(live.room.id().clone()));
        }
        self.gate
            .check(user, live.room.role_of(user), action)
            .inspect_err(|e| {
                if e.is_denied() {
                    self.stats.rejected_mutations.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Rejected {action:?} on room {} by {user}: {e}", live.room.id());
                }
            })
    }

    fn persist_room(&self, room: &Room) -> Result<(), RoomError> {
        if let Some(store) = &self.store {
            store.put_room(room)?;
        }
        Ok(())
    }

    /// Close the sessions of `user`, or of everyone when `None`.
    async fn evict(handle: &RoomHandle, user: Option<&UserId>, rejected: MessageType, reason: String) {
        let notice = match SyncMessage::denied(handle.id.clone(), &DeniedNotice { rejected, reason }) {
            Ok(notice) => notice,
            Err(e) => {
                log::error!("Failed to encode eviction for room {}: {e}", handle.id);
                return;
            }
        };
        let evicted = match user {
            Some(user) => handle.broadcast.evict_user(user, &notice).await,
            None => handle.broadcast.close_all(&notice).await,
        };
        match evicted {
            Ok(ids) if !ids.is_empty() => log::info!("Closing {} session(s) in room {}", ids.len(), handle.id),
            Ok(_) => {}
            Err(e) => log::error!("Failed to evict sessions from room {}: {e}", handle.id),
        }
    }

    fn announce(handle: &RoomHandle, document: &Document) {
        match SyncMessage::metadata_changed(handle.id.clone(), document) {
            Ok(msg) => {
                if let Err(e) = handle.broadcast.broadcast(Uuid::nil(), &msg) {
                    log::error!("Failed to broadcast metadata for room {}: {e}", handle.id);
                }
            }
            Err(e) => log::error!("Failed to encode metadata for room {}: {e}", handle.id),
        }
    }

    // ─── Room lifecycle ───────────────────────────────────────────────

    pub async fn create_room(
        &self,
        room_id: impl Into<RoomId>,
        creator: impl Into<UserId>,
        title: impl Into<String>,
    ) -> Result<Document, RoomError> {
        let room = Room::new(room_id, creator, title)?;
        let id = room.id().clone();

        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&id) {
            return Err(RoomError::AlreadyExists(id));
        }
        self.persist_room(&room)?;

        let document = room.to_document();
        rooms.insert(
            id.clone(),
            Arc::new(RoomHandle::new(
                room,
                RoomDocument::new(),
                OperationLog::new(self.config.compaction_threshold),
                self.config.broadcast_capacity,
            )),
        );
        log::info!("Created room {id} for {}", document.metadata.creator_id);
        Ok(document)
    }

    /// Room document as seen by a collaborator.
    pub async fn get_room(&self, room_id: &RoomId, user: &UserId) -> Result<Document, RoomError> {
        let handle = self.handle(room_id).await?;
        let live = handle.state.lock().await;
        self.check(&live, user, Action::Read)?;
        Ok(live.room.to_document())
    }

    pub async fn room_handle(&self, room_id: &RoomId) -> Result<Arc<RoomHandle>, RoomError> {
        self.handle(room_id).await
    }

    /// Every room `user` collaborates on, sorted by room id.
    pub async fn list_rooms_for(&self, user: &UserId) -> Vec<Document> {
        let handles: Vec<Arc<RoomHandle>> = self.rooms.read().await.values().cloned().collect();
        let mut docs = Vec::new();
        for handle in handles {
            let live = handle.state.lock().await;
            if !live.deleted && live.room.role_of(user).is_some() {
                docs.push(live.room.to_document());
            }
        }
        docs.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        docs
    }

    /// Replace the title. Last request wins per writer when `request` is set.
    pub async fn update_title(
        &self,
        room_id: &RoomId,
        user: &UserId,
        title: &str,
        request: Option<RequestSeq>,
    ) -> Result<TitleUpdate, RoomError> {
        let handle = self.handle(room_id).await?;
        let mut live = handle.state.lock().await;
        self.check(&live, user, Action::EditTitle)?;

        if let Some(req) = request {
            if let Some(&latest) = live.writer_seqs.get(&req.writer) {
                if req.seq < latest {
                    log::debug!(
                        "Superseded title request {} from writer {} on room {room_id} (latest {latest})",
                        req.seq,
                        req.writer
                    );
                    return Ok(TitleUpdate::Superseded);
                }
            }
        }

        let mut next = live.room.clone();
        let changed = next.set_title(title)?;
        if changed {
            self.persist_room(&next)?;
            live.room = next;
        }
        if let Some(req) = request {
            live.writer_seqs.insert(req.writer, req.seq);
        }

        let document = live.room.to_document();
        if changed {
            log::info!("Room {room_id} retitled by {user} (version {})", document.title_version);
            Self::announce(&handle, &document);
            Ok(TitleUpdate::Updated(document))
        } else {
            Ok(TitleUpdate::Unchanged(document))
        }
    }

    /// Share: add `user` as a collaborator or change their role.
    pub async fn update_access(
        &self,
        room_id: &RoomId,
        actor: &UserId,
        user: UserId,
        role: UserRole,
    ) -> Result<Document, RoomError> {
        let handle = self.handle(room_id).await?;
        let mut live = handle.state.lock().await;
        self.check(&live, actor, Action::Share)?;

        let mut next = live.room.clone();
        next.upsert_collaborator(user.clone(), role)?;
        self.persist_room(&next)?;
        live.room = next;

        handle.broadcast.set_role(&user, role).await;
        let document = live.room.to_document();
        log::info!("{actor} granted {role} on room {room_id} to {user}");
        Self::announce(&handle, &document);
        Ok(document)
    }

    pub async fn remove_collaborator(
        &self,
        room_id: &RoomId,
        actor: &UserId,
        user: &UserId,
    ) -> Result<Document, RoomError> {
        let handle = self.handle(room_id).await?;
        let mut live = handle.state.lock().await;
        self.check(&live, actor, Action::RemoveCollaborator)?;

        let mut next = live.room.clone();
        if next.remove_collaborator(user)? {
            self.persist_room(&next)?;
            live.room = next;
            log::info!("{actor} removed {user} from room {room_id}");
            let reason = format!("access to room {room_id} was revoked");
            Self::evict(&handle, Some(user), MessageType::Join, reason).await;
        }

        let document = live.room.to_document();
        Self::announce(&handle, &document);
        Ok(document)
    }

    /// Delete a room and everything persisted for it. Creator only.
    pub async fn delete_room(&self, room_id: &RoomId, actor: &UserId) -> Result<(), RoomError> {
        let handle = self.handle(room_id).await?;
        {
            let mut live = handle.state.lock().await;
            self.check(&live, actor, Action::Delete)?;
            if let Some(store) = &self.store {
                store.delete_room(room_id)?;
            }
            live.deleted = true;
            Self::evict(&handle, None, MessageType::Join, format!("room {room_id} was deleted")).await;
        }
        self.rooms.write().await.remove(room_id);
        log::info!("Room {room_id} deleted by {actor}");
        Ok(())
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Admit a connection. Fails for users who are not collaborators.
    pub async fn join(
        &self,
        room_id: &RoomId,
        user: &UserId,
        name: &str,
        connection_id: Uuid,
    ) -> Result<JoinedRoom, RoomError> {
        self.join_at(room_id, user, name, connection_id, None).await
    }

    /// Admit a connection that already holds the room up to `resume_from`.
    /// It gets the op-log updates after that version, or the full state
    /// when the log cannot serve them.
    pub async fn join_at(
        &self,
        room_id: &RoomId,
        user: &UserId,
        name: &str,
        connection_id: Uuid,
        resume_from: Option<u64>,
    ) -> Result<JoinedRoom, RoomError> {
        let handle = self.handle(room_id).await?;
        let mut live = handle.state.lock().await;
        let role = self.check(&live, user, Action::Read)?;

        let identity = PresenceIdentity::new(connection_id, user.clone(), name, role);
        let peers = handle.broadcast.peers().await;
        let receiver = handle.broadcast.add_peer(identity.clone()).await;
        live.presence.handle_message(&AwarenessMessage::Join {
            identity: identity.clone(),
        });

        let welcome = Welcome {
            identity: identity.clone(),
            document: live.room.to_document(),
            peers,
            version: live.log.version(),
        };
        let catch_up = match resume_from {
            Some(version) if version <= live.log.version() => match live.log.since(version) {
                Ok(catch_up) => catch_up,
                Err(e) => {
                    log::warn!("Op log cannot serve version {version} of room {room_id}: {e}");
                    CatchUp::Snapshot(live.document.encode_state())
                }
            },
            _ => CatchUp::Snapshot(live.document.encode_state()),
        };

        match SyncMessage::peer_joined(room_id.clone(), &identity) {
            Ok(msg) => {
                let _ = handle.broadcast.broadcast(connection_id, &msg);
            }
            Err(e) => log::error!("Failed to encode join of {connection_id}: {e}"),
        }
        drop(live);

        log::info!("{name} ({user}, {role}) joined room {room_id} as {connection_id}");
        Ok(JoinedRoom {
            handle,
            welcome,
            catch_up,
            receiver,
        })
    }

    /// Apply a content update from a session. Returns the op-log version.
    pub async fn apply_delta(
        &self,
        room_id: &RoomId,
        user: &UserId,
        connection_id: Uuid,
        update: Vec<u8>,
    ) -> Result<u64, RoomError> {
        let handle = self.handle(room_id).await?;
        let mut live = handle.state.lock().await;
        self.check(&live, user, Action::EditContent)?;

        live.document.apply_update(&update)?;
        let version = live.log.append(&update);

        if let Some(store) = &self.store {
            match store.store_delta(room_id, version, &update) {
                Ok(_) => {
                    self.stats.persisted_deltas.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => log::error!("Failed to persist delta {version} for room {room_id}: {e}"),
            }
        }

        let msg = SyncMessage::delta(connection_id, room_id.clone(), version, update);
        if let Err(e) = handle.broadcast.broadcast(connection_id, &msg) {
            log::error!("Failed to broadcast delta for room {room_id}: {e}");
        }

        if live.log.needs_compaction() {
            self.checkpoint(room_id, &mut live);
        }
        Ok(version)
    }

    /// Answer a sync step 1: the diff plus the current op-log version.
    pub async fn sync_diff(
        &self,
        room_id: &RoomId,
        user: &UserId,
        state_vector: &[u8],
    ) -> Result<(u64, Vec<u8>), RoomError> {
        let handle = self.handle(room_id).await?;
        let live = handle.state.lock().await;
        self.check(&live, user, Action::Read)?;
        let diff = live.document.diff_since(state_vector)?;
        Ok((live.log.version(), diff))
    }

    /// Relay an awareness message unless it is stale. Returns whether it
    /// was relayed.
    pub async fn relay_awareness(
        &self,
        room_id: &RoomId,
        connection_id: Uuid,
        msg: AwarenessMessage,
    ) -> Result<bool, RoomError> {
        // Join and Leave are issued by the registry itself
        if matches!(msg, AwarenessMessage::Join { .. } | AwarenessMessage::Leave { .. }) {
            return Ok(false);
        }
        let handle = self.handle(room_id).await?;
        let mut live = handle.state.lock().await;
        let msg = msg.attributed_to(connection_id);
        if !live.presence.handle_message(&msg) {
            return Ok(false);
        }
        match SyncMessage::awareness(connection_id, room_id.clone(), &msg) {
            Ok(frame) => {
                let _ = handle.broadcast.broadcast(connection_id, &frame);
                Ok(true)
            }
            Err(e) => {
                log::warn!("Failed to encode awareness for room {room_id}: {e}");
                Ok(false)
            }
        }
    }

    /// Remove a connection. The last one out checkpoints the room.
    pub async fn leave(&self, handle: &Arc<RoomHandle>, connection_id: Uuid) {
        let mut live = handle.state.lock().await;
        let identity = handle.broadcast.remove_peer(&connection_id).await;
        live.presence
            .handle_message(&AwarenessMessage::Leave { connection_id });

        let _ = handle
            .broadcast
            .broadcast(connection_id, &SyncMessage::peer_left(connection_id, handle.id.clone()));

        if let Some(identity) = identity {
            log::info!("{} left room {}", identity.name, handle.id);
        }

        if !live.deleted && handle.broadcast.peer_count().await == 0 {
            self.checkpoint(&handle.id, &mut live);
        }
    }

    /// Snapshot the document and drop persisted deltas it covers.
    fn checkpoint(&self, room_id: &RoomId, live: &mut LiveRoom) {
        if live.log.pending() > 0 {
            if let Err(e) = live.log.compact() {
                log::warn!("Op-log compaction failed for room {room_id}: {e}");
            }
        }

        let Some(store) = &self.store else {
            return;
        };
        let version = live.log.version();
        let snapshot = live.document.encode_state();
        match store.save_snapshot(room_id, version, &snapshot) {
            Ok(info) => {
                self.stats.persisted_snapshots.fetch_add(1, Ordering::Relaxed);
                match store.compact_deltas(room_id, version) {
                    Ok(removed) => log::info!(
                        "Checkpointed room {room_id} at version {version} ({} bytes, {removed} deltas compacted)",
                        info.compressed_size
                    ),
                    Err(e) => log::error!("Failed to compact deltas for room {room_id}: {e}"),
                }
            }
            Err(e) => log::error!("Failed to persist snapshot for room {room_id}: {e}"),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            rooms: self.room_count().await,
            persisted_deltas: self.stats.persisted_deltas.load(Ordering::Relaxed),
            persisted_snapshots: self.stats.persisted_snapshots.load(Ordering::Relaxed),
            rejected_mutations: self.stats.rejected_mutations.load(Ordering::Relaxed),
        }
    }
}
