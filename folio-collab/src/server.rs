//! WebSocket session coordinator with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── Room (room_id) ── Yrs Doc
//!             ├── Session ── Join ───┤         │
//! Client B ──┘   (per socket)        │         ├── OperationLog
//!                                    │         ├── BroadcastGroup ──► peers
//!                                    │         └── DocumentStore (RocksDB)
//!                                    └── RoomRegistry (permission gate)
//! ```
//!
//! A session starts with a `Join` frame naming the room and user. Users who
//! are not collaborators are answered `Denied` and disconnected. Every later
//! frame is executed through the registry on behalf of the session's user.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 3 & 8

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Frame;
use crate::document::empty_state_vector;
use crate::error::RoomError;
use crate::oplog::{CatchUp, DEFAULT_COMPACTION_THRESHOLD};
use crate::permission::RolePolicy;
use crate::protocol::{
    DeniedNotice, MessageType, RequestFailure, ResponseEnvelope, RoomRequest, RoomResponse,
    SyncMessage,
};
use crate::registry::{RegistryConfig, RequestSeq, RoomHandle, RoomRegistry, TitleUpdate};
use crate::room::{RoomId, UserId};
use crate::storage::{DocumentStore, StoreConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type FrameReceiver = broadcast::Receiver<Arc<Frame>>;

/// Server configuration. Loadable from TOML; every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval, also the time allowed for the `Join` frame
    pub heartbeat_interval_secs: u64,
    /// Op-log entries before a room is checkpointed
    pub compaction_threshold: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// In-memory config on an OS-assigned port.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 5,
            compaction_threshold: 8,
            storage_path: None,
        }
    }

    fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            broadcast_capacity: self.broadcast_capacity,
            compaction_threshold: self.compaction_threshold,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_joins: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_deltas: u64,
    pub persisted_snapshots: u64,
    pub rejected_mutations: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening the store if a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, RoomError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        let registry = Arc::new(RoomRegistry::new(
            store,
            Arc::new(RolePolicy),
            config.registry_config(),
        ));
        Ok(Self::with_registry(config, registry))
    }

    /// Serve an existing registry (shared with in-process gateways).
    pub fn with_registry(config: ServerConfig, registry: Arc<RoomRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let registry = Arc::new(RoomRegistry::new(None, Arc::new(RolePolicy), config.registry_config()));
        Self::with_registry(config, registry)
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, RoomError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Recover persisted rooms from storage.
    pub async fn recover(&self) -> Result<usize, RoomError> {
        self.registry.recover().await
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Recover, bind and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from persistent storage");
        }
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let heartbeat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let result = match Self::admit(&mut ws_sender, &mut ws_receiver, &registry, &config, heartbeat).await {
            Ok(Some((session, receiver))) => {
                let outcome = session
                    .run(&mut ws_sender, &mut ws_receiver, receiver, &stats, heartbeat)
                    .await;
                registry.leave(&session.handle, session.connection_id).await;
                let _ = ws_sender.close().await;
                outcome
            }
            Ok(None) => {
                stats.write().await.rejected_joins += 1;
                let _ = ws_sender.close().await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        log::info!("Connection closed from {addr}");
        result
    }

    /// Wait for `Join` and admit the user. `Ok(None)` when rejected.
    async fn admit<R>(
        ws_sender: &mut WsSink,
        ws_receiver: &mut R,
        registry: &Arc<RoomRegistry>,
        config: &ServerConfig,
        timeout: Duration,
    ) -> Result<Option<(Session, FrameReceiver)>, BoxError>
    where
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let first = loop {
            match tokio::time::timeout(timeout, ws_receiver.next()).await {
                Err(_) => {
                    log::warn!("No Join frame within {timeout:?}");
                    return Ok(None);
                }
                Ok(Some(Ok(Message::Binary(data)))) => break SyncMessage::decode(&data),
                Ok(Some(Ok(Message::Ping(data)))) => ws_sender.send(Message::Pong(data)).await?,
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(None),
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(e.into()),
            }
        };

        let msg = match first {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Undecodable first frame: {e}");
                return Ok(None);
            }
        };
        let room_id = msg.room_id.clone();

        let join = match msg.join_request() {
            Ok(join) => join,
            Err(_) => {
                let reason = format!("expected Join, got {:?}", msg.msg_type);
                send(ws_sender, &deny(&room_id, msg.msg_type, reason)?).await?;
                return Ok(None);
            }
        };

        if let Ok(handle) = registry.room_handle(&room_id).await {
            if handle.broadcast().peer_count().await >= config.max_peers_per_room {
                log::warn!("Room {room_id} is full; rejecting {}", join.user_id);
                send(ws_sender, &deny(&room_id, MessageType::Join, "room is full".into())?).await?;
                return Ok(None);
            }
        }

        let connection_id = Uuid::new_v4();
        let joined = match registry
            .join_at(&room_id, &join.user_id, &join.name, connection_id, join.resume_from)
            .await
        {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Join of {} to room {room_id} rejected: {e}", join.user_id);
                send(ws_sender, &deny(&room_id, MessageType::Join, e.to_string())?).await?;
                return Ok(None);
            }
        };

        let version = joined.welcome.version;
        send(ws_sender, &SyncMessage::welcome(room_id.clone(), &joined.welcome)?).await?;
        match joined.catch_up {
            CatchUp::Snapshot(state) => {
                send(ws_sender, &SyncMessage::sync_step2(Uuid::nil(), room_id.clone(), version, state)).await?;
            }
            CatchUp::Updates(updates) => {
                log::debug!("Resuming {connection_id} with {} update(s)", updates.len());
                for (version, update) in updates {
                    send(ws_sender, &SyncMessage::delta(Uuid::nil(), room_id.clone(), version, update)).await?;
                }
            }
        }

        let session = Session {
            connection_id,
            room_id,
            user_id: join.user_id,
            registry: registry.clone(),
            handle: joined.handle,
        };
        Ok(Some((session, joined.receiver)))
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let registry = self.registry.stats().await;
        stats.active_rooms = registry.rooms;
        stats.persisted_deltas = registry.persisted_deltas;
        stats.persisted_snapshots = registry.persisted_snapshots;
        stats.rejected_mutations = registry.rejected_mutations;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn send(ws_sender: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

fn deny(room_id: &RoomId, rejected: MessageType, reason: String) -> Result<SyncMessage, BoxError> {
    Ok(SyncMessage::denied(room_id.clone(), &DeniedNotice { rejected, reason })?)
}

/// One admitted connection.
struct Session {
    connection_id: Uuid,
    room_id: RoomId,
    user_id: UserId,
    registry: Arc<RoomRegistry>,
    handle: Arc<RoomHandle>,
}

impl Session {
    async fn run<R>(
        &self,
        ws_sender: &mut WsSink,
        ws_receiver: &mut R,
        mut receiver: FrameReceiver,
        stats: &Arc<RwLock<ServerStats>>,
        heartbeat: Duration,
    ) -> Result<(), BoxError>
    where
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match SyncMessage::decode(&data) {
                                Ok(sync_msg) => {
                                    if let Some(reply) = self.handle_frame(sync_msg).await {
                                        send(ws_sender, &reply).await?;
                                    }
                                }
                                Err(e) => log::warn!("Failed to decode message from {}: {e}", self.connection_id),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error on {}: {e}", self.connection_id);
                            break;
                        }
                        _ => {}
                    }
                }

                frame = receiver.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.closes_connection(&self.connection_id) {
                                log::info!("Closing session {} of {} in room {}", self.connection_id, self.user_id, self.room_id);
                                ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                                break;
                            }
                            // Don't echo back to sender
                            if frame.origin == self.connection_id {
                                continue;
                            }
                            ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            self.handle.broadcast().record_dropped(n);
                            // The skipped frames may have closed this session
                            if !self.handle.broadcast().has_peer(&self.connection_id).await {
                                log::info!("Session {} was detached while lagging", self.connection_id);
                                break;
                            }
                            log::warn!("Peer {} lagged by {n} messages; resending state", self.connection_id);
                            if let Some(reply) = self.full_state().await {
                                send(ws_sender, &reply).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = ticker.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
        Ok(())
    }

    async fn full_state(&self) -> Option<SyncMessage> {
        match self
            .registry
            .sync_diff(&self.room_id, &self.user_id, &empty_state_vector())
            .await
        {
            Ok((version, state)) => Some(SyncMessage::sync_step2(Uuid::nil(), self.room_id.clone(), version, state)),
            Err(e) => {
                log::warn!("Cannot resend state to {}: {e}", self.connection_id);
                None
            }
        }
    }

    fn denied(&self, rejected: MessageType, reason: String) -> Option<SyncMessage> {
        match deny(&self.room_id, rejected, reason) {
            Ok(msg) => Some(msg),
            Err(e) => {
                log::error!("Failed to encode denial: {e}");
                None
            }
        }
    }

    /// Execute one frame. Returns the direct reply, if any.
    async fn handle_frame(&self, msg: SyncMessage) -> Option<SyncMessage> {
        if msg.room_id != self.room_id {
            return self.denied(msg.msg_type, format!("session is bound to room {}", self.room_id));
        }

        match msg.msg_type {
            MessageType::Delta => {
                match self
                    .registry
                    .apply_delta(&self.room_id, &self.user_id, self.connection_id, msg.payload)
                    .await
                {
                    Ok(version) => {
                        log::trace!("Applied delta {version} from {} in room {}", self.connection_id, self.room_id);
                        None
                    }
                    Err(e) => {
                        log::warn!("Dropped delta from {} ({}): {e}", self.connection_id, self.user_id);
                        self.denied(MessageType::Delta, e.to_string())
                    }
                }
            }

            MessageType::SyncStep1 => match self.registry.sync_diff(&self.room_id, &self.user_id, &msg.payload).await {
                Ok((version, diff)) => Some(SyncMessage::sync_step2(Uuid::nil(), self.room_id.clone(), version, diff)),
                Err(e) => self.denied(MessageType::SyncStep1, e.to_string()),
            },

            MessageType::Awareness => {
                match msg.awareness_message() {
                    Ok(awareness) => {
                        if let Err(e) = self
                            .registry
                            .relay_awareness(&self.room_id, self.connection_id, awareness)
                            .await
                        {
                            log::debug!("Awareness from {} not relayed: {e}", self.connection_id);
                        }
                    }
                    Err(e) => log::warn!("Bad awareness frame from {}: {e}", self.connection_id),
                }
                None
            }

            MessageType::Request => match msg.request_envelope() {
                Ok(envelope) => {
                    let response = self.execute(envelope.seq, envelope.request).await;
                    match SyncMessage::response(
                        self.room_id.clone(),
                        &ResponseEnvelope {
                            seq: envelope.seq,
                            response,
                        },
                    ) {
                        Ok(reply) => Some(reply),
                        Err(e) => {
                            log::error!("Failed to encode response {}: {e}", envelope.seq);
                            None
                        }
                    }
                }
                Err(e) => self.denied(MessageType::Request, e.to_string()),
            },

            MessageType::Ping => Some(SyncMessage::pong(Uuid::nil(), self.room_id.clone())),

            MessageType::Join => self.denied(MessageType::Join, "already joined".into()),

            other => {
                log::debug!("Unhandled message type: {other:?}");
                None
            }
        }
    }

    async fn execute(&self, seq: u64, request: RoomRequest) -> RoomResponse {
        let room = &self.room_id;
        let user = &self.user_id;
        let result = match request {
            RoomRequest::GetDocument => self.registry.get_room(room, user).await.map(RoomResponse::Document),
            RoomRequest::UpdateTitle { title } => {
                let request = RequestSeq {
                    writer: self.connection_id,
                    seq,
                };
                self.registry
                    .update_title(room, user, &title, Some(request))
                    .await
                    .map(|outcome| match outcome {
                        TitleUpdate::Updated(doc) | TitleUpdate::Unchanged(doc) => RoomResponse::Document(doc),
                        TitleUpdate::Superseded => RoomResponse::Superseded,
                    })
            }
            RoomRequest::UpdateAccess { user: target, role } => self
                .registry
                .update_access(room, user, target, role)
                .await
                .map(RoomResponse::Document),
            RoomRequest::RemoveCollaborator { user: target } => self
                .registry
                .remove_collaborator(room, user, &target)
                .await
                .map(RoomResponse::Document),
            RoomRequest::DeleteRoom => self.registry.delete_room(room, user).await.map(|_| RoomResponse::Deleted),
        };

        result.unwrap_or_else(|e| {
            log::debug!("Request {seq} from {} failed: {e}", self.connection_id);
            RoomResponse::Failed(RequestFailure::from(&e))
        })
    }
}
