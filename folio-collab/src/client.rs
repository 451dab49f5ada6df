//! WebSocket client for a room session.
//!
//! Provides:
//! - Connection lifecycle (join handshake, disconnect)
//! - Delta send/receive for Yrs integration
//! - Awareness (cursor/selection) updates
//! - Room requests matched to their responses by sequence number
//! - Offline queue for disconnected edits
//!
//! Reference: Kleppmann, Chapter 5, Replication

use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::{AwarenessMessage, PresenceIdentity};
use crate::protocol::{
    DeniedNotice, JoinRequest, MessageType, ProtocolError, RequestEnvelope, RoomRequest,
    RoomResponse, SyncMessage, Welcome,
};
use crate::room::{Document, RoomId, UserId};

/// How long `connect` waits for the server's reply to `Join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Join accepted
    Connected(Box<Welcome>),
    Disconnected,
    /// Received a CRDT delta from a remote peer
    RemoteDelta {
        peer_id: Uuid,
        version: u64,
        update: Vec<u8>,
    },
    RemoteAwareness(AwarenessMessage),
    PeerJoined(PresenceIdentity),
    PeerLeft(Uuid),
    /// State received in answer to a sync step 1 (or right after joining)
    StateSynced { version: u64, state: Vec<u8> },
    /// Title or collaborators changed
    MetadataChanged(Document),
    /// The server rejected one of our frames
    Denied(DeniedNotice),
    Pong,
}

/// Offline queue for edits made while disconnected.
///
/// Queued deltas are replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta { clock, payload });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|d| (d.clock, d.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<RoomResponse>>;
type PendingRequests = Arc<std::sync::Mutex<PendingMap>>;

fn lock_pending(pending: &PendingRequests) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forgets a request once its caller stops waiting, answered or not.
struct PendingGuard {
    pending: PendingRequests,
    seq: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.seq);
    }
}

/// The sync client.
pub struct SyncClient {
    user_id: UserId,
    name: String,
    room_id: RoomId,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,
    /// Assigned by the server on join
    identity: Arc<RwLock<Option<PresenceIdentity>>>,

    /// Local delta counter
    clock: AtomicU64,
    /// Request sequence numbers; never reused, even across reconnects
    next_seq: AtomicU64,
    pending: PendingRequests,
    /// Highest op-log version received; sent as `resume_from` on rejoin
    seen_version: Arc<AtomicU64>,
    joined_before: bool,

    offline_queue: Mutex<OfflineQueue>,

    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(
        user_id: impl Into<UserId>,
        name: impl Into<String>,
        room_id: impl Into<RoomId>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            name: name.into(),
            room_id: room_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            identity: Arc::new(RwLock::new(None)),
            clock: AtomicU64::new(0),
            next_seq: AtomicU64::new(1),
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            seen_version: Arc::new(AtomicU64::new(0)),
            joined_before: false,
            offline_queue: Mutex::new(OfflineQueue::new(10_000)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the room.
    ///
    /// Resolves once the server has answered the join: `Ok` with the
    /// welcome, or `ProtocolError::Denied` if the user may not enter.
    pub async fn connect(&mut self) -> Result<Welcome, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = SyncMessage::join(
            self.room_id.clone(),
            &JoinRequest {
                user_id: self.user_id.clone(),
                name: self.name.clone(),
                resume_from: self
                    .joined_before
                    .then(|| self.seen_version.load(Ordering::SeqCst)),
            },
        )?;
        let sent = ws_writer.send(Message::Binary(join.encode()?.into())).await;
        if sent.is_err() {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(ProtocolError::ConnectionClosed);
        }

        let welcome = match Self::await_welcome(&mut ws_reader).await {
            Ok(welcome) => welcome,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        *self.identity.write().await = Some(welcome.identity.clone());
        self.joined_before = true;

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self
            .event_tx
            .try_send(SyncEvent::Connected(Box::new(welcome.clone())));

        // Replay offline queue
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued deltas", queued.len());
            for (clock, payload) in queued {
                let msg = SyncMessage::delta(welcome.identity.connection_id, self.room_id.clone(), clock, payload);
                self.send_frame(&msg).await?;
            }
        }

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let seen_version = self.seen_version.clone();
        let own_id = welcome.identity.connection_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => {
                            if sync_msg.peer_id == own_id {
                                continue;
                            }
                            if matches!(sync_msg.msg_type, MessageType::Delta | MessageType::SyncStep2) {
                                seen_version.fetch_max(sync_msg.clock, Ordering::SeqCst);
                            }
                            if let Some(evt) = Self::dispatch(sync_msg, &pending).await {
                                // A full event buffer must not hold up responses
                                if let Err(mpsc::error::TrySendError::Full(evt)) = event_tx.try_send(evt) {
                                    log::debug!("Event buffer full; dropping {evt:?}");
                                }
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail every outstanding request
            lock_pending(&pending).clear();
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.try_send(SyncEvent::Disconnected);
        });

        Ok(welcome)
    }

    async fn await_welcome<S>(reader: &mut S) -> Result<Welcome, ProtocolError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let next = tokio::time::timeout(JOIN_TIMEOUT, reader.next())
                .await
                .map_err(|_| ProtocolError::Timeout)?;
            match next {
                Some(Ok(Message::Binary(data))) => {
                    let msg = SyncMessage::decode(&data)?;
                    match msg.msg_type {
                        MessageType::Welcome => return msg.welcome_info(),
                        MessageType::Denied => {
                            let notice = msg.denied_notice()?;
                            return Err(ProtocolError::Denied(notice.reason));
                        }
                        other => log::debug!("Ignoring {other:?} before welcome"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed),
                Some(Err(e)) => return Err(ProtocolError::ConnectFailed(e.to_string())),
                Some(Ok(_)) => {}
            }
        }
    }

    async fn dispatch(msg: SyncMessage, pending: &PendingRequests) -> Option<SyncEvent> {
        match msg.msg_type {
            MessageType::Delta => Some(SyncEvent::RemoteDelta {
                peer_id: msg.peer_id,
                version: msg.clock,
                update: msg.payload,
            }),
            MessageType::SyncStep2 => Some(SyncEvent::StateSynced {
                version: msg.clock,
                state: msg.payload,
            }),
            MessageType::Awareness => msg.awareness_message().ok().map(SyncEvent::RemoteAwareness),
            MessageType::PeerJoined => msg.peer_identity().ok().map(SyncEvent::PeerJoined),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
            MessageType::MetadataChanged => msg.changed_document().ok().map(SyncEvent::MetadataChanged),
            MessageType::Denied => msg.denied_notice().ok().map(SyncEvent::Denied),
            MessageType::Pong => Some(SyncEvent::Pong),
            MessageType::Response => {
                match msg.response_envelope() {
                    Ok(envelope) => {
                        let waiting = lock_pending(pending).remove(&envelope.seq);
                        match waiting {
                            Some(tx) => {
                                let _ = tx.send(envelope.response);
                            }
                            None => log::debug!("Response {} has no waiting request", envelope.seq),
                        }
                    }
                    Err(e) => log::warn!("Bad response frame: {e}"),
                }
                None
            }
            other => {
                log::debug!("Unhandled message type: {other:?}");
                None
            }
        }
    }

    async fn send_frame(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn connection_id(&self) -> Uuid {
        self.identity
            .read()
            .await
            .as_ref()
            .map_or(Uuid::nil(), |i| i.connection_id)
    }

    /// Send a CRDT delta to the server.
    ///
    /// If disconnected, queues the delta for later replay.
    pub async fn send_delta(&self, yrs_update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;

        if self.connection_state().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(clock, yrs_update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::delta(self.connection_id().await, self.room_id.clone(), clock, yrs_update);
        self.send_frame(&msg).await
    }

    /// Ask the server for everything missing from `state_vector`.
    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::sync_step1(self.connection_id().await, self.room_id.clone(), state_vector);
        self.send_frame(&msg).await
    }

    /// Send an awareness update. Dropped silently while offline.
    pub async fn send_awareness(&self, awareness: &AwarenessMessage) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let msg = SyncMessage::awareness(self.connection_id().await, self.room_id.clone(), awareness)?;
        self.send_frame(&msg).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.connection_id().await, self.room_id.clone());
        self.send_frame(&msg).await
    }

    /// Send a room request and wait for its response.
    ///
    /// Fails with `ConnectionClosed` if the connection drops first. Callers
    /// bound the wait themselves.
    pub async fn request(&self, request: RoomRequest) -> Result<RoomResponse, ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(seq, tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            seq,
        };

        let msg = SyncMessage::request(
            self.connection_id().await,
            self.room_id.clone(),
            &RequestEnvelope { seq, request },
        )?;
        self.send_frame(&msg).await?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. Outstanding requests fail.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn identity(&self) -> Option<PresenceIdentity> {
        self.identity.read().await.clone()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    pub async fn pending_requests(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Highest op-log version received from the server.
    pub fn seen_version(&self) -> u64 {
        self.seen_version.load(Ordering::SeqCst)
    }
}
