//! Room facade for the view layer.
//!
//! Bundles what a room header needs: the title editor, the presence header
//! (distinct active collaborators) and the share panel data. Sync events from
//! a [`SyncClient`](crate::client::SyncClient) are folded in with
//! [`CollaborativeRoom::apply_event`].

use std::sync::Arc;
use uuid::Uuid;

use crate::client::SyncEvent;
use crate::events::{ListenerGuard, PointerEvents, PointerKind};
use crate::gateway::PersistenceGateway;
use crate::permission::UserType;
use crate::presence::{AwarenessMessage, PresenceIdentity, PresenceRoom};
use crate::room::{CollaboratorRef, Document, RoomId, RoomMetadata, UserId};
use crate::title::{TitleEditController, TitleEditor, TitleView};

/// Region id the view layer reports for pointer events on the title.
pub const TITLE_REGION: &str = "room-title";

/// Data for the share panel.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareView {
    pub room_id: RoomId,
    pub collaborators: Vec<CollaboratorRef>,
    pub creator_id: UserId,
    pub can_share: bool,
}

pub struct CollaborativeRoom {
    room_id: RoomId,
    metadata: RoomMetadata,
    users: Vec<CollaboratorRef>,
    user_type: UserType,
    title: Arc<TitleEditor>,
    presence: PresenceRoom,
    outside_click: Option<ListenerGuard>,
}

impl CollaborativeRoom {
    pub fn new(
        room_id: RoomId,
        room_metadata: RoomMetadata,
        users: Vec<CollaboratorRef>,
        current_user_type: UserType,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let controller = TitleEditController::new(room_id.clone(), room_metadata.title.clone(), current_user_type);
        Self::with_controller(room_id, room_metadata, users, controller, gateway)
    }

    fn with_controller(
        room_id: RoomId,
        room_metadata: RoomMetadata,
        users: Vec<CollaboratorRef>,
        controller: TitleEditController,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let current_user_type = controller.user_type();
        Self {
            room_id,
            metadata: room_metadata,
            users,
            user_type: current_user_type,
            title: Arc::new(TitleEditor::new(controller, gateway)),
            presence: PresenceRoom::new(Uuid::nil()),
            outside_click: None,
        }
    }

    /// Build from a persisted document, resolving the user's type from
    /// their collaborator role.
    pub fn for_user(document: &Document, user: &UserId, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let user_type = document
            .collaborators
            .iter()
            .find(|c| &c.id == user)
            .map(|c| UserType::from(c.role))
            .unwrap_or(UserType::Viewer);
        let controller = TitleEditController::new(document.room_id.clone(), document.metadata.title.clone(), user_type)
            .with_version(document.title_version);
        Self::with_controller(
            document.room_id.clone(),
            document.metadata.clone(),
            document.collaborators.clone(),
            controller,
            gateway,
        )
    }

    /// Start listening for pointer presses outside the title. Remounting
    /// replaces the previous listener.
    pub fn mount(&mut self, events: &PointerEvents) {
        let title = self.title.clone();
        self.outside_click = Some(events.subscribe(move |event| {
            if event.kind == PointerKind::Down && !event.is_within(TITLE_REGION) {
                title.cancel_on_outside_click();
            }
        }));
    }

    /// Detach the pointer listener.
    pub fn unmount(&mut self) {
        self.outside_click = None;
    }

    pub fn is_mounted(&self) -> bool {
        self.outside_click.is_some()
    }

    pub fn title(&self) -> &Arc<TitleEditor> {
        &self.title
    }

    pub fn title_view(&self) -> TitleView {
        self.title.view()
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn metadata(&self) -> &RoomMetadata {
        &self.metadata
    }

    pub fn user_type(&self) -> UserType {
        self.user_type
    }

    pub fn share_view(&self) -> ShareView {
        ShareView {
            room_id: self.room_id.clone(),
            collaborators: self.users.clone(),
            creator_id: self.metadata.creator_id.clone(),
            can_share: self.user_type.is_editor(),
        }
    }

    /// Distinct users connected to the room, sorted by name.
    pub fn active_collaborators(&self) -> Vec<PresenceIdentity> {
        self.presence.present_users().into_iter().cloned().collect()
    }

    /// Fold a sync event into the view state. Returns whether anything the
    /// header shows may have changed.
    pub fn apply_event(&mut self, event: &SyncEvent) -> bool {
        match event {
            SyncEvent::Connected(welcome) => {
                self.presence = PresenceRoom::new(welcome.identity.connection_id);
                for peer in &welcome.peers {
                    self.presence.handle_message(&AwarenessMessage::Join {
                        identity: peer.clone(),
                    });
                }
                self.apply_document(&welcome.document);
                true
            }
            SyncEvent::Disconnected => {
                self.presence = PresenceRoom::new(self.presence.local_id());
                true
            }
            SyncEvent::PeerJoined(identity) => self.presence.handle_message(&AwarenessMessage::Join {
                identity: identity.clone(),
            }),
            SyncEvent::PeerLeft(connection_id) => self.presence.handle_message(&AwarenessMessage::Leave {
                connection_id: *connection_id,
            }),
            SyncEvent::RemoteAwareness(msg) => self.presence.handle_message(msg),
            SyncEvent::MetadataChanged(doc) => {
                self.apply_document(doc);
                true
            }
            _ => false,
        }
    }

    /// Expire peers that went silent.
    pub fn expire_idle(&mut self) -> usize {
        self.presence.cleanup_idle_peers().len()
    }

    /// The user type is fixed for the life of the view; a role change
    /// arrives with the document and takes effect on the next construction.
    fn apply_document(&mut self, doc: &Document) {
        if doc.room_id != self.room_id {
            return;
        }
        if self.title.apply_remote(doc) {
            self.metadata.title = doc.metadata.title.clone();
        }
        self.users = doc.collaborators.clone();
    }
}
