//! Title editing: a synchronous state machine plus an async driver.
//!
//! ```text
//!            request_edit            commit (changed) / outside click
//! Viewing ────────────────► Editing ───────────────────────────────► Saving{seq}
//!    ▲   commit (unchanged)    │  ▲                                   │   │
//!    └─────────────────────────┘  │ request_edit                      │   │ failure / None
//!    ▲                            │                                   │   ▼
//!    │          success           └──────────────── Error{seq} ◄──────┘ Error
//!    └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every persistence request carries a sequence number. Only the outcome of
//! the latest request is applied; older ones are discarded, and the driver
//! aborts their tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::gateway::{GatewayError, PersistenceGateway};
use crate::permission::UserType;
use crate::room::{Document, RoomId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TitleError {
    #[error("Only editors may change the title")]
    PermissionDenied,

    #[error("The title was not persisted")]
    NotPersisted,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleState {
    Viewing,
    Editing { draft: String },
    Saving { seq: u64, title: String },
    Error { seq: u64, title: String, error: TitleError },
}

/// Edit control offered next to the title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affordance {
    EditButton,
    ViewOnly,
    None,
}

/// What the view layer renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleView {
    pub text: String,
    pub input_visible: bool,
    pub saving: bool,
    pub affordance: Affordance,
    pub error: Option<TitleError>,
}

/// A persistence call the owner of the controller must issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub seq: u64,
    pub room_id: RoomId,
    pub title: String,
}

pub type PersistOutcome = Result<Option<Document>, GatewayError>;

pub struct TitleEditController {
    room_id: RoomId,
    user_type: UserType,
    persisted: String,
    persisted_version: u64,
    state: TitleState,
    /// Last issued sequence number
    latest_seq: u64,
    /// Title of the latest request while its outcome is pending
    outstanding: Option<String>,
    /// Failure of the latest save while a newer edit is open
    background_error: Option<TitleError>,
}

impl TitleEditController {
    pub fn new(room_id: RoomId, title: impl Into<String>, user_type: UserType) -> Self {
        Self {
            room_id,
            user_type,
            persisted: title.into(),
            persisted_version: 0,
            state: TitleState::Viewing,
            latest_seq: 0,
            outstanding: None,
            background_error: None,
        }
    }

    /// Start from a title already at `title_version`; older remote
    /// documents are then ignored.
    pub fn with_version(mut self, title_version: u64) -> Self {
        self.persisted_version = title_version;
        self
    }

    pub fn state(&self) -> &TitleState {
        &self.state
    }

    pub fn persisted_title(&self) -> &str {
        &self.persisted
    }

    pub fn latest_seq(&self) -> u64 {
        self.latest_seq
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn user_type(&self) -> UserType {
        self.user_type
    }

    /// Open the title input. Editors only.
    pub fn request_edit(&mut self) -> Result<(), TitleError> {
        if !self.user_type.is_editor() {
            return Err(TitleError::PermissionDenied);
        }
        let draft = match &self.state {
            TitleState::Editing { .. } => return Ok(()),
            TitleState::Viewing => self.persisted.clone(),
            TitleState::Saving { title, .. } | TitleState::Error { title, .. } => title.clone(),
        };
        self.state = TitleState::Editing { draft };
        Ok(())
    }

    pub fn update_draft(&mut self, text: impl Into<String>) {
        if let TitleState::Editing { draft } = &mut self.state {
            *draft = text.into();
        }
    }

    /// Confirmation key. An unchanged draft closes the input without a save.
    ///
    /// While a save is pending the draft is compared with the title being
    /// saved: confirming that title resumes waiting for it, anything else
    /// is saved under a newer request.
    pub fn commit(&mut self) -> Option<PersistRequest> {
        let draft = match &self.state {
            TitleState::Editing { draft } => draft.clone(),
            _ => return None,
        };
        if let Some(pending) = &self.outstanding {
            if draft == *pending {
                self.state = TitleState::Saving {
                    seq: self.latest_seq,
                    title: draft,
                };
                return None;
            }
            return Some(self.begin_save(draft));
        }
        if draft == self.persisted {
            self.state = TitleState::Viewing;
            return None;
        }
        Some(self.begin_save(draft))
    }

    /// Focus left the title region. Saves even when the draft is unchanged.
    pub fn cancel_on_outside_click(&mut self) -> Option<PersistRequest> {
        let draft = match &self.state {
            TitleState::Editing { draft } => draft.clone(),
            _ => return None,
        };
        Some(self.begin_save(draft))
    }

    /// Apply the outcome of request `seq`. Returns whether it was applied.
    pub fn complete(&mut self, seq: u64, outcome: PersistOutcome) -> bool {
        if seq != self.latest_seq {
            log::debug!(
                "Discarding superseded title response {seq} for room {} (latest {})",
                self.room_id,
                self.latest_seq
            );
            return false;
        }
        self.outstanding = None;

        let saving_this = matches!(&self.state, TitleState::Saving { seq: s, .. } if *s == seq);
        let failure = match outcome {
            Ok(Some(doc)) => {
                self.adopt(&doc);
                if saving_this {
                    self.state = TitleState::Viewing;
                }
                return true;
            }
            Ok(None) => TitleError::NotPersisted,
            Err(e) => TitleError::Gateway(e),
        };

        log::warn!("Failed to persist title for room {}: {failure}", self.room_id);
        match std::mem::replace(&mut self.state, TitleState::Viewing) {
            TitleState::Saving { seq, title } => {
                self.state = TitleState::Error {
                    seq,
                    title,
                    error: failure,
                };
            }
            other => {
                self.state = other;
                self.background_error = Some(failure);
            }
        }
        true
    }

    /// Leave the error state, keeping the last persisted title.
    pub fn dismiss(&mut self) {
        if matches!(self.state, TitleState::Error { .. }) {
            self.state = TitleState::Viewing;
        }
        self.background_error = None;
    }

    /// Save the failed title again under a new sequence number.
    pub fn retry(&mut self) -> Option<PersistRequest> {
        let title = match &self.state {
            TitleState::Error { title, .. } => title.clone(),
            _ => return None,
        };
        Some(self.begin_save(title))
    }

    /// Adopt a title change made elsewhere. Older versions are ignored.
    pub fn apply_remote(&mut self, doc: &Document) -> bool {
        if doc.room_id != self.room_id || doc.title_version < self.persisted_version {
            return false;
        }
        self.adopt(doc);
        true
    }

    pub fn view(&self) -> TitleView {
        let editor = self.user_type.is_editor();
        let (text, input_visible, saving, error) = match &self.state {
            TitleState::Viewing => (self.persisted.clone(), false, false, None),
            TitleState::Editing { draft } => (draft.clone(), true, false, self.background_error.clone()),
            TitleState::Saving { title, .. } => (title.clone(), false, true, None),
            TitleState::Error { error, .. } => (self.persisted.clone(), false, false, Some(error.clone())),
        };
        let affordance = match (input_visible, editor) {
            (true, _) => Affordance::None,
            (false, true) => Affordance::EditButton,
            (false, false) => Affordance::ViewOnly,
        };
        TitleView {
            text,
            input_visible,
            saving,
            affordance,
            error,
        }
    }

    fn begin_save(&mut self, title: String) -> PersistRequest {
        self.latest_seq += 1;
        self.outstanding = Some(title.clone());
        self.background_error = None;
        self.state = TitleState::Saving {
            seq: self.latest_seq,
            title: title.clone(),
        };
        PersistRequest {
            seq: self.latest_seq,
            room_id: self.room_id.clone(),
            title,
        }
    }

    fn adopt(&mut self, doc: &Document) {
        self.persisted = doc.metadata.title.clone();
        self.persisted_version = self.persisted_version.max(doc.title_version);
    }
}

type SharedController = Arc<Mutex<TitleEditController>>;

fn lock(controller: &SharedController) -> MutexGuard<'_, TitleEditController> {
    controller.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives a [`TitleEditController`] against a persistence gateway.
///
/// Local transitions happen synchronously; persistence runs on spawned
/// tasks. At most one task is in flight: starting a save aborts the
/// previous one.
pub struct TitleEditor {
    controller: SharedController,
    gateway: Arc<dyn PersistenceGateway>,
    inflight: Arc<Mutex<Option<JoinHandle<()>>>>,
    views: watch::Sender<TitleView>,
    runtime: Option<tokio::runtime::Handle>,
}

impl TitleEditor {
    /// Persistence tasks run on the Tokio runtime current at construction.
    pub fn new(controller: TitleEditController, gateway: Arc<dyn PersistenceGateway>) -> Self {
        let (views, _) = watch::channel(controller.view());
        Self {
            controller: Arc::new(Mutex::new(controller)),
            gateway,
            inflight: Arc::new(Mutex::new(None)),
            views,
            runtime: tokio::runtime::Handle::try_current().ok(),
        }
    }

    pub fn request_edit(&self) -> Result<(), TitleError> {
        let result = lock(&self.controller).request_edit();
        self.publish();
        result
    }

    pub fn update_draft(&self, text: impl Into<String>) {
        lock(&self.controller).update_draft(text);
        self.publish();
    }

    /// Returns whether a persistence request was issued.
    pub fn commit(&self) -> bool {
        let request = lock(&self.controller).commit();
        self.issue(request)
    }

    pub fn cancel_on_outside_click(&self) -> bool {
        let request = lock(&self.controller).cancel_on_outside_click();
        self.issue(request)
    }

    pub fn retry(&self) -> bool {
        let request = lock(&self.controller).retry();
        self.issue(request)
    }

    pub fn dismiss(&self) {
        lock(&self.controller).dismiss();
        self.publish();
    }

    pub fn apply_remote(&self, doc: &Document) -> bool {
        let applied = lock(&self.controller).apply_remote(doc);
        self.publish();
        applied
    }

    pub fn view(&self) -> TitleView {
        lock(&self.controller).view()
    }

    pub fn state(&self) -> TitleState {
        lock(&self.controller).state().clone()
    }

    pub fn persisted_title(&self) -> String {
        lock(&self.controller).persisted_title().to_string()
    }

    /// View updates, starting with the current view.
    pub fn subscribe(&self) -> watch::Receiver<TitleView> {
        self.views.subscribe()
    }

    /// Wait until no persistence task is in flight.
    pub async fn settle(&self) {
        loop {
            let handle = self
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match handle {
                Some(handle) => {
                    // Aborted tasks end with a cancellation error
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    fn publish(&self) {
        let view = self.view();
        self.views.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn issue(&self, request: Option<PersistRequest>) -> bool {
        let Some(request) = request else {
            self.publish();
            return false;
        };
        self.publish();

        let Some(runtime) = &self.runtime else {
            log::error!("No async runtime to persist the title of room {}", request.room_id);
            lock(&self.controller).complete(
                request.seq,
                Err(GatewayError::Transport("no async runtime".to_string())),
            );
            self.publish();
            return true;
        };

        let controller = self.controller.clone();
        let gateway = self.gateway.clone();
        let views = self.views.clone();
        log::debug!("Persisting title of room {} (request {})", request.room_id, request.seq);

        let task = runtime.spawn(async move {
            let outcome = gateway.update_document(&request.room_id, &request.title).await;
            let view = {
                let mut controller = lock(&controller);
                controller.complete(request.seq, outcome);
                controller.view()
            };
            views.send_replace(view);
        });

        let previous = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{CollaboratorRef, RoomMetadata, UserId, UserRole};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn doc(title: &str, version: u64) -> Document {
        Document {
            room_id: RoomId::from("room"),
            metadata: RoomMetadata {
                title: title.to_string(),
                creator_id: UserId::from("alice"),
            },
            collaborators: vec![CollaboratorRef::new("alice", UserRole::Creator)],
            title_version: version,
            updated_at: 0,
        }
    }

    fn editor() -> TitleEditController {
        TitleEditController::new(RoomId::from("room"), "Untitled", UserType::Editor)
    }

    #[test]
    fn test_viewer_cannot_edit() {
        let mut c = TitleEditController::new(RoomId::from("room"), "Untitled", UserType::Viewer);
        assert_eq!(c.request_edit(), Err(TitleError::PermissionDenied));
        assert_eq!(c.state(), &TitleState::Viewing);
        assert_eq!(c.view().affordance, Affordance::ViewOnly);
        assert!(!c.view().input_visible);
        assert!(c.commit().is_none());
        assert!(c.cancel_on_outside_click().is_none());
    }

    #[test]
    fn test_editor_affordances() {
        let mut c = editor();
        assert_eq!(c.view().affordance, Affordance::EditButton);
        c.request_edit().unwrap();
        let view = c.view();
        assert!(view.input_visible);
        assert_eq!(view.affordance, Affordance::None);
        assert_eq!(view.text, "Untitled");
    }

    #[test]
    fn test_commit_unchanged_issues_nothing() {
        let mut c = editor();
        c.request_edit().unwrap();
        assert!(c.commit().is_none());
        assert_eq!(c.state(), &TitleState::Viewing);
        assert_eq!(c.latest_seq(), 0);
    }

    #[test]
    fn test_commit_changed_issues_exact_title() {
        let mut c = editor();
        c.request_edit().unwrap();
        c.update_draft("  Report Q3 ");
        let req = c.commit().unwrap();
        assert_eq!(req.title, "  Report Q3 ");
        assert_eq!(req.room_id, RoomId::from("room"));
        assert_eq!(req.seq, 1);
        assert!(c.view().saving);
        assert!(!c.view().input_visible);
    }

    #[test]
    fn test_outside_click_always_saves() {
        let mut c = editor();
        c.request_edit().unwrap();
        let req = c.cancel_on_outside_click().unwrap();
        assert_eq!(req.title, "Untitled");
        // Ignored while not editing
        assert!(c.cancel_on_outside_click().is_none());
    }

    #[test]
    fn test_success_returns_to_viewing() {
        let mut c = editor();
        c.request_edit().unwrap();
        c.update_draft("Report Q3");
        let req = c.commit().unwrap();
        assert!(c.complete(req.seq, Ok(Some(doc("Report Q3", 1)))));
        assert_eq!(c.state(), &TitleState::Viewing);
        let view = c.view();
        assert_eq!(view.text, "Report Q3");
        assert!(!view.input_visible);
        assert!(!view.saving);
    }

    #[test]
    fn test_failure_enters_error_and_reverts_text() {
        let mut c = editor();
        c.request_edit().unwrap();
        c.update_draft("Broken");
        let req = c.commit().unwrap();
        c.complete(req.seq, Err(GatewayError::Transport("reset".into())));

        match c.state() {
            TitleState::Error { title, .. } => assert_eq!(title, "Broken"),
            other => panic!("expected error state, got {other:?}"),
        }
        let view = c.view();
        assert_eq!(view.text, "Untitled");
        assert!(view.error.is_some());
    }

    #[test]
    fn test_absent_document_is_a_failure() {
        let mut c = editor();
        c.request_edit().unwrap();
        c.update_draft("X");
        let req = c.commit().unwrap();
        c.complete(req.seq, Ok(None));
        assert!(matches!(
            c.state(),
            TitleState::Error { error: TitleError::NotPersisted, .. }
        ));
    }

    #[test]
    fn test_superseded_response_is_discarded() {
        let mut c = editor();
        c.request_edit().unwrap();
        c.update_draft("First");
        let first = c.commit().unwrap();

        c.request_edit().unwrap();
        c.update_draft("Second");
        let second = c.commit().unwrap();

        assert!(c.complete(second.seq, Ok(Some(doc("Second", 2)))));
        assert!(!c.complete(first.seq, Ok(Some(doc("First", 1)))));
        assert_eq!(c.persisted_title(), "Second");
    }

    #[test]
    fn test_error_recovery_paths() {
        let mut c = editor();
        c.request_edit().unwrap();
        c.update_draft("Again");
        let req = c.commit().unwrap();
        c.complete(req.seq, Err(GatewayError::Timeout(Duration::from_secs(1))));

        let retry = c.retry().unwrap();
        assert_eq!(retry.title, "Again");
        assert!(retry.seq > req.seq);
        c.complete(retry.seq, Err(GatewayError::Timeout(Duration::from_secs(1))));

        c.request_edit().unwrap();
        assert_eq!(c.state(), &TitleState::Editing { draft: "Again".into() });

        let save = c.commit().unwrap();
        c.complete(save.seq, Ok(None));
        c.dismiss();
        assert_eq!(c.state(), &TitleState::Viewing);
        assert_eq!(c.view().text, "Untitled");
    }

    #[test]
    fn test_reverting_over_pending_save_issues_newer_request() {
        let mut c = editor();
        c.request_edit().unwrap();
        c.update_draft("First");
        let first = c.commit().unwrap();

        // Reopen while "First" is saving and go back to the persisted title
        c.request_edit().unwrap();
        c.update_draft("Untitled");
        let revert = c.commit().unwrap();
        assert_eq!(revert.title, "Untitled");
        assert!(revert.seq > first.seq);

        assert!(!c.complete(first.seq, Ok(Some(doc("First", 1)))));
        assert!(c.complete(revert.seq, Ok(Some(doc("Untitled", 2)))));
        assert_eq!(c.state(), &TitleState::Viewing);
        assert_eq!(c.view().text, "Untitled");
    }

    #[test]
    fn test_confirming_pending_title_resumes_saving() {
        let mut c = editor();
        c.request_edit().unwrap();
        c.update_draft("First");
        let first = c.commit().unwrap();

        c.request_edit().unwrap();
        assert!(c.commit().is_none());
        assert_eq!(
            c.state(),
            &TitleState::Saving {
                seq: first.seq,
                title: "First".into()
            }
        );
        assert!(c.complete(first.seq, Ok(Some(doc("First", 1)))));
        assert_eq!(c.state(), &TitleState::Viewing);
        assert_eq!(c.view().text, "First");
    }

    #[test]
    fn test_with_version_ignores_older_documents() {
        let mut c = editor().with_version(4);
        assert!(!c.apply_remote(&doc("Older", 3)));
        assert_eq!(c.persisted_title(), "Untitled");
        assert!(c.apply_remote(&doc("Newer", 5)));
        assert_eq!(c.persisted_title(), "Newer");
    }

    #[test]
    fn test_remote_change_ignores_older_versions() {
        let mut c = editor();
        assert!(c.apply_remote(&doc("Remote", 3)));
        assert_eq!(c.view().text, "Remote");
        assert!(!c.apply_remote(&doc("Stale", 2)));
        assert_eq!(c.persisted_title(), "Remote");
    }

    /// Records calls. With a gate, saving "Slow" blocks until notified.
    struct Recording {
        calls: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl PersistenceGateway for Recording {
        async fn update_document(&self, _room_id: &RoomId, title: &str) -> PersistOutcome {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(title.to_string());
                calls.len()
            };
            if let (Some(gate), "Slow") = (&self.gate, title) {
                gate.notified().await;
            }
            Ok(Some(doc(title, n as u64)))
        }
    }

    fn recording(gate: Option<Arc<Notify>>) -> Arc<Recording> {
        Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
            gate,
        })
    }

    #[tokio::test]
    async fn test_editor_scenario_report_q3() {
        let gateway = recording(None);
        let editor = TitleEditor::new(editor(), gateway.clone());

        editor.request_edit().unwrap();
        editor.update_draft("Report Q3");
        assert!(editor.commit());
        editor.settle().await;

        assert_eq!(*gateway.calls.lock().unwrap(), vec!["Report Q3".to_string()]);
        let view = editor.view();
        assert_eq!(view.text, "Report Q3");
        assert!(!view.input_visible);
        assert_eq!(editor.state(), TitleState::Viewing);
    }

    #[tokio::test]
    async fn test_editor_aborts_superseded_save() {
        let gate = Arc::new(Notify::new());
        let gateway = recording(Some(gate.clone()));
        let editor = TitleEditor::new(editor(), gateway.clone());

        editor.request_edit().unwrap();
        editor.update_draft("Slow");
        assert!(editor.commit());
        tokio::task::yield_now().await;

        editor.request_edit().unwrap();
        editor.update_draft("Fast");
        assert!(editor.cancel_on_outside_click());
        editor.settle().await;
        gate.notify_waiters();

        assert_eq!(editor.persisted_title(), "Fast");
        assert_eq!(editor.state(), TitleState::Viewing);
    }

    #[tokio::test]
    async fn test_editor_publishes_views() {
        let editor = TitleEditor::new(editor(), recording(None));
        let mut views = editor.subscribe();
        editor.request_edit().unwrap();
        views.changed().await.unwrap();
        assert!(views.borrow().input_visible);
    }
}
