//! Document persistence gateway consumed by the title editor.
//!
//! `update_document` resolves to `Some(document)` on success and `None` when
//! nothing was persisted. Callers rely on presence only, never on the shape.
//!
//! Implementations:
//! - [`LocalGateway`] writes through an in-process [`RoomRegistry`]
//! - [`RemoteGateway`] sends a room request over a connected [`SyncClient`]
//! - [`RetryingGateway`] adds per-attempt timeouts and exponential backoff

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::client::SyncClient;
use crate::error::RoomError;
use crate::protocol::{ProtocolError, RequestFailure, RoomRequest, RoomResponse};
use crate::registry::{RequestSeq, RoomRegistry, TitleUpdate};
use crate::room::{Document, RoomId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Persistence attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Denied: {0}")]
    Denied(String),

    #[error("Room not found: {0}")]
    NotFound(String),

    #[error("Invalid title: {0}")]
    InvalidTitle(String),
}

impl GatewayError {
    /// Transport failures and timeouts may succeed on another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

impl From<RoomError> for GatewayError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::NotFound(id) => GatewayError::NotFound(id.to_string()),
            RoomError::InvalidTitle(reason) => GatewayError::InvalidTitle(reason),
            RoomError::Storage(e) => GatewayError::Transport(e.to_string()),
            other => GatewayError::Denied(other.to_string()),
        }
    }
}

impl From<RequestFailure> for GatewayError {
    fn from(failure: RequestFailure) -> Self {
        match failure {
            RequestFailure::Denied(reason) => GatewayError::Denied(reason),
            RequestFailure::NotFound(reason) => GatewayError::NotFound(reason),
            RequestFailure::InvalidTitle(reason) => GatewayError::InvalidTitle(reason),
            RequestFailure::CreatorImmutable => {
                GatewayError::Denied("the room creator cannot be changed".to_string())
            }
            RequestFailure::Internal(reason) => GatewayError::Transport(reason),
        }
    }
}

impl From<ProtocolError> for GatewayError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout => GatewayError::Timeout(Duration::ZERO),
            ProtocolError::Denied(reason) => GatewayError::Denied(reason),
            other => GatewayError::Transport(other.to_string()),
        }
    }
}

/// Persists a room title.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn update_document(&self, room_id: &RoomId, title: &str) -> Result<Option<Document>, GatewayError>;
}

#[async_trait]
impl<G: PersistenceGateway + ?Sized> PersistenceGateway for Arc<G> {
    async fn update_document(&self, room_id: &RoomId, title: &str) -> Result<Option<Document>, GatewayError> {
        (**self).update_document(room_id, title).await
    }
}

/// Writes through an in-process registry on behalf of one user.
///
/// Each gateway is its own writer: its requests are numbered so the
/// registry can discard one that arrives after a newer one.
pub struct LocalGateway {
    registry: Arc<RoomRegistry>,
    user: UserId,
    writer: Uuid,
    next_seq: AtomicU64,
}

impl LocalGateway {
    pub fn new(registry: Arc<RoomRegistry>, user: impl Into<UserId>) -> Self {
        Self {
            registry,
            user: user.into(),
            writer: Uuid::new_v4(),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }
}

#[async_trait]
impl PersistenceGateway for LocalGateway {
    async fn update_document(&self, room_id: &RoomId, title: &str) -> Result<Option<Document>, GatewayError> {
        let request = RequestSeq {
            writer: self.writer,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        let outcome = self
            .registry
            .update_title(room_id, &self.user, title, Some(request))
            .await?;
        Ok(match outcome {
            TitleUpdate::Updated(doc) | TitleUpdate::Unchanged(doc) => Some(doc),
            TitleUpdate::Superseded => None,
        })
    }
}

/// Persists through a connected client's request channel.
pub struct RemoteGateway {
    client: Arc<SyncClient>,
}

impl RemoteGateway {
    pub fn new(client: Arc<SyncClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PersistenceGateway for RemoteGateway {
    async fn update_document(&self, room_id: &RoomId, title: &str) -> Result<Option<Document>, GatewayError> {
        if room_id != self.client.room_id() {
            return Err(GatewayError::NotFound(format!(
                "client is joined to {}, not {room_id}",
                self.client.room_id()
            )));
        }
        let response = self
            .client
            .request(RoomRequest::UpdateTitle {
                title: title.to_string(),
            })
            .await?;
        match response {
            RoomResponse::Document(doc) => Ok(Some(doc)),
            RoomResponse::Superseded | RoomResponse::Deleted => Ok(None),
            RoomResponse::Failed(failure) => Err(failure.into()),
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled each time after
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            attempt_timeout: Duration::from_millis(200),
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Wraps a gateway with the retry policy. Title updates are idempotent, so
/// repeating one is safe.
pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: PersistenceGateway> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<G: PersistenceGateway> PersistenceGateway for RetryingGateway<G> {
    async fn update_document(&self, room_id: &RoomId, title: &str) -> Result<Option<Document>, GatewayError> {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.inner.update_document(room_id, title),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout(self.policy.attempt_timeout)),
            };

            match result {
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.policy.backoff(attempt);
                    log::debug!("Persisting title of {room_id} failed (attempt {attempt}/{attempts}): {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
