// Collaborator contracts
// Any backend offering these primitives can drive the engine

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{Contact, ContentRef, Message, NewMessage};
use super::{AppendError, TransportError, UploadError};

pub type FeedId = u64;

/// Event delivered by a remote feed.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// Full current ordering of the conversation.
    Snapshot(Vec<Message>),
    /// The feed broke. No further events follow.
    Error(TransportError),
}

/// A live feed bound to one conversation.
pub struct RemoteFeed {
    pub id: FeedId,
    pub events: mpsc::Receiver<RemoteEvent>,
}

/// Remote ordered log, one per conversation.
#[async_trait]
pub trait RemoteLog: Send + Sync {
    async fn subscribe(&self, conversation_id: &str) -> Result<RemoteFeed, TransportError>;

    /// Stop a feed. Must tolerate ids that are already gone.
    async fn unsubscribe(&self, feed_id: FeedId);

    /// Append a message. The log assigns the final id and timestamp and
    /// echoes the correlation id back on the committed message.
    async fn append(&self, conversation_id: &str, message: NewMessage) -> Result<Message, AppendError>;
}

/// Turns raw bytes into a content reference an append can point at.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<ContentRef, UploadError>;
}

/// Source of roster snapshots.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn subscribe_roster(&self) -> Result<mpsc::Receiver<Vec<Contact>>, TransportError>;
}
