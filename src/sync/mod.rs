// Live conversation log engine
// Keeps local per-conversation views consistent with a remote append-only log

use thiserror::Error;

use crate::models::{DeliveryStatus, LocalId};

pub mod backend;
pub mod directory;
pub mod memory;
pub mod outbound;
pub mod store;
pub mod subscription;

pub use backend::{ContentStore, FeedId, RemoteEvent, RemoteFeed, RemoteLog, RosterSource};
pub use directory::ContactDirectory;
pub use memory::InMemoryBackend;
pub use outbound::{OutboundQueue, RetryPolicy, SendTicket};
pub use store::{ConversationStore, ViewUpdate};
pub use subscription::{SubscriptionHandle, SyncEvent, SyncSubscription};

/// Default hard cap for attachments (5 MiB).
pub const MAX_ATTACHMENT_BYTES: usize = 5 * 1024 * 1024;

/// Feed-level failure. Retriable at the caller's discretion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Feed disconnected: {0}")]
    Disconnected(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Rejected before any upload or append is attempted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Attachment is {size} bytes, limit is {limit} bytes")]
    AttachmentTooLarge { size: usize, limit: usize },

    #[error("Attachment has no content reference")]
    MissingContent,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AppendError {
    /// The remote log refused the write. Terminal for that item.
    #[error("Append rejected: {0}")]
    Rejected(String),

    /// The write did not reach the log.
    #[error("Append did not reach the log: {0}")]
    Transport(#[from] TransportError),
}

impl AppendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AppendError::Transport(_))
    }
}

/// Content materialization failed. Nothing is appended for that attachment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Upload rejected: {0}")]
    Rejected(String),

    #[error("Upload interrupted: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unknown conversation {0}")]
    UnknownConversation(String),

    #[error("No placeholder {0} in this conversation")]
    UnknownPlaceholder(LocalId),

    #[error("Placeholder {local_id} is {from:?}, cannot become {to:?}")]
    InvalidTransition {
        local_id: LocalId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
}

/// Everything a send can fail with, as seen by the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Append(#[from] AppendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Item {0} already has an append in flight")]
    AlreadyInFlight(LocalId),

    #[error("Outbound queue for this conversation has shut down")]
    QueueClosed,
}
