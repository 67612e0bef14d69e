use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

pub type ConversationId = String;
pub type MessageId = String;

/// Client-generated id attached to an append and echoed back on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Id of an optimistic placeholder, only meaningful to the local store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub String);

impl LocalId {
    pub fn generate() -> Self {
        LocalId(format!("local-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to content materialized by the content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef(pub String);

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

/// Payload of a message. Image and file messages carry a content reference
/// plus the name shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageBody {
    Text { text: String },
    Image { content: ContentRef, name: String },
    File { content: ContentRef, name: String },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        MessageBody::Text { text: text.into() }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Image { .. } => MessageKind::Image,
            MessageBody::File { .. } => MessageKind::File,
        }
    }

    /// Short human readable summary, used for contact previews.
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text { text } => text.clone(),
            MessageBody::Image { name, .. } => format!("Image: {}", name),
            MessageBody::File { name, .. } => format!("File: {}", name),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,   // Shown optimistically, append not yet confirmed
    Committed, // Accepted by the remote log
    Failed,    // Append or retry gave up; kept visible
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Display order of committed messages: timestamp, then id.
    pub fn display_cmp(&self, other: &Message) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn is_committed(&self) -> bool {
        self.delivery_status == DeliveryStatus::Committed
    }
}

/// What the user asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub sender_id: String,
    pub body: MessageBody,
}

impl Draft {
    pub fn text(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Draft {
            sender_id: sender_id.into(),
            body: MessageBody::text(text),
        }
    }
}

/// A raw file picked by the user, not yet uploaded.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// A locally authored message that is not committed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundItem {
    pub local_id: LocalId,
    pub correlation_id: CorrelationId,
    pub conversation_id: ConversationId,
    pub draft: Draft,
    pub created_at: DateTime<Utc>,
}

impl OutboundItem {
    pub fn new(conversation_id: &str, draft: Draft) -> Self {
        OutboundItem {
            local_id: LocalId::generate(),
            correlation_id: CorrelationId::new(),
            conversation_id: conversation_id.to_string(),
            draft,
            created_at: Utc::now(),
        }
    }

    /// The append request the remote log receives for this item.
    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            sender_id: self.draft.sender_id.clone(),
            body: self.draft.body.clone(),
            correlation_id: self.correlation_id,
        }
    }
}

/// Append request sent to the remote log. The log assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub body: MessageBody,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub status: ContactStatus,
}

impl Contact {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Contact {
            id: id.into(),
            name: name.into(),
            avatar: None,
            last_message: String::new(),
            status: ContactStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    Online,
    #[default]
    Offline,
    Away,
}

/// Local edit of the self entry, applied before the backend confirms it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactPatch {
    pub name: Option<String>,
    pub avatar: Option<String>,
    pub last_message: Option<String>,
}
