// In-process backend implementing the remote log, content store and roster
// Used by the console driver and by tests; supports fault injection

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use uuid::Uuid;

use crate::models::{Contact, ContentRef, DeliveryStatus, Message, MessageBody, NewMessage};
use super::backend::{ContentStore, FeedId, RemoteEvent, RemoteFeed, RemoteLog, RosterSource};
use super::{AppendError, TransportError, UploadError};

const FEED_BUFFER: usize = 64;

/// Scripted failure for the next append.
#[derive(Debug, Clone)]
pub enum AppendFault {
    Reject(String),
    Drop,
}

#[derive(Default)]
struct BackendState {
    logs: HashMap<String, Vec<Message>>,
    feeds: HashMap<FeedId, (String, mpsc::Sender<RemoteEvent>)>,
    next_feed: FeedId,
    next_message: u64,
    append_faults: VecDeque<AppendFault>,
    appended: Vec<(String, NewMessage)>,
    append_calls: usize,
    uploads: HashMap<String, (String, Vec<u8>)>,
    upload_calls: usize,
    upload_fault: Option<String>,
    offline: bool,
    echo_correlation: bool,
    roster: Vec<Contact>,
    roster_subscribers: Vec<mpsc::Sender<Vec<Contact>>>,
}

/// Reference backend keeping everything in memory.
///
/// Commit timestamps are monotonic per conversation and correlation ids are
/// echoed back unless disabled with [`InMemoryBackend::set_echo_correlation`].
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<TokioMutex<BackendState>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let state = BackendState {
            echo_correlation: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(TokioMutex::new(state)),
        }
    }

    fn unavailable() -> TransportError {
        TransportError::Unavailable("backend offline".to_string())
    }

    fn feed_senders(state: &BackendState, conversation_id: &str) -> Vec<mpsc::Sender<RemoteEvent>> {
        state
            .feeds
            .values()
            .filter(|(conversation, _)| conversation == conversation_id)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    async fn broadcast(senders: Vec<mpsc::Sender<RemoteEvent>>, event: RemoteEvent) {
        for tx in senders {
            if tx.send(event.clone()).await.is_err() {
                debug!("Feed receiver gone, skipping");
            }
        }
    }

    fn commit(state: &mut BackendState, conversation_id: &str, message: NewMessage) -> Message {
        let log = state.logs.entry(conversation_id.to_string()).or_default();
        let now = Utc::now();
        let timestamp: DateTime<Utc> = match log.last() {
            Some(last) if last.timestamp >= now => last.timestamp + Duration::milliseconds(1),
            _ => now,
        };
        state.next_message += 1;
        let committed = Message {
            id: format!("m{:08}", state.next_message),
            conversation_id: conversation_id.to_string(),
            sender_id: message.sender_id,
            body: message.body,
            timestamp,
            delivery_status: DeliveryStatus::Committed,
            correlation_id: if state.echo_correlation {
                Some(message.correlation_id)
            } else {
                None
            },
        };
        log.push(committed.clone());
        committed
    }

    /// Write a message as another client would, bypassing fault injection.
    pub async fn commit_external(&self, conversation_id: &str, sender_id: &str, body: MessageBody) -> Message {
        let (committed, senders, snapshot) = {
            let mut state = self.state.lock().await;
            let committed = Self::commit(
                &mut state,
                conversation_id,
                NewMessage {
                    sender_id: sender_id.to_string(),
                    body,
                    correlation_id: Default::default(),
                },
            );
            let snapshot = state.logs.get(conversation_id).cloned().unwrap_or_default();
            (committed, Self::feed_senders(&state, conversation_id), snapshot)
        };
        Self::broadcast(senders, RemoteEvent::Snapshot(snapshot)).await;
        committed
    }

    /// Break every feed of a conversation with a transport error.
    pub async fn fail_feeds(&self, conversation_id: &str, reason: &str) {
        let senders = {
            let mut state = self.state.lock().await;
            let senders = Self::feed_senders(&state, conversation_id);
            state.feeds.retain(|_, (conversation, _)| conversation != conversation_id);
            senders
        };
        warn!("Failing {} feeds for {}", senders.len(), conversation_id);
        Self::broadcast(senders, RemoteEvent::Error(TransportError::Disconnected(reason.to_string()))).await;
    }

    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
        info!("In-memory backend is now {}", if offline { "offline" } else { "online" });
    }

    pub async fn set_echo_correlation(&self, echo: bool) {
        self.state.lock().await.echo_correlation = echo;
    }

    /// Queue a failure for an upcoming append. Faults are consumed in order.
    pub async fn push_append_fault(&self, fault: AppendFault) {
        self.state.lock().await.append_faults.push_back(fault);
    }

    pub async fn fail_next_upload(&self, reason: &str) {
        self.state.lock().await.upload_fault = Some(reason.to_string());
    }

    /// Every append that reached the log, in arrival order.
    pub async fn appended(&self) -> Vec<(String, NewMessage)> {
        self.state.lock().await.appended.clone()
    }

    pub async fn append_calls(&self) -> usize {
        self.state.lock().await.append_calls
    }

    pub async fn upload_calls(&self) -> usize {
        self.state.lock().await.upload_calls
    }

    pub async fn log(&self, conversation_id: &str) -> Vec<Message> {
        self.state.lock().await.logs.get(conversation_id).cloned().unwrap_or_default()
    }

    /// Content type and bytes behind an uploaded reference.
    pub async fn content(&self, content: &ContentRef) -> Option<(String, Vec<u8>)> {
        self.state.lock().await.uploads.get(&content.0).cloned()
    }

    pub async fn open_feeds(&self) -> usize {
        self.state.lock().await.feeds.len()
    }

    /// Replace the roster and push it to every roster subscriber.
    pub async fn set_roster(&self, roster: Vec<Contact>) {
        let subscribers = {
            let mut state = self.state.lock().await;
            state.roster = roster.clone();
            state.roster_subscribers.retain(|tx| !tx.is_closed());
            state.roster_subscribers.clone()
        };
        for tx in subscribers {
            let _ = tx.send(roster.clone()).await;
        }
    }
}

#[async_trait]
impl RemoteLog for InMemoryBackend {
    async fn subscribe(&self, conversation_id: &str) -> Result<RemoteFeed, TransportError> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let (id, snapshot) = {
            let mut state = self.state.lock().await;
            if state.offline {
                return Err(Self::unavailable());
            }
            state.next_feed += 1;
            let id = state.next_feed;
            state.feeds.insert(id, (conversation_id.to_string(), tx.clone()));
            (id, state.logs.get(conversation_id).cloned().unwrap_or_default())
        };
        debug!("Feed {} subscribed to {}", id, conversation_id);
        // Initial snapshot, like a fresh listener would get
        let _ = tx.send(RemoteEvent::Snapshot(snapshot)).await;
        Ok(RemoteFeed { id, events: rx })
    }

    async fn unsubscribe(&self, feed_id: FeedId) {
        if self.state.lock().await.feeds.remove(&feed_id).is_some() {
            debug!("Feed {} unsubscribed", feed_id);
        }
    }

    async fn append(&self, conversation_id: &str, message: NewMessage) -> Result<Message, AppendError> {
        let (committed, senders, snapshot) = {
            let mut state = self.state.lock().await;
            state.append_calls += 1;
            if state.offline {
                return Err(AppendError::Transport(Self::unavailable()));
            }
            match state.append_faults.pop_front() {
                Some(AppendFault::Reject(reason)) => return Err(AppendError::Rejected(reason)),
                Some(AppendFault::Drop) => {
                    return Err(AppendError::Transport(TransportError::Disconnected(
                        "append dropped".to_string(),
                    )))
                }
                None => {}
            }
            state.appended.push((conversation_id.to_string(), message.clone()));
            let committed = Self::commit(&mut state, conversation_id, message);
            let snapshot = state.logs.get(conversation_id).cloned().unwrap_or_default();
            (committed, Self::feed_senders(&state, conversation_id), snapshot)
        };
        Self::broadcast(senders, RemoteEvent::Snapshot(snapshot)).await;
        Ok(committed)
    }
}

#[async_trait]
impl ContentStore for InMemoryBackend {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<ContentRef, UploadError> {
        let mut state = self.state.lock().await;
        state.upload_calls += 1;
        if state.offline {
            return Err(UploadError::Transport(Self::unavailable()));
        }
        if let Some(reason) = state.upload_fault.take() {
            return Err(UploadError::Rejected(reason));
        }
        let key = format!("mem://content/{}", Uuid::new_v4());
        debug!("Stored {} bytes of {} as {}", bytes.len(), content_type, key);
        state.uploads.insert(key.clone(), (content_type.to_string(), bytes));
        Ok(ContentRef(key))
    }
}

#[async_trait]
impl RosterSource for InMemoryBackend {
    async fn subscribe_roster(&self) -> Result<mpsc::Receiver<Vec<Contact>>, TransportError> {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let roster = {
            let mut state = self.state.lock().await;
            if state.offline {
                return Err(Self::unavailable());
            }
            state.roster_subscribers.push(tx.clone());
            state.roster.clone()
        };
        let _ = tx.send(roster).await;
        Ok(rx)
    }
}
