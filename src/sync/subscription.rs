// Live feeds from the remote log into the conversation store
// At most one open feed per conversation; nothing is applied after close

use futures::future::join_all;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::models::ConversationId;
use super::backend::{FeedId, RemoteEvent, RemoteLog};
use super::store::ConversationStore;
use super::TransportError;

/// Feed lifecycle notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Opened { conversation_id: ConversationId },
    /// The feed broke. It is not reopened automatically.
    FeedError {
        conversation_id: ConversationId,
        error: TransportError,
    },
    Closed { conversation_id: ConversationId },
}

#[derive(Debug)]
struct FeedGate {
    open: bool,
}

/// One live feed bound to one conversation.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    feed_id: FeedId,
    conversation_id: ConversationId,
    gate: Arc<TokioMutex<FeedGate>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub async fn is_open(&self) -> bool {
        self.gate.lock().await.open
    }
}

impl PartialEq for SubscriptionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

struct OpenFeed {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

/// Manages the live feeds of open conversations.
#[derive(Clone)]
pub struct SyncSubscription {
    remote: Arc<dyn RemoteLog>,
    store: ConversationStore,
    feeds: Arc<TokioMutex<HashMap<ConversationId, OpenFeed>>>,
    active: Arc<TokioMutex<Option<SubscriptionHandle>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    next_handle: Arc<AtomicU64>,
}

impl SyncSubscription {
    pub fn new(remote: Arc<dyn RemoteLog>, store: ConversationStore) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        (
            Self {
                remote,
                store,
                feeds: Arc::new(TokioMutex::new(HashMap::new())),
                active: Arc::new(TokioMutex::new(None)),
                event_tx,
                next_handle: Arc::new(AtomicU64::new(1)),
            },
            event_rx,
        )
    }

    fn emit(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!("Sync event not delivered: {}", e);
        }
    }

    /// Start a live feed for a conversation, closing any previous feed for
    /// the same conversation first.
    pub async fn open(&self, conversation_id: &str) -> Result<SubscriptionHandle, TransportError> {
        let previous = self.feeds.lock().await.remove(conversation_id);
        if let Some(previous) = previous {
            debug!("Replacing feed {} for {}", previous.handle.id, conversation_id);
            self.shutdown(previous).await;
        }

        let feed = self.remote.subscribe(conversation_id).await?;
        let handle = SubscriptionHandle {
            id: self.next_handle.fetch_add(1, Ordering::SeqCst),
            feed_id: feed.id,
            conversation_id: conversation_id.to_string(),
            gate: Arc::new(TokioMutex::new(FeedGate { open: true })),
        };

        let task = tokio::spawn(pump(
            handle.clone(),
            feed.events,
            self.store.clone(),
            self.event_tx.clone(),
        ));

        let replaced = self.feeds.lock().await.insert(
            conversation_id.to_string(),
            OpenFeed {
                handle: handle.clone(),
                task,
            },
        );
        if let Some(replaced) = replaced {
            warn!("Concurrent open for {}, closing feed {}", conversation_id, replaced.handle.id);
            self.shutdown(replaced).await;
        }

        info!("Opened feed {} for {}", handle.id, conversation_id);
        self.emit(SyncEvent::Opened {
            conversation_id: conversation_id.to_string(),
        });
        Ok(handle)
    }

    /// Stop delivery for a handle. Idempotent; safe after the feed errored.
    pub async fn close(&self, handle: &SubscriptionHandle) {
        let entry = {
            let mut feeds = self.feeds.lock().await;
            match feeds.get(&handle.conversation_id) {
                Some(open) if open.handle.id == handle.id => feeds.remove(&handle.conversation_id),
                _ => None,
            }
        };

        match entry {
            Some(open) => self.shutdown(open).await,
            None => {
                // Stale handle: make sure its gate is shut anyway
                Self::shut_gate(handle).await;
            }
        }
    }

    /// Close the active conversation's feed and open one for `conversation_id`.
    pub async fn switch_to(&self, conversation_id: &str) -> Result<SubscriptionHandle, TransportError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            if previous.conversation_id == conversation_id && previous.is_open().await {
                *active = Some(previous.clone());
                return Ok(previous);
            }
            self.close(&previous).await;
        }

        let handle = self.open(conversation_id).await?;
        *active = Some(handle.clone());
        Ok(handle)
    }

    /// Conversation whose feed was last opened through [`Self::switch_to`].
    pub async fn active(&self) -> Option<ConversationId> {
        self.active.lock().await.as_ref().map(|h| h.conversation_id.clone())
    }

    pub async fn is_open(&self, conversation_id: &str) -> bool {
        let handle = {
            let feeds = self.feeds.lock().await;
            feeds.get(conversation_id).map(|open| open.handle.clone())
        };
        match handle {
            Some(handle) => handle.is_open().await,
            None => false,
        }
    }

    /// Close every feed, e.g. at shutdown.
    pub async fn close_all(&self) {
        let open: Vec<OpenFeed> = self.feeds.lock().await.drain().map(|(_, open)| open).collect();
        self.active.lock().await.take();
        info!("Closing {} feeds", open.len());
        join_all(open.into_iter().map(|feed| self.shutdown(feed))).await;
    }

    /// Returns false when the gate was already shut.
    async fn shut_gate(handle: &SubscriptionHandle) -> bool {
        let mut gate = handle.gate.lock().await;
        let was_open = gate.open;
        gate.open = false;
        was_open
    }

    async fn shutdown(&self, open: OpenFeed) {
        // Waits for an in-flight delivery to finish; later ones are dropped
        let was_open = Self::shut_gate(&open.handle).await;
        open.task.abort();
        self.remote.unsubscribe(open.handle.feed_id).await;

        if was_open {
            info!("Closed feed {} for {}", open.handle.id, open.handle.conversation_id);
            self.emit(SyncEvent::Closed {
                conversation_id: open.handle.conversation_id.clone(),
            });
        }
    }
}

/// Apply feed events to the store until the feed ends, errors or is closed.
async fn pump(
    handle: SubscriptionHandle,
    mut events: mpsc::Receiver<RemoteEvent>,
    store: ConversationStore,
    event_tx: mpsc::Sender<SyncEvent>,
) {
    while let Some(event) = events.recv().await {
        let mut gate = handle.gate.lock().await;
        if !gate.open {
            debug!("Dropping event for closed feed {}", handle.id);
            return;
        }

        match event {
            RemoteEvent::Snapshot(messages) => {
                debug!(
                    "Feed {} delivered {} messages for {}",
                    handle.id,
                    messages.len(),
                    handle.conversation_id
                );
                store.upsert_remote(&handle.conversation_id, messages).await;
            }
            RemoteEvent::Error(error) => {
                warn!("Feed {} for {} failed: {}", handle.id, handle.conversation_id, error);
                // A broken feed counts as closed; reopening starts a new one
                gate.open = false;
                if let Err(e) = event_tx.try_send(SyncEvent::FeedError {
                    conversation_id: handle.conversation_id.clone(),
                    error,
                }) {
                    debug!("Feed error for {} not delivered: {}", handle.conversation_id, e);
                }
                return;
            }
        }
    }
    debug!("Feed {} for {} ended", handle.id, handle.conversation_id);
}
