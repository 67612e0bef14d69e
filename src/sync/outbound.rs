// Outbound message queue
// Turns drafts into ordered log appends, one submission worker per conversation

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};

use crate::models::{Attachment, ConversationId, Draft, LocalId, Message, MessageBody, OutboundItem};
use super::backend::{ContentStore, RemoteLog};
use super::store::ConversationStore;
use super::{AppendError, SendError, StoreError, ValidationError, MAX_ATTACHMENT_BYTES};

/// How transient append failures are retried. Rejections are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per submission, including the first.
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no automatic retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
        }
    }
}

type Outcome = Result<Message, SendError>;

/// Returned by a successful submission. The placeholder is already visible;
/// the outcome resolves once the append finishes.
pub struct SendTicket {
    item: OutboundItem,
    outcome: oneshot::Receiver<Outcome>,
}

impl SendTicket {
    pub fn item(&self) -> &OutboundItem {
        &self.item
    }

    pub fn local_id(&self) -> &LocalId {
        &self.item.local_id
    }

    /// Wait for the append. `Ok` carries the committed message as the log
    /// returned it; the store only changes when the echo arrives.
    pub async fn outcome(self) -> Outcome {
        self.outcome.await.unwrap_or(Err(SendError::QueueClosed))
    }
}

struct Job {
    item: OutboundItem,
    reply: oneshot::Sender<Outcome>,
}

#[derive(Debug, Clone)]
struct Tracked {
    item: OutboundItem,
    in_flight: bool,
}

/// Items owned by the queue until they commit or the caller discards them.
type TrackedItems = Arc<TokioMutex<HashMap<LocalId, Tracked>>>;

type Workers = Arc<TokioMutex<HashMap<ConversationId, mpsc::Sender<Job>>>>;

const WORKER_IDLE: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct OutboundQueue {
    remote: Arc<dyn RemoteLog>,
    content: Arc<dyn ContentStore>,
    store: ConversationStore,
    workers: Workers,
    items: TrackedItems,
    policy: RetryPolicy,
    max_attachment_bytes: usize,
    worker_idle: Duration,
}

impl OutboundQueue {
    pub fn new(remote: Arc<dyn RemoteLog>, content: Arc<dyn ContentStore>, store: ConversationStore) -> Self {
        Self {
            remote,
            content,
            store,
            workers: Arc::new(TokioMutex::new(HashMap::new())),
            items: Arc::new(TokioMutex::new(HashMap::new())),
            policy: RetryPolicy::default(),
            max_attachment_bytes: MAX_ATTACHMENT_BYTES,
            worker_idle: WORKER_IDLE,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_attachment_bytes(mut self, limit: usize) -> Self {
        self.max_attachment_bytes = limit;
        self
    }

    /// How long a conversation's worker waits for work before retiring.
    pub fn with_worker_idle(mut self, idle: Duration) -> Self {
        self.worker_idle = idle;
        self
    }

    fn validate(body: &MessageBody) -> Result<(), ValidationError> {
        match body {
            MessageBody::Text { text } if text.trim().is_empty() => Err(ValidationError::EmptyMessage),
            MessageBody::Image { content, .. } | MessageBody::File { content, .. } if content.0.is_empty() => {
                Err(ValidationError::MissingContent)
            }
            _ => Ok(()),
        }
    }

    /// Show the draft as pending and queue its append.
    pub async fn send(&self, conversation_id: &str, draft: Draft) -> Result<SendTicket, SendError> {
        Self::validate(&draft.body)?;

        let item = OutboundItem::new(conversation_id, draft);
        info!(
            "Sending {:?} message {} to {}",
            item.draft.body.kind(),
            item.local_id,
            conversation_id
        );
        self.store.append_local_pending(conversation_id, &item).await;
        self.submit(item).await
    }

    /// Upload a raw file, then send it as an image or file message.
    ///
    /// The size cap is checked before anything else; an upload failure is
    /// terminal and leaves no placeholder behind.
    pub async fn send_attachment(
        &self,
        conversation_id: &str,
        sender_id: &str,
        attachment: Attachment,
    ) -> Result<SendTicket, SendError> {
        let size = attachment.bytes.len();
        if size > self.max_attachment_bytes {
            warn!(
                "Rejecting {} ({} bytes) for {}: over the {} byte limit",
                attachment.file_name, size, conversation_id, self.max_attachment_bytes
            );
            return Err(ValidationError::AttachmentTooLarge {
                size,
                limit: self.max_attachment_bytes,
            }
            .into());
        }

        let is_image = attachment.is_image();
        let content = match self.content.upload(attachment.bytes, &attachment.content_type).await {
            Ok(content) => content,
            Err(e) => {
                error!("Upload of {} failed: {}", attachment.file_name, e);
                return Err(e.into());
            }
        };
        debug!("Uploaded {} as {}", attachment.file_name, content);

        let body = if is_image {
            MessageBody::Image {
                content,
                name: attachment.file_name,
            }
        } else {
            MessageBody::File {
                content,
                name: attachment.file_name,
            }
        };
        self.send(
            conversation_id,
            Draft {
                sender_id: sender_id.to_string(),
                body,
            },
        )
        .await
    }

    /// Resubmit a failed item with its original correlation id.
    pub async fn retry(&self, conversation_id: &str, local_id: &LocalId) -> Result<SendTicket, SendError> {
        let item = {
            let mut items = self.items.lock().await;
            let tracked = items
                .get_mut(local_id)
                .filter(|t| t.item.conversation_id == conversation_id)
                .ok_or_else(|| StoreError::UnknownPlaceholder(local_id.clone()))?;
            if tracked.in_flight {
                return Err(SendError::AlreadyInFlight(local_id.clone()));
            }
            // Claimed under the lock so concurrent retries submit once
            tracked.in_flight = true;
            tracked.item.clone()
        };

        if let Err(e) = self.store.mark_pending(conversation_id, local_id).await {
            let mut items = self.items.lock().await;
            if matches!(e, StoreError::UnknownPlaceholder(_)) {
                info!("{} was already committed, nothing to retry", local_id);
                items.remove(local_id);
            } else if let Some(tracked) = items.get_mut(local_id) {
                tracked.in_flight = false;
            }
            return Err(e.into());
        }
        info!("Retrying {} in {}", local_id, conversation_id);
        self.submit(item).await
    }

    /// Drop a failed item for good.
    pub async fn discard(&self, conversation_id: &str, local_id: &LocalId) -> Result<(), SendError> {
        // Held across the store call so a retry cannot start in between
        let mut items = self.items.lock().await;
        if let Some(tracked) = items.get(local_id) {
            if tracked.in_flight {
                return Err(SendError::AlreadyInFlight(local_id.clone()));
            }
        }

        match self.store.discard(conversation_id, local_id).await {
            Ok(()) => {
                items.remove(local_id);
                Ok(())
            }
            Err(e) => {
                let tracked_here = items
                    .get(local_id)
                    .map(|t| t.item.conversation_id == conversation_id)
                    .unwrap_or(false);
                if tracked_here && matches!(e, StoreError::UnknownPlaceholder(_)) {
                    info!("{} was already committed, nothing to discard", local_id);
                    items.remove(local_id);
                }
                Err(e.into())
            }
        }
    }

    /// Items not committed yet, including failed ones awaiting a decision.
    pub async fn outstanding(&self) -> Vec<OutboundItem> {
        self.release_reconciled().await;
        let items = self.items.lock().await;
        let mut outstanding: Vec<OutboundItem> = items.values().map(|t| t.item.clone()).collect();
        outstanding.sort_by_key(|item| item.created_at);
        outstanding
    }

    pub async fn is_in_flight(&self, local_id: &LocalId) -> bool {
        self.items
            .lock()
            .await
            .get(local_id)
            .map(|t| t.in_flight)
            .unwrap_or(false)
    }

    /// Conversations with a live submission worker.
    pub async fn active_workers(&self) -> usize {
        self.workers.lock().await.values().filter(|tx| !tx.is_closed()).count()
    }

    /// Forget idle items whose placeholder the store has already replaced.
    /// This happens when an append committed but its acknowledgement was lost.
    async fn release_reconciled(&self) {
        let idle: Vec<OutboundItem> = self
            .items
            .lock()
            .await
            .values()
            .filter(|t| !t.in_flight)
            .map(|t| t.item.clone())
            .collect();

        let mut reconciled = Vec::new();
        for item in idle {
            if self.store.placeholder(&item.conversation_id, &item.local_id).await.is_none() {
                reconciled.push(item.local_id);
            }
        }
        if reconciled.is_empty() {
            return;
        }

        let mut items = self.items.lock().await;
        for local_id in reconciled {
            if items.get(&local_id).map(|t| !t.in_flight).unwrap_or(false) {
                info!("{} committed despite a failed append, releasing it", local_id);
                items.remove(&local_id);
            }
        }
    }

    async fn worker(&self, conversation_id: &str) -> mpsc::Sender<Job> {
        let mut workers = self.workers.lock().await;
        if let Some(tx) = workers.get(conversation_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel(100);
        let worker = Worker {
            conversation_id: conversation_id.to_string(),
            remote: self.remote.clone(),
            store: self.store.clone(),
            items: self.items.clone(),
            workers: self.workers.clone(),
            policy: self.policy,
            idle: self.worker_idle,
        };
        tokio::spawn(worker.run(rx));
        debug!("Started outbound worker for {}", conversation_id);
        workers.insert(conversation_id.to_string(), tx.clone());
        tx
    }

    async fn submit(&self, item: OutboundItem) -> Result<SendTicket, SendError> {
        let conversation_id = item.conversation_id.clone();
        let local_id = item.local_id.clone();
        self.items.lock().await.insert(
            local_id.clone(),
            Tracked {
                item: item.clone(),
                in_flight: true,
            },
        );

        let (reply, outcome) = oneshot::channel();
        let mut job = Job {
            item: item.clone(),
            reply,
        };
        let mut resent = false;
        loop {
            let tx = self.worker(&conversation_id).await;
            match tx.send(job).await {
                Ok(()) => return Ok(SendTicket { item, outcome }),
                // The worker retired between lookup and send
                Err(mpsc::error::SendError(returned)) if !resent => {
                    resent = true;
                    job = returned;
                }
                Err(_) => break,
            }
        }

        error!("Outbound worker for {} is gone", conversation_id);
        if let Some(tracked) = self.items.lock().await.get_mut(&local_id) {
            tracked.in_flight = false;
        }
        if let Err(e) = self.store.mark_failed(&conversation_id, &local_id).await {
            warn!("Could not mark {} failed: {}", local_id, e);
        }
        Err(SendError::QueueClosed)
    }
}

/// Submission worker for one conversation.
struct Worker {
    conversation_id: ConversationId,
    remote: Arc<dyn RemoteLog>,
    store: ConversationStore,
    items: TrackedItems,
    workers: Workers,
    policy: RetryPolicy,
    idle: Duration,
}

impl Worker {
    /// Submit jobs strictly in the order they were queued. Retires after
    /// `idle` without work; the next submission starts a fresh worker.
    async fn run(self, mut rx: mpsc::Receiver<Job>) {
        loop {
            match tokio::time::timeout(self.idle, rx.recv()).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => break,
                Err(_) => {
                    // No successor can start while the map is locked
                    let mut workers = self.workers.lock().await;
                    rx.close();
                    while let Ok(job) = rx.try_recv() {
                        self.process(job).await;
                    }
                    workers.remove(&self.conversation_id);
                    debug!("Outbound worker for {} retired", self.conversation_id);
                    return;
                }
            }
        }
        debug!("Outbound worker for {} stopped", self.conversation_id);
    }

    async fn process(&self, job: Job) {
        let Job { item, reply } = job;
        let outcome = match append_with_retry(self.remote.as_ref(), &item, self.policy).await {
            Ok(committed) => {
                info!("{} committed as {} in {}", item.local_id, committed.id, self.conversation_id);
                self.items.lock().await.remove(&item.local_id);
                Ok(committed)
            }
            Err(e) => {
                error!("Append of {} to {} failed: {}", item.local_id, self.conversation_id, e);
                if let Some(tracked) = self.items.lock().await.get_mut(&item.local_id) {
                    tracked.in_flight = false;
                }
                match self.store.mark_failed(&self.conversation_id, &item.local_id).await {
                    Ok(()) => {}
                    // The echo got here first: the append did commit
                    Err(StoreError::UnknownPlaceholder(_)) => {
                        info!("{} already reconciled, releasing it", item.local_id);
                        self.items.lock().await.remove(&item.local_id);
                    }
                    Err(store_err) => warn!("Could not mark {} failed: {}", item.local_id, store_err),
                }
                Err(SendError::Append(e))
            }
        };
        if reply.send(outcome).is_err() {
            debug!("Nobody waiting on {}", item.local_id);
        }
    }
}

async fn append_with_retry(
    remote: &dyn RemoteLog,
    item: &OutboundItem,
    policy: RetryPolicy,
) -> Result<Message, AppendError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match remote.append(&item.conversation_id, item.to_new_message()).await {
            Ok(committed) => return Ok(committed),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    "Append of {} failed ({}), attempt {}/{}; retrying in {}ms",
                    item.local_id, e, attempt, attempts, policy.backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(policy.backoff_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentRef, DeliveryStatus, NewMessage};
    use crate::sync::backend::{FeedId, RemoteFeed};
    use crate::sync::memory::{AppendFault, InMemoryBackend};
    use crate::sync::TransportError;
    use async_trait::async_trait;

    /// Appends wait until the test opens the gate, when one is set.
    struct GatedLog {
        inner: InMemoryBackend,
        gate: TokioMutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl RemoteLog for GatedLog {
        async fn subscribe(&self, conversation_id: &str) -> Result<RemoteFeed, TransportError> {
            self.inner.subscribe(conversation_id).await
        }

        async fn unsubscribe(&self, feed_id: FeedId) {
            self.inner.unsubscribe(feed_id).await
        }

        async fn append(&self, conversation_id: &str, message: NewMessage) -> Result<Message, AppendError> {
            let gate = self.gate.lock().await.take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            self.inner.append(conversation_id, message).await
        }
    }

    /// Commits every append, then reports the acknowledgement as lost.
    struct LostAck(InMemoryBackend);

    #[async_trait]
    impl RemoteLog for LostAck {
        async fn subscribe(&self, conversation_id: &str) -> Result<RemoteFeed, TransportError> {
            self.0.subscribe(conversation_id).await
        }

        async fn unsubscribe(&self, feed_id: FeedId) {
            self.0.unsubscribe(feed_id).await
        }

        async fn append(&self, conversation_id: &str, message: NewMessage) -> Result<Message, AppendError> {
            self.0.append(conversation_id, message).await?;
            Err(AppendError::Transport(TransportError::Disconnected("ack lost".to_string())))
        }
    }

    fn lost_ack_queue(backend: &InMemoryBackend, store: &ConversationStore) -> OutboundQueue {
        OutboundQueue::new(
            Arc::new(LostAck(backend.clone())),
            Arc::new(backend.clone()),
            store.clone(),
        )
        .with_retry_policy(RetryPolicy::none())
    }

    fn queue(backend: &InMemoryBackend, store: &ConversationStore) -> OutboundQueue {
        let backend = Arc::new(backend.clone());
        OutboundQueue::new(backend.clone(), backend, store.clone()).with_retry_policy(RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
        })
    }

    #[tokio::test]
    async fn test_empty_text_is_rejected_before_anything() {
        let backend = InMemoryBackend::new();
        let (store, _rx) = ConversationStore::new();
        let queue = queue(&backend, &store);

        let result = queue.send("c1", Draft::text("me", "   ")).await;
        assert!(matches!(result, Err(SendError::Validation(ValidationError::EmptyMessage))));
        assert!(store.view("c1").await.is_empty());
        assert_eq!(backend.append_calls().await, 0);
    }

    #[tokio::test]
    async fn test_missing_content_ref_is_rejected() {
        let backend = InMemoryBackend::new();
        let (store, _rx) = ConversationStore::new();
        let queue = queue(&backend, &store);

        let draft = Draft {
            sender_id: "me".to_string(),
            body: MessageBody::File {
                content: ContentRef(String::new()),
                name: "notes.txt".to_string(),
            },
        };
        let result = queue.send("c1", draft).await;
        assert!(matches!(result, Err(SendError::Validation(ValidationError::MissingContent))));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = InMemoryBackend::new();
        backend.push_append_fault(AppendFault::Drop).await;
        backend.push_append_fault(AppendFault::Drop).await;
        let (store, _rx) = ConversationStore::new();
        let queue = queue(&backend, &store);

        let ticket = queue.send("c1", Draft::text("me", "eventually")).await.unwrap();
        let committed = ticket.outcome().await.unwrap();

        assert_eq!(committed.body, MessageBody::text("eventually"));
        assert_eq!(backend.append_calls().await, 3);
        assert!(queue.outstanding().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_is_terminal_and_marks_failed() {
        let backend = InMemoryBackend::new();
        backend.push_append_fault(AppendFault::Reject("policy".to_string())).await;
        let (store, _rx) = ConversationStore::new();
        let queue = queue(&backend, &store);

        let ticket = queue.send("c1", Draft::text("me", "nope")).await.unwrap();
        let local_id = ticket.local_id().clone();
        let result = ticket.outcome().await;

        assert_eq!(
            result,
            Err(SendError::Append(AppendError::Rejected("policy".to_string())))
        );
        assert_eq!(backend.append_calls().await, 1);
        let placeholder = store.placeholder("c1", &local_id).await.unwrap();
        assert_eq!(placeholder.delivery_status, DeliveryStatus::Failed);
        assert!(!queue.is_in_flight(&local_id).await);
    }

    #[tokio::test]
    async fn test_manual_retry_reuses_correlation_id() {
        let backend = InMemoryBackend::new();
        backend.set_offline(true).await;
        let (store, _rx) = ConversationStore::new();
        let queue = queue(&backend, &store).with_retry_policy(RetryPolicy::none());

        let ticket = queue.send("c1", Draft::text("me", "later")).await.unwrap();
        let item = ticket.item().clone();
        assert!(ticket.outcome().await.is_err());

        backend.set_offline(false).await;
        let retried = queue.retry("c1", &item.local_id).await.unwrap();
        assert_eq!(retried.item().correlation_id, item.correlation_id);
        let committed = retried.outcome().await.unwrap();
        assert_eq!(committed.correlation_id, Some(item.correlation_id));

        let unknown = queue.retry("c1", &item.local_id).await;
        assert!(matches!(unknown, Err(SendError::Store(StoreError::UnknownPlaceholder(_)))));
    }

    #[tokio::test]
    async fn test_discard_failed_item() {
        let backend = InMemoryBackend::new();
        backend.set_offline(true).await;
        let (store, _rx) = ConversationStore::new();
        let queue = queue(&backend, &store).with_retry_policy(RetryPolicy::none());

        let ticket = queue.send("c1", Draft::text("me", "gone")).await.unwrap();
        let local_id = ticket.local_id().clone();
        let _ = ticket.outcome().await;

        queue.discard("c1", &local_id).await.unwrap();
        assert!(store.view("c1").await.is_empty());
        assert!(queue.outstanding().await.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_item_cannot_be_retried_or_discarded() {
        let backend = InMemoryBackend::new();
        let (open, gate) = oneshot::channel();
        let log = Arc::new(GatedLog {
            inner: backend.clone(),
            gate: TokioMutex::new(Some(gate)),
        });
        let (store, _rx) = ConversationStore::new();
        let queue = OutboundQueue::new(log, Arc::new(backend.clone()), store.clone());

        let ticket = queue.send("c1", Draft::text("me", "slow")).await.unwrap();
        let local_id = ticket.local_id().clone();
        assert!(queue.is_in_flight(&local_id).await);

        assert_eq!(
            queue.retry("c1", &local_id).await.err(),
            Some(SendError::AlreadyInFlight(local_id.clone()))
        );
        assert_eq!(
            queue.discard("c1", &local_id).await,
            Err(SendError::AlreadyInFlight(local_id.clone()))
        );
        let placeholder = store.placeholder("c1", &local_id).await.unwrap();
        assert_eq!(placeholder.delivery_status, DeliveryStatus::Pending);

        open.send(()).unwrap();
        ticket.outcome().await.unwrap();
        assert_eq!(backend.append_calls().await, 1);
        assert!(!queue.is_in_flight(&local_id).await);
    }

    #[tokio::test]
    async fn test_concurrent_retries_submit_once() {
        let backend = InMemoryBackend::new();
        backend.push_append_fault(AppendFault::Reject("first".to_string())).await;
        let log = Arc::new(GatedLog {
            inner: backend.clone(),
            gate: TokioMutex::new(None),
        });
        let (store, _rx) = ConversationStore::new();
        let queue = OutboundQueue::new(log.clone(), Arc::new(backend.clone()), store.clone());

        let ticket = queue.send("c1", Draft::text("me", "again")).await.unwrap();
        let local_id = ticket.local_id().clone();
        assert!(ticket.outcome().await.is_err());

        let (open, gate) = oneshot::channel();
        *log.gate.lock().await = Some(gate);
        let (first, second) = tokio::join!(queue.retry("c1", &local_id), queue.retry("c1", &local_id));
        let (ticket, refused) = match (first, second) {
            (Ok(ticket), Err(e)) | (Err(e), Ok(ticket)) => (ticket, e),
            _ => panic!("Expected exactly one retry to be accepted"),
        };
        assert_eq!(refused, SendError::AlreadyInFlight(local_id.clone()));

        open.send(()).unwrap();
        ticket.outcome().await.unwrap();
        assert_eq!(backend.append_calls().await, 2);
        assert_eq!(backend.appended().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_ack_is_released_once_echo_arrives() {
        let backend = InMemoryBackend::new();
        let (store, _rx) = ConversationStore::new();
        let queue = lost_ack_queue(&backend, &store);

        let ticket = queue.send("c1", Draft::text("me", "hi")).await.unwrap();
        let local_id = ticket.local_id().clone();
        assert!(ticket.outcome().await.is_err());
        assert_eq!(queue.outstanding().await.len(), 1);

        // The commit shows up on the feed after all
        store.upsert_remote("c1", backend.log("c1").await).await;

        assert!(matches!(
            queue.discard("c1", &local_id).await,
            Err(SendError::Store(StoreError::UnknownPlaceholder(_)))
        ));
        assert!(queue.outstanding().await.is_empty());
        assert!(matches!(
            queue.retry("c1", &local_id).await,
            Err(SendError::Store(StoreError::UnknownPlaceholder(_)))
        ));
        assert_eq!(backend.append_calls().await, 1);

        let view = store.view("c1").await;
        assert_eq!(view.len(), 1);
        assert!(view[0].is_committed());
    }

    #[tokio::test]
    async fn test_lost_ack_without_correlation_echo_leaves_no_duplicate() {
        let backend = InMemoryBackend::new();
        backend.set_echo_correlation(false).await;
        let (store, _rx) = ConversationStore::new();
        let queue = lost_ack_queue(&backend, &store);

        let ticket = queue.send("c1", Draft::text("me", "hi")).await.unwrap();
        let local_id = ticket.local_id().clone();
        assert!(ticket.outcome().await.is_err());
        let placeholder = store.placeholder("c1", &local_id).await.unwrap();
        assert_eq!(placeholder.delivery_status, DeliveryStatus::Failed);

        store.upsert_remote("c1", backend.log("c1").await).await;

        let view = store.view("c1").await;
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].correlation_id, None);
        assert!(view[0].is_committed());
        assert!(queue.outstanding().await.is_empty());
        assert!(queue.retry("c1", &local_id).await.is_err());
        assert_eq!(backend.appended().await.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_worker_retires_and_restarts() {
        let backend = InMemoryBackend::new();
        let (store, _rx) = ConversationStore::new();
        let queue = queue(&backend, &store).with_worker_idle(Duration::from_millis(20));

        queue.send("c1", Draft::text("me", "one")).await.unwrap().outcome().await.unwrap();
        assert_eq!(queue.active_workers().await, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.active_workers().await, 0);

        queue.send("c1", Draft::text("me", "two")).await.unwrap().outcome().await.unwrap();
        let texts: Vec<String> = backend
            .appended()
            .await
            .into_iter()
            .map(|(_, message)| message.body.preview())
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }
}
