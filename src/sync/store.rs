// Per-conversation ordered message cache
// Merges remote snapshots with local optimistic placeholders

use chrono::Duration;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};

use crate::models::{ConversationId, DeliveryStatus, LocalId, Message, MessageId, OutboundItem};
use super::StoreError;

/// Default window for matching an echo without correlation id to a placeholder.
pub const DEFAULT_MATCH_WINDOW_SECS: i64 = 30;

/// Current ordered view of one conversation, pushed after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewUpdate {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone)]
struct Placeholder {
    local_id: LocalId,
    message: Message,
}

#[derive(Debug, Default)]
struct ConversationLog {
    committed: HashMap<MessageId, Message>,
    // Committed messages that already replaced a placeholder
    claimed: HashSet<MessageId>,
    placeholders: Vec<Placeholder>,
    participants: BTreeSet<String>,
}

impl ConversationLog {
    fn sorted_committed(&self) -> Vec<&Message> {
        let mut committed: Vec<&Message> = self.committed.values().collect();
        committed.sort_by(|a, b| a.display_cmp(b));
        committed
    }

    /// Committed messages by (timestamp, id), then placeholders in the order
    /// they were appended.
    fn view(&self) -> Vec<Message> {
        self.sorted_committed()
            .into_iter()
            .chain(self.placeholders.iter().map(|p| &p.message))
            .cloned()
            .collect()
    }

    fn placeholder_mut(&mut self, local_id: &LocalId) -> Result<&mut Placeholder, StoreError> {
        self.placeholders
            .iter_mut()
            .find(|p| &p.local_id == local_id)
            .ok_or_else(|| StoreError::UnknownPlaceholder(local_id.clone()))
    }

    /// Drop placeholders that the committed set now reflects.
    fn reconcile(&mut self, window: Duration) {
        if self.placeholders.is_empty() {
            return;
        }

        // Echoed correlation ids win, regardless of placeholder state
        let echoed: HashMap<_, MessageId> = self
            .committed
            .values()
            .filter_map(|m| m.correlation_id.map(|c| (c, m.id.clone())))
            .collect();

        let mut claimed = Vec::new();
        self.placeholders.retain(|p| {
            let correlation = match p.message.correlation_id {
                Some(c) => c,
                None => return true,
            };
            match echoed.get(&correlation) {
                Some(message_id) => {
                    debug!("Placeholder {} committed as {}", p.local_id, message_id);
                    claimed.push(message_id.clone());
                    false
                }
                None => true,
            }
        });
        self.claimed.extend(claimed);

        // Fallback for backends that do not echo correlation ids
        let mut candidates: Vec<&Message> = self
            .committed
            .values()
            .filter(|m| m.correlation_id.is_none() && !self.claimed.contains(&m.id))
            .collect();
        candidates.sort_by(|a, b| a.display_cmp(b));

        // Failed placeholders count too: the append may have committed
        // even though its acknowledgement was lost
        let mut matched: Vec<(LocalId, MessageId)> = Vec::new();
        for p in self.placeholders.iter() {
            let hit = candidates.iter().position(|m| {
                m.sender_id == p.message.sender_id
                    && m.body == p.message.body
                    && (m.timestamp - p.message.timestamp).abs() <= window
            });
            if let Some(index) = hit {
                let message = candidates.remove(index);
                matched.push((p.local_id.clone(), message.id.clone()));
            }
        }

        for (local_id, message_id) in matched {
            debug!("Placeholder {} matched {} by content", local_id, message_id);
            self.placeholders.retain(|p| p.local_id != local_id);
            self.claimed.insert(message_id);
        }
    }
}

/// Shared handle to the per-conversation message cache.
///
/// Cloning is cheap; all clones see the same state. Every mutation pushes a
/// [`ViewUpdate`] on the channel returned by [`ConversationStore::new`].
#[derive(Clone)]
pub struct ConversationStore {
    logs: Arc<TokioMutex<HashMap<ConversationId, ConversationLog>>>,
    view_tx: mpsc::Sender<ViewUpdate>,
    match_window: Duration,
}

impl ConversationStore {
    pub fn new() -> (Self, mpsc::Receiver<ViewUpdate>) {
        Self::with_match_window(Duration::seconds(DEFAULT_MATCH_WINDOW_SECS))
    }

    pub fn with_match_window(match_window: Duration) -> (Self, mpsc::Receiver<ViewUpdate>) {
        let (view_tx, view_rx) = mpsc::channel(100);
        (
            Self {
                logs: Arc::new(TokioMutex::new(HashMap::new())),
                view_tx,
                match_window,
            },
            view_rx,
        )
    }

    fn notify(&self, conversation_id: &str, messages: Vec<Message>) {
        let update = ViewUpdate {
            conversation_id: conversation_id.to_string(),
            messages,
        };
        match self.view_tx.try_send(update) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("View channel full, dropped update for {}", conversation_id)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("No view listener for {}", conversation_id)
            }
        }
    }

    /// Explicitly create a conversation. Existing conversations only gain
    /// the given participants.
    pub async fn create_conversation(&self, conversation_id: &str, participants: &[String]) {
        let view = {
            let mut logs = self.logs.lock().await;
            let log = logs.entry(conversation_id.to_string()).or_default();
            log.participants.extend(participants.iter().cloned());
            log.view()
        };
        info!("Conversation {} created with {} participants", conversation_id, participants.len());
        self.notify(conversation_id, view);
    }

    /// Merge a remote snapshot into the conversation.
    ///
    /// Messages are keyed by id and never removed, so applying the same
    /// content twice, in other batchings or out of order, yields the same
    /// view. A committed message keeps the content it was first seen with.
    pub async fn upsert_remote(&self, conversation_id: &str, messages: Vec<Message>) {
        let view = {
            let mut logs = self.logs.lock().await;
            let log = logs.entry(conversation_id.to_string()).or_default();

            let mut added = 0usize;
            for mut message in messages {
                message.delivery_status = DeliveryStatus::Committed;
                message.conversation_id = conversation_id.to_string();
                match log.committed.get(&message.id) {
                    Some(existing) if *existing != message => {
                        warn!(
                            "Ignoring changed content for committed message {} in {}",
                            message.id, conversation_id
                        );
                    }
                    Some(_) => {}
                    None => {
                        log.participants.insert(message.sender_id.clone());
                        log.committed.insert(message.id.clone(), message);
                        added += 1;
                    }
                }
            }
            log.reconcile(self.match_window);
            debug!(
                "Snapshot for {}: {} new, {} committed, {} placeholders",
                conversation_id,
                added,
                log.committed.len(),
                log.placeholders.len()
            );
            log.view()
        };
        self.notify(conversation_id, view);
    }

    /// Show an outbound item immediately as a pending placeholder.
    pub async fn append_local_pending(&self, conversation_id: &str, item: &OutboundItem) -> LocalId {
        let view = {
            let mut logs = self.logs.lock().await;
            let log = logs.entry(conversation_id.to_string()).or_default();

            let already_known = log.placeholders.iter().any(|p| p.local_id == item.local_id);
            let already_committed = log
                .committed
                .values()
                .any(|m| m.correlation_id == Some(item.correlation_id));
            if already_known || already_committed {
                debug!("Placeholder {} already reflected in {}", item.local_id, conversation_id);
                return item.local_id.clone();
            }

            log.participants.insert(item.draft.sender_id.clone());
            log.placeholders.push(Placeholder {
                local_id: item.local_id.clone(),
                message: Message {
                    id: item.local_id.0.clone(),
                    conversation_id: conversation_id.to_string(),
                    sender_id: item.draft.sender_id.clone(),
                    body: item.draft.body.clone(),
                    timestamp: item.created_at,
                    delivery_status: DeliveryStatus::Pending,
                    correlation_id: Some(item.correlation_id),
                },
            });
            log.view()
        };
        self.notify(conversation_id, view);
        item.local_id.clone()
    }

    async fn transition(
        &self,
        conversation_id: &str,
        local_id: &LocalId,
        from: DeliveryStatus,
        to: DeliveryStatus,
    ) -> Result<(), StoreError> {
        let view = {
            let mut logs = self.logs.lock().await;
            let log = logs
                .get_mut(conversation_id)
                .ok_or_else(|| StoreError::UnknownConversation(conversation_id.to_string()))?;
            let placeholder = log.placeholder_mut(local_id)?;
            let current = placeholder.message.delivery_status;
            if current == to {
                return Ok(());
            }
            if current != from {
                return Err(StoreError::InvalidTransition {
                    local_id: local_id.clone(),
                    from: current,
                    to,
                });
            }
            placeholder.message.delivery_status = to;
            log.view()
        };
        self.notify(conversation_id, view);
        Ok(())
    }

    /// Pending → failed. The placeholder stays visible.
    pub async fn mark_failed(&self, conversation_id: &str, local_id: &LocalId) -> Result<(), StoreError> {
        self.transition(conversation_id, local_id, DeliveryStatus::Pending, DeliveryStatus::Failed)
            .await?;
        warn!("Placeholder {} in {} marked failed", local_id, conversation_id);
        Ok(())
    }

    /// Failed → pending, before a manual retry.
    pub async fn mark_pending(&self, conversation_id: &str, local_id: &LocalId) -> Result<(), StoreError> {
        self.transition(conversation_id, local_id, DeliveryStatus::Failed, DeliveryStatus::Pending)
            .await
    }

    /// Remove a failed placeholder the caller decided to drop.
    pub async fn discard(&self, conversation_id: &str, local_id: &LocalId) -> Result<(), StoreError> {
        let view = {
            let mut logs = self.logs.lock().await;
            let log = logs
                .get_mut(conversation_id)
                .ok_or_else(|| StoreError::UnknownConversation(conversation_id.to_string()))?;
            let status = log.placeholder_mut(local_id)?.message.delivery_status;
            if status != DeliveryStatus::Failed {
                return Err(StoreError::InvalidTransition {
                    local_id: local_id.clone(),
                    from: status,
                    to: DeliveryStatus::Failed,
                });
            }
            log.placeholders.retain(|p| &p.local_id != local_id);
            log.view()
        };
        info!("Discarded failed placeholder {} in {}", local_id, conversation_id);
        self.notify(conversation_id, view);
        Ok(())
    }

    /// Ordered view of a conversation. Unknown conversations are empty.
    pub async fn view(&self, conversation_id: &str) -> Vec<Message> {
        let logs = self.logs.lock().await;
        logs.get(conversation_id).map(|log| log.view()).unwrap_or_default()
    }

    /// Look up a placeholder by local id.
    pub async fn placeholder(&self, conversation_id: &str, local_id: &LocalId) -> Option<Message> {
        let logs = self.logs.lock().await;
        logs.get(conversation_id)?
            .placeholders
            .iter()
            .find(|p| &p.local_id == local_id)
            .map(|p| p.message.clone())
    }

    pub async fn participants(&self, conversation_id: &str) -> Vec<String> {
        let logs = self.logs.lock().await;
        logs.get(conversation_id)
            .map(|log| log.participants.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn conversations(&self) -> Vec<ConversationId> {
        let logs = self.logs.lock().await;
        let mut ids: Vec<ConversationId> = logs.keys().cloned().collect();
        ids.sort();
        ids
    }
}
