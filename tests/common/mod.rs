// Common test utilities for integration tests
// Wires the sync components over the in-memory backend

#![allow(dead_code)]

use std::sync::{Arc, Once};

use anyhow::Result;
use chrono::{TimeZone, Utc};
use log::{info, LevelFilter};
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration as TokioDuration};

use parley::models::{DeliveryStatus, Message, MessageBody};
use parley::sync::{
    ConversationStore, InMemoryBackend, OutboundQueue, RetryPolicy, SyncEvent, SyncSubscription, ViewUpdate,
};

pub const SELF_ID: &str = "current-user";

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// One client's worth of components sharing a backend.
pub struct TestClient {
    pub backend: InMemoryBackend,
    pub store: ConversationStore,
    pub views: Receiver<ViewUpdate>,
    pub sync: SyncSubscription,
    pub events: Receiver<SyncEvent>,
    pub queue: OutboundQueue,
}

impl TestClient {
    pub fn new(backend: InMemoryBackend, policy: RetryPolicy) -> Self {
        let remote = Arc::new(backend.clone());
        let (store, views) = ConversationStore::new();
        let (sync, events) = SyncSubscription::new(remote.clone(), store.clone());
        let queue = OutboundQueue::new(remote.clone(), remote, store.clone()).with_retry_policy(policy);
        TestClient {
            backend,
            store,
            views,
            sync,
            events,
            queue,
        }
    }
}

/// Client with no automatic retries, so failures surface immediately.
pub fn setup_test_client() -> TestClient {
    setup_logging();
    TestClient::new(InMemoryBackend::new(), RetryPolicy::none())
}

/// A committed message as the log would deliver it.
pub fn committed(id: &str, conversation_id: &str, sender_id: &str, text: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        body: MessageBody::text(text),
        timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        delivery_status: DeliveryStatus::Committed,
        correlation_id: None,
    }
}

pub fn texts(view: &[Message]) -> Vec<String> {
    view.iter().map(|m| m.body.preview()).collect()
}

/// Wait for a view update matching the predicate.
pub async fn wait_for_update(
    views: &mut Receiver<ViewUpdate>,
    predicate: impl Fn(&ViewUpdate) -> bool,
    timeout_secs: u64,
) -> Result<ViewUpdate> {
    info!("Waiting for view update...");
    match timeout(TokioDuration::from_secs(timeout_secs), async {
        while let Some(update) = views.recv().await {
            if predicate(&update) {
                return Ok(update);
            }
        }
        Err(anyhow::anyhow!("View receiver closed"))
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("Timed out waiting for view update")),
    }
}

/// Wait for a sync event matching the predicate.
pub async fn wait_for_event(
    events: &mut Receiver<SyncEvent>,
    predicate: impl Fn(&SyncEvent) -> bool,
    timeout_secs: u64,
) -> Result<SyncEvent> {
    match timeout(TokioDuration::from_secs(timeout_secs), async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Ok(event);
            }
        }
        Err(anyhow::anyhow!("Event receiver closed"))
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("Timed out waiting for sync event")),
    }
}

/// True once every message in the update is committed and there are `count`.
pub fn settled(conversation_id: &str, count: usize) -> impl Fn(&ViewUpdate) -> bool + '_ {
    move |update| {
        update.conversation_id == conversation_id
            && update.messages.len() == count
            && update.messages.iter().all(|m| m.is_committed())
    }
}
