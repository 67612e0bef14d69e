// Re-export the public surface for the driver and integration tests
pub mod config;
pub mod models;
pub mod sync;  // Live conversation log engine

// Re-export main types for convenience
pub use models::*;
pub use sync::{
    ContactDirectory, ConversationStore, InMemoryBackend, OutboundQueue, SyncEvent, SyncSubscription, ViewUpdate,
};
