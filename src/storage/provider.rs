use async_trait::async_trait;

use super::record::EventStorageRecord;

// ============================================================================
// Storage Provider - persistence contract for hub and subscriber queues
// ============================================================================
//
// One trait serves both sides of the wire:
// - Hub side: one queue per (event type, remote subscriber id)
// - Subscriber side: one queue per (event type, local subscriber id)
//
// Providers must be safe to call concurrently from the producer and consumer
// loops of every event type that shares them.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Some queues refused their record. Only the in-memory provider raises
    /// this; every record of the call addressed to a subscriber in neither
    /// list was stored.
    ///
    /// - `overflowed`: stale queues, their subscribers should be dropped
    /// - `full`: at capacity but still draining, store those records again later
    #[error("queues rejected records (overflowed: {overflowed:?}, full: {full:?})")]
    Rejected { overflowed: Vec<String>, full: Vec<String> },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("record serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn backend(error: impl std::fmt::Display) -> Self {
        StorageError::Backend(error.to_string())
    }

    /// True when the records of `subscriber_id` from the failed call were not stored
    pub fn rejects(&self, subscriber_id: &str) -> bool {
        match self {
            StorageError::Rejected { overflowed, full } => {
                overflowed.iter().chain(full).any(|id| id == subscriber_id)
            }
            _ => true,
        }
    }
}

#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    /// True for providers that dequeue on read.
    ///
    /// Callers use this to pick the completion strategy: records fetched from
    /// an in-memory provider are already gone, so a failed delivery has to
    /// store them again, and there is nothing to mark complete.
    fn is_in_memory(&self) -> bool {
        false
    }

    /// Subscriber ids that have records for `event_type`. Called once at hub startup.
    async fn restore_subscriber_ids(&self, event_type: &str) -> Result<Vec<String>, StorageError>;

    async fn store_events(&self, records: Vec<EventStorageRecord>) -> Result<(), StorageError>;

    /// Up to `limit` pending, non-expired records for one subscriber queue
    async fn get_next_batch(
        &self,
        subscriber_id: &str,
        event_type: &str,
        limit: usize,
    ) -> Result<Vec<EventStorageRecord>, StorageError>;

    /// Marking an already complete record again must have no further effect
    async fn mark_complete(&self, record: &EventStorageRecord) -> Result<(), StorageError>;

    /// Drops completed and expired records
    async fn purge_stale(&self) -> Result<(), StorageError>;
}
