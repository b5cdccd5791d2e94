// ============================================================================
// Storage - durable record queues behind the hub and the subscribers
// ============================================================================
//
// - record:    EventStorageRecord envelope
// - provider:  StorageProvider contract and StorageError
// - in_memory: default bounded per-subscriber queues
// - scylla_storage: durable ScyllaDB provider
//
// ============================================================================

pub mod in_memory;
pub mod provider;
pub mod record;
pub mod scylla_storage;

pub use in_memory::{Clock, InMemoryStorage, InMemoryStorageConfig};
pub use provider::{StorageError, StorageProvider};
pub use record::EventStorageRecord;
pub use scylla_storage::ScyllaStorage;
