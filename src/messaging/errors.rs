use crate::storage::{EventStorageRecord, StorageError};

// ============================================================================
// Error Receiver - side channel for failures the loops swallow
// ============================================================================
//
// Hub and subscriber loops never stop on a failure. They log it, report it
// here, and carry on after the retry delay. Hooks are synchronous and must
// return quickly; every hook defaults to a no-op.
//
// `attempt` counts consecutive failures of the same storage operation,
// starting at 1.
//
// ============================================================================

#[allow(unused_variables)]
pub trait ErrorReceiver: Send + Sync + 'static {
    fn on_store_failure(&self, event_type: &str, records: &[EventStorageRecord], attempt: u32, error: &StorageError) {}

    fn on_retrieve_failure(&self, event_type: &str, subscriber_id: &str, attempt: u32, error: &StorageError) {}

    fn on_mark_complete_failure(&self, record: &EventStorageRecord, attempt: u32, error: &StorageError) {}

    fn on_serialize_failure(&self, event_type: &str, error: &serde_json::Error) {}

    /// The subscriber has been dropped from the hub; its queue is no longer fed
    fn on_overflow(&self, event_type: &str, subscriber_id: &str) {}

    fn on_handler_failure(&self, record: &EventStorageRecord, error: &anyhow::Error) {}

    fn on_restore_failure(&self, event_type: &str, error: &anyhow::Error) {}

    fn on_purge_failure(&self, error: &StorageError) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopErrorReceiver;

impl ErrorReceiver for NoopErrorReceiver {}
