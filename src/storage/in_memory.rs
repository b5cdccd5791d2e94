use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::provider::{StorageError, StorageProvider};
use super::record::EventStorageRecord;

// ============================================================================
// In-Memory Storage - bounded per-subscriber queues
// ============================================================================
//
// Default provider for both hub and subscriber. Records live in a lock-free
// bounded queue per (event type, subscriber id); reading a batch dequeues it,
// so there is no separate "complete" step.
//
// Nothing survives a restart. A stale queue overflows: it rejects new records
// and its subscriber is expected to be dropped. A full queue that is still
// being drained rejects new records too, but only until it makes room.
//
// Stale means either
// - full and nothing dequeued for `full_queue_stale_after` (1h), or
// - non-empty and nothing dequeued for `idle_queue_stale_after` (4h).
//
// ============================================================================

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct InMemoryStorageConfig {
    /// Hard cap per subscriber queue
    pub queue_capacity: usize,
    pub full_queue_stale_after: Duration,
    pub idle_queue_stale_after: Duration,
}

impl Default for InMemoryStorageConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            full_queue_stale_after: Duration::from_secs(60 * 60),
            idle_queue_stale_after: Duration::from_secs(4 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct QueueKey {
    event_type: String,
    subscriber_id: String,
}

struct RecordQueue {
    records: ArrayQueue<EventStorageRecord>,
    last_dequeue_ms: AtomicI64,
}

impl RecordQueue {
    fn new(capacity: usize, now: DateTime<Utc>) -> Self {
        Self {
            records: ArrayQueue::new(capacity.max(1)),
            last_dequeue_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let idle_ms = now.timestamp_millis() - self.last_dequeue_ms.load(Ordering::Acquire);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    fn is_stale(&self, now: DateTime<Utc>, config: &InMemoryStorageConfig) -> bool {
        let idle = self.idle_for(now);
        (self.records.is_full() && idle >= config.full_queue_stale_after)
            || (!self.records.is_empty() && idle >= config.idle_queue_stale_after)
    }
}

pub struct InMemoryStorage {
    queues: DashMap<QueueKey, Arc<RecordQueue>>,
    config: InMemoryStorageConfig,
    clock: Clock,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_config(InMemoryStorageConfig::default())
    }

    pub fn with_config(config: InMemoryStorageConfig) -> Self {
        Self::with_clock(config, Arc::new(Utc::now))
    }

    /// Staleness is judged against `clock`, which lets tests age a queue
    pub fn with_clock(config: InMemoryStorageConfig, clock: Clock) -> Self {
        Self {
            queues: DashMap::new(),
            config,
            clock,
        }
    }

    /// Number of records currently queued for one subscriber
    pub fn queued(&self, subscriber_id: &str, event_type: &str) -> usize {
        self.queues
            .get(&Self::key(subscriber_id, event_type))
            .map(|q| q.records.len())
            .unwrap_or(0)
    }

    fn key(subscriber_id: &str, event_type: &str) -> QueueKey {
        QueueKey {
            event_type: event_type.to_string(),
            subscriber_id: subscriber_id.to_string(),
        }
    }

    fn queue_for(&self, key: QueueKey, now: DateTime<Utc>) -> Arc<RecordQueue> {
        self.queues
            .entry(key)
            .or_insert_with(|| Arc::new(RecordQueue::new(self.config.queue_capacity, now)))
            .value()
            .clone()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    fn is_in_memory(&self) -> bool {
        true
    }

    async fn restore_subscriber_ids(&self, event_type: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .queues
            .iter()
            .filter(|entry| entry.key().event_type == event_type)
            .map(|entry| entry.key().subscriber_id.clone())
            .collect())
    }

    async fn store_events(&self, records: Vec<EventStorageRecord>) -> Result<(), StorageError> {
        let now = (self.clock)();
        let mut overflowed: Vec<String> = Vec::new();
        let mut full: Vec<String> = Vec::new();

        for record in records {
            let key = Self::key(&record.subscriber_id, &record.event_type);
            let queue = self.queue_for(key, now);

            if queue.is_stale(now, &self.config) {
                if !overflowed.contains(&record.subscriber_id) {
                    overflowed.push(record.subscriber_id);
                }
                continue;
            }

            if let Err(rejected) = queue.records.push(record) {
                if !full.contains(&rejected.subscriber_id) {
                    full.push(rejected.subscriber_id);
                }
            }
        }

        if overflowed.is_empty() && full.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Rejected { overflowed, full })
        }
    }

    async fn get_next_batch(
        &self,
        subscriber_id: &str,
        event_type: &str,
        limit: usize,
    ) -> Result<Vec<EventStorageRecord>, StorageError> {
        let Some(queue) = self
            .queues
            .get(&Self::key(subscriber_id, event_type))
            .map(|q| Arc::clone(q.value()))
        else {
            return Ok(Vec::new());
        };

        let now = (self.clock)();
        let mut batch = Vec::with_capacity(limit.min(queue.records.len()));
        let mut dequeued = false;

        while batch.len() < limit {
            let Some(record) = queue.records.pop() else { break };
            dequeued = true;

            // Expired records are dropped on the way out
            if record.is_pending_at(now) {
                batch.push(record);
            } else {
                tracing::debug!(
                    subscriber_id = %subscriber_id,
                    record_id = %record.record_id,
                    "Dropping expired record"
                );
            }
        }

        if dequeued {
            queue.last_dequeue_ms.store(now.timestamp_millis(), Ordering::Release);
        }

        Ok(batch)
    }

    async fn mark_complete(&self, _record: &EventStorageRecord) -> Result<(), StorageError> {
        // Dequeued on read, nothing left to update
        Ok(())
    }

    async fn purge_stale(&self) -> Result<(), StorageError> {
        let now = (self.clock)();
        let mut purged = 0usize;

        // Stale queues are drained rather than removed so a concurrent writer
        // never pushes into a queue that is no longer reachable.
        for entry in self.queues.iter() {
            if entry.value().is_stale(now, &self.config) {
                while entry.value().records.pop().is_some() {
                    purged += 1;
                }
                tracing::warn!(
                    subscriber_id = %entry.key().subscriber_id,
                    event_type = %entry.key().event_type,
                    "Drained stale subscriber queue"
                );
            }
        }

        if purged > 0 {
            tracing::info!(purged = purged, "In-memory purge complete");
        }

        Ok(())
    }
}
