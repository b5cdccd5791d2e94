#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use event_relay::messaging::{Event, EventHandler};
use event_relay::storage::{EventStorageRecord, StorageError, StorageProvider};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Shared fixtures for integration tests
// ============================================================================

/// Keeps records until they are marked complete, the way a database-backed
/// provider does. Fetch failures can be injected.
#[derive(Default)]
pub struct DurableMemoryStorage {
    records: Mutex<Vec<EventStorageRecord>>,
    failing_fetches: AtomicUsize,
    pub mark_complete_calls: AtomicUsize,
}

impl DurableMemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` calls to get_next_batch fail
    pub fn fail_next_fetches(&self, count: usize) {
        self.failing_fetches.store(count, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<EventStorageRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn pending(&self) -> usize {
        let now = Utc::now();
        self.records.lock().unwrap().iter().filter(|r| r.is_pending_at(now)).count()
    }

    pub fn completed(&self) -> usize {
        self.records.lock().unwrap().iter().filter(|r| r.is_complete).count()
    }
}

#[async_trait]
impl StorageProvider for DurableMemoryStorage {
    async fn restore_subscriber_ids(&self, event_type: &str) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.event_type == event_type)
            .map(|r| r.subscriber_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn store_events(&self, records: Vec<EventStorageRecord>) -> Result<(), StorageError> {
        self.records.lock().unwrap().extend(records);
        Ok(())
    }

    async fn get_next_batch(
        &self,
        subscriber_id: &str,
        event_type: &str,
        limit: usize,
    ) -> Result<Vec<EventStorageRecord>, StorageError> {
        let failing = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StorageError::backend("injected fetch failure"));
        }

        let now = Utc::now();
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.subscriber_id == subscriber_id && r.event_type == event_type && r.is_pending_at(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_complete(&self, record: &EventStorageRecord) -> Result<(), StorageError> {
        self.mark_complete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(stored) = self
            .records
            .lock()
            .unwrap()
            .iter_mut()
            .find(|r| r.record_id == record.record_id)
        {
            stored.is_complete = true;
        }
        Ok(())
    }

    async fn purge_stale(&self) -> Result<(), StorageError> {
        let now = Utc::now();
        self.records.lock().unwrap().retain(|r| !r.is_purgeable_at(now));
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderPlaced {
    pub order_id: u32,
}

impl Event for OrderPlaced {
    fn event_type() -> &'static str {
        "orders.OrderPlaced"
    }
}

/// Records every order id it handles
#[derive(Clone)]
pub struct RecordOrders {
    pub seen: Arc<Mutex<Vec<u32>>>,
}

impl RecordOrders {
    pub fn new() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sorted(&self) -> Vec<u32> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort();
        seen
    }

    pub async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.seen.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("handler did not see enough events");
    }
}

#[async_trait]
impl EventHandler<OrderPlaced> for RecordOrders {
    async fn handle(&self, event: OrderPlaced, _ct: CancellationToken) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.order_id);
        Ok(())
    }
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Accepts `remaining` writes, then reports the stream closed
pub struct FailAfter {
    pub remaining: usize,
    pub written: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl event_relay::messaging::EventSink for FailAfter {
    async fn write(&mut self, payload: &[u8]) -> Result<(), event_relay::messaging::SinkClosed> {
        if self.remaining == 0 {
            return Err(event_relay::messaging::SinkClosed);
        }
        self.remaining -= 1;
        self.written.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}
