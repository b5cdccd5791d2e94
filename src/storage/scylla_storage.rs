use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scylla::client::session::Session;
use scylla::statement::batch::Batch;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::provider::{StorageError, StorageProvider};
use super::record::EventStorageRecord;

// ============================================================================
// ScyllaDB Storage - durable provider
// ============================================================================
//
// Records survive restarts of either side. Layout:
//
//   event_records      ((subscriber_id, event_type), record_id)
//   event_subscribers  (event_type, subscriber_id)
//
// Every record row is written with a TTL matching its expire_on, so expired
// records disappear on their own. The hourly purge only has to remove rows
// that were marked complete.
//
// event_subscribers is what lets a restarted hub enumerate subscribers that
// are offline at the time.
//
// ============================================================================

const CREATE_RECORDS_TABLE: &str = "CREATE TABLE IF NOT EXISTS event_records (
        subscriber_id text,
        event_type text,
        record_id uuid,
        event blob,
        expire_on timestamp,
        is_complete boolean,
        PRIMARY KEY ((subscriber_id, event_type), record_id)
    ) WITH CLUSTERING ORDER BY (record_id ASC)";

const CREATE_SUBSCRIBERS_TABLE: &str = "CREATE TABLE IF NOT EXISTS event_subscribers (
        event_type text,
        subscriber_id text,
        PRIMARY KEY (event_type, subscriber_id)
    )";

pub struct ScyllaStorage {
    session: Arc<Session>,
}

impl ScyllaStorage {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Create tables in the session's current keyspace (idempotent)
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in [CREATE_RECORDS_TABLE, CREATE_SUBSCRIBERS_TABLE] {
            self.session
                .query_unpaged(statement, &[])
                .await
                .map_err(StorageError::backend)?;
        }

        tracing::info!("Event storage schema ready");
        Ok(())
    }

    async fn register_subscribers(&self, records: &[EventStorageRecord]) -> Result<(), StorageError> {
        let subscribers: HashSet<(&str, &str)> = records
            .iter()
            .map(|r| (r.event_type.as_str(), r.subscriber_id.as_str()))
            .collect();

        for (event_type, subscriber_id) in subscribers {
            self.session
                .query_unpaged(
                    "INSERT INTO event_subscribers (event_type, subscriber_id) VALUES (?, ?)",
                    (event_type, subscriber_id),
                )
                .await
                .map_err(StorageError::backend)?;
        }

        Ok(())
    }
}

#[async_trait]
impl StorageProvider for ScyllaStorage {
    async fn restore_subscriber_ids(&self, event_type: &str) -> Result<Vec<String>, StorageError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT subscriber_id FROM event_subscribers WHERE event_type = ?",
                (event_type,),
            )
            .await
            .map_err(StorageError::backend)?;

        let rows_result = result.into_rows_result().map_err(StorageError::backend)?;
        let rows = rows_result.rows::<(String,)>().map_err(StorageError::backend)?;

        let mut ids = Vec::new();
        for row in rows {
            let (subscriber_id,) = row.map_err(StorageError::backend)?;
            ids.push(subscriber_id);
        }

        tracing::info!(
            event_type = %event_type,
            subscriber_count = ids.len(),
            "Restored subscriber ids"
        );

        Ok(ids)
    }

    async fn store_events(&self, records: Vec<EventStorageRecord>) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }

        self.register_subscribers(&records).await?;

        let now = Utc::now();
        let mut batch = Batch::default();
        let mut values = Vec::with_capacity(records.len());

        for record in &records {
            batch.append_statement(
                "INSERT INTO event_records (
                    subscriber_id, event_type, record_id, event, expire_on, is_complete
                ) VALUES (?, ?, ?, ?, ?, ?) USING TTL ?",
            );

            values.push((
                record.subscriber_id.clone(),
                record.event_type.clone(),
                record.record_id,
                record.event.clone(),
                record.expire_on,
                record.is_complete,
                record.ttl_secs_at(now),
            ));
        }

        self.session
            .batch(&batch, values)
            .await
            .map_err(StorageError::backend)?;

        tracing::debug!(record_count = records.len(), "Stored event records");
        Ok(())
    }

    async fn get_next_batch(
        &self,
        subscriber_id: &str,
        event_type: &str,
        limit: usize,
    ) -> Result<Vec<EventStorageRecord>, StorageError> {
        let limit = limit.clamp(1, i32::MAX as usize) as i32;

        // Single partition, so filtering on is_complete stays cheap
        let result = self
            .session
            .query_unpaged(
                "SELECT record_id, event, expire_on, is_complete
                 FROM event_records
                 WHERE subscriber_id = ? AND event_type = ? AND is_complete = false
                 LIMIT ? ALLOW FILTERING",
                (subscriber_id, event_type, limit),
            )
            .await
            .map_err(StorageError::backend)?;

        let rows_result = result.into_rows_result().map_err(StorageError::backend)?;
        let rows = rows_result
            .rows::<(Uuid, Vec<u8>, DateTime<Utc>, bool)>()
            .map_err(StorageError::backend)?;

        let now = Utc::now();
        let mut batch = Vec::new();

        for row in rows {
            let (record_id, event, expire_on, is_complete) = row.map_err(StorageError::backend)?;

            let record = EventStorageRecord {
                record_id,
                subscriber_id: subscriber_id.to_string(),
                event_type: event_type.to_string(),
                event,
                expire_on,
                is_complete,
            };

            if record.is_pending_at(now) {
                batch.push(record);
            }
        }

        Ok(batch)
    }

    async fn mark_complete(&self, record: &EventStorageRecord) -> Result<(), StorageError> {
        // Keep the remaining TTL so the updated cells expire with the row
        self.session
            .query_unpaged(
                "UPDATE event_records USING TTL ?
                 SET is_complete = true
                 WHERE subscriber_id = ? AND event_type = ? AND record_id = ?",
                (
                    record.ttl_secs_at(Utc::now()),
                    record.subscriber_id.as_str(),
                    record.event_type.as_str(),
                    record.record_id,
                ),
            )
            .await
            .map_err(StorageError::backend)?;

        Ok(())
    }

    async fn purge_stale(&self) -> Result<(), StorageError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT subscriber_id, event_type, record_id
                 FROM event_records
                 WHERE is_complete = true
                 ALLOW FILTERING",
                &[],
            )
            .await
            .map_err(StorageError::backend)?;

        let rows_result = result.into_rows_result().map_err(StorageError::backend)?;
        let rows = rows_result
            .rows::<(String, String, Uuid)>()
            .map_err(StorageError::backend)?;

        let mut purged = 0usize;
        for row in rows {
            let (subscriber_id, event_type, record_id) = row.map_err(StorageError::backend)?;

            self.session
                .query_unpaged(
                    "DELETE FROM event_records
                     WHERE subscriber_id = ? AND event_type = ? AND record_id = ?",
                    (subscriber_id, event_type, record_id),
                )
                .await
                .map_err(StorageError::backend)?;
            purged += 1;
        }

        tracing::info!(purged = purged, "Purged completed event records");
        Ok(())
    }
}
