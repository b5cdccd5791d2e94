use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Event Storage Record - one event instance addressed to one subscriber
// ============================================================================
//
// The hub creates one record per target subscriber for every broadcast, the
// subscriber creates one record per event it receives from the hub. Either way
// the record is handed to a StorageProvider and read back later for delivery
// or execution.
//
// Lifecycle:
//   created -> stored -> fetched -> is_complete = true -> purged
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EventStorageRecord {
    /// Row identity for durable providers (time ordered v7 uuid)
    pub record_id: Uuid,
    pub subscriber_id: String,

    /// Stable event type name, see `Event::event_type()`
    pub event_type: String,

    /// Serialized event payload
    pub event: Vec<u8>,

    pub expire_on: DateTime<Utc>,
    pub is_complete: bool,
}

impl EventStorageRecord {
    pub fn new(
        subscriber_id: impl Into<String>,
        event_type: impl Into<String>,
        event: Vec<u8>,
        time_to_live: Duration,
    ) -> Self {
        let ttl = chrono::Duration::from_std(time_to_live).unwrap_or(chrono::Duration::hours(4));

        Self {
            record_id: Uuid::now_v7(),
            subscriber_id: subscriber_id.into(),
            event_type: event_type.into(),
            event,
            expire_on: Utc::now() + ttl,
            is_complete: false,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expire_on
    }

    /// Pending records are the only ones that may be delivered or executed
    pub fn is_pending_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_complete && !self.is_expired_at(now)
    }

    /// Default purge predicate used by every provider's sweep
    pub fn is_purgeable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_complete || self.is_expired_at(now)
    }

    /// Seconds left before expiry, clamped to at least one second.
    /// Durable providers use this as the row TTL.
    pub fn ttl_secs_at(&self, now: DateTime<Utc>) -> i32 {
        let secs = (self.expire_on - now).num_seconds();
        secs.clamp(1, i32::MAX as i64) as i32
    }
}
