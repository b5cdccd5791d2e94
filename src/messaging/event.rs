use serde::{de::DeserializeOwned, Serialize};

// ============================================================================
// Event - payload contract for hub and subscriber
// ============================================================================
//
// The hub never looks inside an event. It serializes once per broadcast and
// hands the same bytes to every target; the subscriber deserializes right
// before the handler runs.
//
// ============================================================================

/// An event type broadcast through a hub.
///
/// `event_type()` names the transport methods (`{event_type}.sub`,
/// `{event_type}.pub`) and the storage partition, so it must be stable
/// across deployments and identical on hub and subscriber.
pub trait Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn event_type() -> &'static str
    where
        Self: Sized;
}

pub fn serialize_event<E: Serialize>(event: &E) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(event)
}

pub fn deserialize_event<E: DeserializeOwned>(payload: &[u8]) -> serde_json::Result<E> {
    serde_json::from_slice(payload)
}
