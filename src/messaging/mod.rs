// ============================================================================
// Messaging - durable event broadcasting
// ============================================================================
//
// EventHub (server) stores one record per target subscriber and streams it.
// EventSubscriber (client) stores what it receives and runs a handler per
// record. Both sides retry until a record is complete or expired.
//
// ============================================================================

mod config;
mod connection;
mod errors;
mod event;
mod hub;
mod purge;
mod subscriber;
mod subscriber_id;

pub use config::{HubConfig, HubMode, SubscriberConfig};
pub use connection::{EventSink, EventSource, EventStream, InProcessSource, SinkClosed};
pub use errors::{ErrorReceiver, NoopErrorReceiver};
pub use event::{deserialize_event, serialize_event, Event};
pub use hub::{EventHub, EventHubBuilder, HubEndpoint, HubError, HubState};
pub use subscriber::{EventHandler, EventSubscriber, EventHandlerFactory, SubscriberHandle};
pub use subscriber_id::{local_host_name, subscriber_id};
