// ============================================================================
// event_relay - command pipeline and durable event relay
// ============================================================================
//
// - commands:  in-process command execution with middleware
// - messaging: EventHub and EventSubscriber, at-least-once event delivery
// - storage:   record queues behind both ends (in-memory, ScyllaDB)
// - transport: gRPC services and clients for hubs and commands
// - metrics:   Prometheus metrics and the /metrics, /health endpoints
//
// ============================================================================

pub mod commands;
pub mod messaging;
pub mod metrics;
pub mod storage;
pub mod transport;
pub mod utils;

pub use commands::{Command, CommandError, CommandExecutor, CommandHandler, CommandMiddleware, CommandRegistry};
pub use messaging::{Event, EventHandler, EventHub, EventSubscriber, HubConfig, HubMode, SubscriberConfig};
pub use storage::{EventStorageRecord, InMemoryStorage, StorageError, StorageProvider};
