// ============================================================================
// Transport - event hubs and commands over gRPC
// ============================================================================

mod client;
mod errors;
mod server;
mod wire;

pub use client::{CommandClient, HubClient};
pub use errors::TransportError;
pub use server::{serve, CommandService, CommandServiceBuilder, EventHubService, EventHubServiceBuilder};
pub use wire::{command_path, publish_path, subscribe_path, COMMAND_SERVICE, HUB_SERVICE};
