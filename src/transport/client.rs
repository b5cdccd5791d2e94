use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status, Streaming};
use tonic_prost::ProstCodec;

use super::errors::TransportError;
use super::wire::{self, Ack, CommandFrame, EventFrame, SubscribeRequest};
use crate::commands::Command;
use crate::messaging::{serialize_event, Event, EventSource, EventStream};

// ============================================================================
// gRPC Clients
// ============================================================================

fn method_path(path: String) -> Result<PathAndQuery, TransportError> {
    PathAndQuery::try_from(path)
        .map_err(|e| TransportError::Status(Status::invalid_argument(format!("invalid method path: {e}"))))
}

fn lazy_channel(target: &str) -> Result<Channel, TransportError> {
    let endpoint = Endpoint::from_shared(target.to_string()).map_err(|source| TransportError::InvalidEndpoint {
        endpoint: target.to_string(),
        source,
    })?;
    Ok(endpoint.connect_lazy())
}

/// Connection to a remote event hub server.
///
/// Used as the `EventSource` of subscribers, and for publishing to hubs
/// running in broker mode.
#[derive(Clone)]
pub struct HubClient {
    target: String,
    channel: Channel,
}

impl HubClient {
    /// The channel connects on first use and reconnects on its own
    pub fn connect_lazy(target: impl Into<String>) -> Result<Self, TransportError> {
        let target = target.into();
        let channel = lazy_channel(&target)?;
        Ok(Self { target, channel })
    }

    /// Hands an event to a broker-mode hub. Returns once the hub has accepted
    /// it, not once it has been delivered.
    pub async fn publish<E: Event>(&self, event: &E) -> Result<(), TransportError> {
        let payload = serialize_event(event)?;
        let path = method_path(wire::publish_path(E::event_type()))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await?;

        let _: tonic::Response<Ack> = grpc
            .unary(Request::new(EventFrame { payload }), path, ProstCodec::default())
            .await?;

        tracing::debug!(event_type = E::event_type(), target = %self.target, "Event published to broker");
        Ok(())
    }
}

#[async_trait]
impl EventSource for HubClient {
    fn target(&self) -> &str {
        &self.target
    }

    async fn open(&self, subscriber_id: &str, event_type: &str) -> Result<Box<dyn EventStream>, TransportError> {
        let path = method_path(wire::subscribe_path(event_type))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await?;

        let request = Request::new(SubscribeRequest {
            subscriber_id: subscriber_id.to_string(),
        });
        let response = grpc.server_streaming(request, path, ProstCodec::default()).await?;

        Ok(Box::new(HubStream {
            inner: response.into_inner(),
        }))
    }
}

struct HubStream {
    inner: Streaming<EventFrame>,
}

#[async_trait]
impl EventStream for HubStream {
    async fn next(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.inner.message().await?.map(|frame| frame.payload))
    }
}

/// Executes commands on a remote `CommandService`
#[derive(Clone)]
pub struct CommandClient {
    channel: Channel,
}

impl CommandClient {
    pub fn connect_lazy(target: &str) -> Result<Self, TransportError> {
        Ok(Self {
            channel: lazy_channel(target)?,
        })
    }

    pub async fn execute<C>(&self, command: &C) -> Result<C::Result, TransportError>
    where
        C: Command + Serialize,
        C::Result: DeserializeOwned,
    {
        let payload = serde_json::to_vec(command)?;
        let path = method_path(wire::command_path(C::NAME))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await?;

        let response: tonic::Response<CommandFrame> = grpc
            .unary(Request::new(CommandFrame { payload }), path, ProstCodec::default())
            .await?;

        Ok(serde_json::from_slice(&response.into_inner().payload)?)
    }
}
