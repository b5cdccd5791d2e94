use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::hub::HubEndpoint;
use crate::transport::TransportError;

// ============================================================================
// Connections - the two ends of a subscription stream
// ============================================================================
//
// Hub side writes payloads into an EventSink, subscriber side reads them from
// an EventStream opened through an EventSource. The gRPC transport implements
// both; InProcessSource wires a subscriber straight to hubs in the same
// process.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error("subscriber stream closed")]
pub struct SinkClosed;

/// Outbound half of one connected subscriber
#[async_trait]
pub trait EventSink: Send {
    async fn write(&mut self, payload: &[u8]) -> Result<(), SinkClosed>;
}

#[async_trait]
impl EventSink for mpsc::Sender<Vec<u8>> {
    async fn write(&mut self, payload: &[u8]) -> Result<(), SinkClosed> {
        self.send(payload.to_vec()).await.map_err(|_| SinkClosed)
    }
}

/// Inbound half of a subscription. `Ok(None)` means the hub ended the stream.
#[async_trait]
pub trait EventStream: Send {
    async fn next(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

#[async_trait]
impl EventStream for mpsc::Receiver<Vec<u8>> {
    async fn next(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.recv().await)
    }
}

#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Hub address, part of every subscriber id derived against this source
    fn target(&self) -> &str;

    async fn open(&self, subscriber_id: &str, event_type: &str) -> Result<Box<dyn EventStream>, TransportError>;
}

/// Subscribes directly to hubs living in the same process
pub struct InProcessSource {
    target: String,
    hubs: DashMap<&'static str, Arc<dyn HubEndpoint>>,
    shutdown: CancellationToken,
}

impl InProcessSource {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            hubs: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_hub(self, hub: Arc<dyn HubEndpoint>) -> Self {
        self.hubs.insert(hub.event_type(), hub);
        self
    }

    /// Ends every stream this source has opened
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl EventSource for InProcessSource {
    fn target(&self) -> &str {
        &self.target
    }

    async fn open(&self, subscriber_id: &str, event_type: &str) -> Result<Box<dyn EventStream>, TransportError> {
        let hub = self
            .hubs
            .get(event_type)
            .map(|h| h.value().clone())
            .ok_or_else(|| tonic::Status::unimplemented(format!("no hub for event type {event_type}")))?;

        // A frame buffered here counts as delivered. With in-memory storage a
        // disconnect before the client reads it loses that one record.
        let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
        let subscriber_id = subscriber_id.to_string();
        let ct = self.shutdown.child_token();

        tokio::spawn(async move {
            if let Err(e) = hub.serve_subscriber(subscriber_id, Box::new(tx), ct).await {
                tracing::warn!(error = %e, "In-process subscription rejected");
            }
        });

        Ok(Box::new(rx))
    }
}
