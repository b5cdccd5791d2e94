use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::codegen::http;
use tonic::server::{NamedService, ServerStreamingService, UnaryService};
use tonic::{Request, Response, Status};
use tonic_prost::ProstCodec;

use super::errors::TransportError;
use super::wire::{self, Ack, CommandFrame, EventFrame, HubMethod, SubscribeRequest};
use crate::commands::{Command, CommandError, CommandExecutor};
use crate::messaging::{HubEndpoint, HubError, HubState};
use crate::metrics::Metrics;

// ============================================================================
// gRPC Server - hub and command services
// ============================================================================
//
// Both services implement tower's Service by hand and hand each call to
// tonic's Grpc helper with the prost codec, the same thing generated code
// does. Routing is by path, built from the registered hubs and commands.
//
// Health: `event_relay.EventHub` reports NOT_SERVING until every hub has
// restored its subscribers.
//
// ============================================================================

fn hub_status(error: HubError) -> Status {
    match error {
        HubError::PublishNotAllowed { .. } => Status::unimplemented(error.to_string()),
        HubError::Payload { .. } => Status::invalid_argument(error.to_string()),
        HubError::NotReady { .. } | HubError::RestoreTimeout { .. } | HubError::Restore { .. } => {
            Status::unavailable(error.to_string())
        }
    }
}

fn unimplemented(path: &str) -> BoxFuture<'static, Result<http::Response<Body>, Infallible>> {
    let status = Status::unimplemented(format!("unknown method {path}"));
    Box::pin(async move { Ok(status.into_http()) })
}

// ============================================================================
// Event hub service
// ============================================================================

struct HubServiceInner {
    hubs: HashMap<&'static str, Arc<dyn HubEndpoint>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct EventHubService {
    inner: Arc<HubServiceInner>,
}

#[derive(Default)]
pub struct EventHubServiceBuilder {
    hubs: HashMap<&'static str, Arc<dyn HubEndpoint>>,
}

impl EventHubServiceBuilder {
    pub fn hub(mut self, hub: Arc<dyn HubEndpoint>) -> Self {
        if self.hubs.insert(hub.event_type(), hub).is_some() {
            tracing::warn!("Replaced a hub registered for the same event type");
        }
        self
    }

    pub fn build(self) -> EventHubService {
        EventHubService {
            inner: Arc::new(HubServiceInner {
                hubs: self.hubs,
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl EventHubService {
    pub fn builder() -> EventHubServiceBuilder {
        EventHubServiceBuilder::default()
    }

    /// Initializes every hub; the first failure is returned after all have run
    pub async fn initialize_all(&self) -> Result<(), HubError> {
        let results = futures_util::future::join_all(self.inner.hubs.values().map(|hub| hub.initialize())).await;
        results.into_iter().collect()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.hubs.values().all(|hub| hub.state() == HubState::Ready)
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.inner.hubs.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Ends open subscriber streams and stops every hub
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for hub in self.inner.hubs.values() {
            hub.shutdown();
        }
    }
}

impl NamedService for EventHubService {
    const NAME: &'static str = wire::HUB_SERVICE;
}

impl tonic::codegen::Service<http::Request<Body>> for EventHubService {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let path = req.uri().path().to_string();

        let (method, hub) = match wire::parse_hub_path(&path) {
            Some(HubMethod::Subscribe(event_type)) => (Method::Subscribe, self.inner.hubs.get(event_type).cloned()),
            Some(HubMethod::Publish(event_type)) => (Method::Publish, self.inner.hubs.get(event_type).cloned()),
            None => return unimplemented(&path),
        };

        let Some(hub) = hub else {
            return unimplemented(&path);
        };

        match method {
            Method::Subscribe => {
                let svc = SubscribeMethod {
                    hub,
                    shutdown: self.inner.shutdown.clone(),
                };
                Box::pin(async move {
                    let mut grpc = tonic::server::Grpc::new(ProstCodec::default());
                    Ok(grpc.server_streaming(svc, req).await)
                })
            }
            Method::Publish => {
                if !hub.accepts_external_publish() {
                    return unimplemented(&path);
                }
                let svc = PublishMethod { hub };
                Box::pin(async move {
                    let mut grpc = tonic::server::Grpc::new(ProstCodec::default());
                    Ok(grpc.unary(svc, req).await)
                })
            }
        }
    }
}

enum Method {
    Subscribe,
    Publish,
}

struct SubscribeMethod {
    hub: Arc<dyn HubEndpoint>,
    shutdown: CancellationToken,
}

impl ServerStreamingService<SubscribeRequest> for SubscribeMethod {
    type Response = EventFrame;
    type ResponseStream = BoxStream<'static, Result<EventFrame, Status>>;
    type Future = BoxFuture<'static, Result<Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: Request<SubscribeRequest>) -> Self::Future {
        let hub = self.hub.clone();
        let ct = self.shutdown.child_token();

        Box::pin(async move {
            let subscriber_id = request.into_inner().subscriber_id;
            if subscriber_id.is_empty() {
                return Err(Status::invalid_argument("subscriber_id is required"));
            }
            if hub.state() != HubState::Ready {
                return Err(Status::unavailable(format!("hub for {} is not ready", hub.event_type())));
            }

            // A frame buffered here counts as delivered. With in-memory storage a
            // disconnect before the client reads it loses that one record.
            let (tx, rx) = mpsc::channel::<Vec<u8>>(1);

            // Dropping the response stream (client gone) stops the hub loop
            let guard = ct.clone().drop_guard();

            tokio::spawn(async move {
                if let Err(e) = hub.serve_subscriber(subscriber_id, Box::new(tx), ct).await {
                    tracing::warn!(error = %e, "Subscription ended with error");
                }
            });

            let stream = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
                let payload = rx.recv().await?;
                Some((Ok(EventFrame { payload }), (rx, guard)))
            });

            Ok(Response::new(Box::pin(stream) as Self::ResponseStream))
        })
    }
}

struct PublishMethod {
    hub: Arc<dyn HubEndpoint>,
}

impl UnaryService<EventFrame> for PublishMethod {
    type Response = Ack;
    type Future = BoxFuture<'static, Result<Response<Ack>, Status>>;

    fn call(&mut self, request: Request<EventFrame>) -> Self::Future {
        let hub = self.hub.clone();

        Box::pin(async move {
            hub.receive_payload(request.into_inner().payload)
                .await
                .map_err(hub_status)?;
            Ok(Response::new(Ack {}))
        })
    }
}

// ============================================================================
// Command service
// ============================================================================

#[async_trait]
trait CommandDispatch: Send + Sync {
    async fn dispatch(&self, executor: &CommandExecutor, payload: &[u8]) -> Result<Vec<u8>, Status>;
}

struct TypedDispatch<C>(PhantomData<fn() -> C>);

#[async_trait]
impl<C> CommandDispatch for TypedDispatch<C>
where
    C: Command + DeserializeOwned,
    C::Result: Serialize,
{
    async fn dispatch(&self, executor: &CommandExecutor, payload: &[u8]) -> Result<Vec<u8>, Status> {
        let command: C = serde_json::from_slice(payload)
            .map_err(|e| Status::invalid_argument(format!("invalid {} payload: {e}", C::NAME)))?;

        let result = executor
            .execute(command, CancellationToken::new())
            .await
            .map_err(|e| match e {
                CommandError::HandlerNotRegistered { .. } => Status::unimplemented(e.to_string()),
                CommandError::Cancelled { .. } => Status::cancelled(e.to_string()),
                CommandError::ResultTypeMismatch { .. } | CommandError::Handler(_) => Status::internal(e.to_string()),
            })?;

        serde_json::to_vec(&result).map_err(|e| Status::internal(format!("failed to encode result: {e}")))
    }
}

struct CommandServiceInner {
    executor: CommandExecutor,
    commands: HashMap<&'static str, Arc<dyn CommandDispatch>>,
    metrics: Option<Arc<Metrics>>,
}

/// Exposes registered commands as unary methods
#[derive(Clone)]
pub struct CommandService {
    inner: Arc<CommandServiceInner>,
}

pub struct CommandServiceBuilder {
    executor: CommandExecutor,
    commands: HashMap<&'static str, Arc<dyn CommandDispatch>>,
    metrics: Option<Arc<Metrics>>,
}

impl CommandServiceBuilder {
    pub fn command<C>(mut self) -> Self
    where
        C: Command + DeserializeOwned,
        C::Result: Serialize,
    {
        self.commands.insert(C::NAME, Arc::new(TypedDispatch::<C>(PhantomData)));
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> CommandService {
        CommandService {
            inner: Arc::new(CommandServiceInner {
                executor: self.executor,
                commands: self.commands,
                metrics: self.metrics,
            }),
        }
    }
}

impl CommandService {
    pub fn builder(executor: CommandExecutor) -> CommandServiceBuilder {
        CommandServiceBuilder {
            executor,
            commands: HashMap::new(),
            metrics: None,
        }
    }
}

impl NamedService for CommandService {
    const NAME: &'static str = wire::COMMAND_SERVICE;
}

impl tonic::codegen::Service<http::Request<Body>> for CommandService {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let path = req.uri().path().to_string();

        let found = wire::parse_command_path(&path)
            .and_then(|name| self.inner.commands.get_key_value(name))
            .map(|(name, dispatch)| (*name, dispatch.clone()));

        let Some((name, dispatch)) = found else {
            return unimplemented(&path);
        };

        let svc = CommandMethod {
            inner: self.inner.clone(),
            name,
            dispatch,
        };

        Box::pin(async move {
            let mut grpc = tonic::server::Grpc::new(ProstCodec::default());
            Ok(grpc.unary(svc, req).await)
        })
    }
}

struct CommandMethod {
    inner: Arc<CommandServiceInner>,
    name: &'static str,
    dispatch: Arc<dyn CommandDispatch>,
}

impl UnaryService<CommandFrame> for CommandMethod {
    type Response = CommandFrame;
    type Future = BoxFuture<'static, Result<Response<CommandFrame>, Status>>;

    fn call(&mut self, request: Request<CommandFrame>) -> Self::Future {
        let inner = self.inner.clone();
        let dispatch = self.dispatch.clone();
        let name = self.name;

        Box::pin(async move {
            let result = dispatch.dispatch(&inner.executor, &request.into_inner().payload).await;

            if let Some(metrics) = &inner.metrics {
                metrics.record_command(name, result.is_ok());
            }

            match &result {
                Ok(_) => tracing::debug!(command = name, "Remote command executed"),
                Err(status) => tracing::warn!(command = name, status = %status, "Remote command failed"),
            }

            result.map(|payload| Response::new(CommandFrame { payload }))
        })
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serves hubs, commands and gRPC health on `listener` until `shutdown` fires.
///
/// Hubs are initialized in the background; subscriptions are refused with
/// UNAVAILABLE until their hub is ready.
pub async fn serve(
    listener: TcpListener,
    hubs: EventHubService,
    commands: Option<CommandService>,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let (mut reporter, health_service) = tonic_health::server::health_reporter();
    reporter.set_not_serving::<EventHubService>().await;

    let initializer = {
        let hubs = hubs.clone();
        let mut reporter = reporter.clone();
        tokio::spawn(async move {
            match hubs.initialize_all().await {
                Ok(()) => {
                    reporter.set_serving::<EventHubService>().await;
                    tracing::info!(event_types = ?hubs.event_types(), "All hubs ready");
                }
                Err(e) => tracing::error!(error = %e, "Hub initialization failed"),
            }
        })
    };

    let local_addr = listener.local_addr().ok();
    tracing::info!(addr = ?local_addr, "Starting gRPC server");

    let incoming = Box::pin(futures_util::stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await.map(|(stream, _)| stream);
        Some((accepted, listener))
    }));

    let stopping = hubs.clone();
    let signal = async move {
        shutdown.cancelled().await;
        tracing::info!("Shutting down gRPC server");
        stopping.shutdown();
    };

    let result = tonic::transport::Server::builder()
        .add_service(health_service)
        .add_service(hubs)
        .add_optional_service(commands)
        .serve_with_incoming_shutdown(incoming, signal)
        .await;

    initializer.abort();
    result.map_err(TransportError::from)
}
