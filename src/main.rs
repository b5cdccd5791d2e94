use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_relay::commands::{Command, CommandExecutor, CommandHandler, CommandRegistry};
use event_relay::messaging::{Event, EventHandler, EventHub, EventSubscriber, HubConfig, HubEndpoint};
use event_relay::metrics::{self, Metrics, MetricsErrorReceiver};
use event_relay::storage::{InMemoryStorage, ScyllaStorage, StorageProvider};
use event_relay::transport::{self, CommandClient, CommandService, EventHubService, HubClient};

// ============================================================================
// event_relay demo binary
// ============================================================================
//
//   event_relay hub        serve a Heartbeat hub (broker mode) and a Ping command
//   event_relay subscribe  log Heartbeats received from RELAY_HUB
//   event_relay publish    publish one Heartbeat and run Ping against RELAY_HUB
//
// Environment:
//   RELAY_LISTEN        hub listen address (default 0.0.0.0:50051)
//   RELAY_HUB           hub url for subscribe/publish (default http://127.0.0.1:50051)
//   RELAY_METRICS_PORT  metrics/health port (default 9090)
//   RELAY_SCYLLA        ScyllaDB node; in-memory storage when unset
//   RELAY_CLIENT_ID     distinguishes subscribers sharing host and handler
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Heartbeat {
    sequence: u64,
    source: String,
    emitted_at: DateTime<Utc>,
}

impl Event for Heartbeat {
    fn event_type() -> &'static str {
        "heartbeat"
    }
}

struct LogHeartbeat;

#[async_trait]
impl EventHandler<Heartbeat> for LogHeartbeat {
    async fn handle(&self, event: Heartbeat, _ct: CancellationToken) -> anyhow::Result<()> {
        let lag_ms = (Utc::now() - event.emitted_at).num_milliseconds();
        tracing::info!(sequence = event.sequence, source = %event.source, lag_ms, "Heartbeat received");
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct Ping {
    message: String,
}

impl Command for Ping {
    type Result = String;
    const NAME: &'static str = "ping";
}

struct PingHandler;

#[async_trait]
impl CommandHandler<Ping> for PingHandler {
    async fn execute(&self, command: Ping, _ct: CancellationToken) -> anyhow::Result<String> {
        Ok(format!("pong: {}", command.message))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

async fn open_storage() -> anyhow::Result<Arc<dyn StorageProvider>> {
    let Ok(node) = std::env::var("RELAY_SCYLLA") else {
        tracing::info!("Using in-memory storage");
        return Ok(Arc::new(InMemoryStorage::new()));
    };

    tracing::info!(node = %node, "Connecting to ScyllaDB...");
    let session = scylla::client::session_builder::SessionBuilder::new()
        .known_node(&node)
        .build()
        .await?;

    session
        .query_unpaged(
            "CREATE KEYSPACE IF NOT EXISTS event_relay WITH REPLICATION = \
             {'class': 'SimpleStrategy', 'replication_factor': 1}",
            &[],
        )
        .await?;
    session.use_keyspace("event_relay", false).await?;

    let storage = ScyllaStorage::new(Arc::new(session));
    storage.ensure_schema().await?;
    Ok(Arc::new(storage))
}

/// Runs the metrics server on its own thread so the gRPC runtime is untouched
fn spawn_metrics_server(relay_metrics: &Metrics, readiness: metrics::Readiness) {
    let registry = relay_metrics.registry().clone();
    let port = env_or("RELAY_METRICS_PORT", "9090").parse().unwrap_or(9090);

    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(registry, readiness, port)) {
            tracing::error!(error = %e, "Metrics server error");
        }
    });
}

async fn run_hub(shutdown: CancellationToken) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let storage = open_storage().await?;

    let hub = EventHub::<Heartbeat>::builder(storage)
        .config(HubConfig::broker())
        .error_receiver(Arc::new(MetricsErrorReceiver::new(metrics.clone())))
        .metrics(metrics.clone())
        .shutdown_token(&shutdown)
        .build();

    let hubs = EventHubService::builder()
        .hub(Arc::new(hub.clone()) as Arc<dyn HubEndpoint>)
        .build();

    let mut registry = CommandRegistry::new();
    registry.register_handler::<Ping, _>(|| PingHandler);
    let commands = CommandService::builder(CommandExecutor::new(Arc::new(registry)))
        .command::<Ping>()
        .metrics(metrics.clone())
        .build();

    let readiness_hubs = hubs.clone();
    spawn_metrics_server(&metrics, Arc::new(move || readiness_hubs.is_ready()));

    // Local heartbeat every 10s next to whatever clients publish
    let ticker = {
        let hub = hub.clone();
        let shutdown = shutdown.clone();
        let source = event_relay::messaging::local_host_name();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            let mut sequence = 0u64;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        sequence += 1;
                        hub.publish(Heartbeat { sequence, source: source.clone(), emitted_at: Utc::now() });
                    }
                }
            }
        })
    };

    let listen = env_or("RELAY_LISTEN", "0.0.0.0:50051");
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(addr = %listen, "Hub listening");

    transport::serve(listener, hubs, Some(commands), shutdown).await?;
    let _ = ticker.await;
    Ok(())
}

async fn run_subscriber(shutdown: CancellationToken) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new()?);
    let target = env_or("RELAY_HUB", "http://127.0.0.1:50051");
    let source = Arc::new(HubClient::connect_lazy(target)?);

    let mut config = event_relay::SubscriberConfig::default();
    if let Ok(client_id) = std::env::var("RELAY_CLIENT_ID") {
        config = config.with_client_id(client_id);
    }

    let subscriber = EventSubscriber::<Heartbeat, LogHeartbeat>::new(source, open_storage().await?, || LogHeartbeat)
        .with_config(config)
        .with_error_receiver(Arc::new(MetricsErrorReceiver::new(metrics.clone())))
        .with_metrics(metrics.clone());

    spawn_metrics_server(&metrics, Arc::new(|| true));

    let handle = subscriber.start(&shutdown);
    tracing::info!(subscriber_id = handle.subscriber_id(), "Subscribed to heartbeats");

    shutdown.cancelled().await;
    handle.stop().await;
    Ok(())
}

async fn run_publish() -> anyhow::Result<()> {
    let target = env_or("RELAY_HUB", "http://127.0.0.1:50051");

    let hub = HubClient::connect_lazy(target.clone())?;
    hub.publish(&Heartbeat {
        sequence: 0,
        source: event_relay::messaging::local_host_name(),
        emitted_at: Utc::now(),
    })
    .await?;
    tracing::info!("Heartbeat published");

    let commands = CommandClient::connect_lazy(&target)?;
    let reply = commands
        .execute(&Ping {
            message: "hello".to_string(),
        })
        .await?;
    tracing::info!(reply = %reply, "Ping answered");

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,event_relay=debug")))
        .init();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Ctrl-C received, shutting down");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
            }
        });
    }

    let mode = std::env::args().nth(1).unwrap_or_else(|| "hub".to_string());
    match mode.as_str() {
        "hub" => run_hub(shutdown).await,
        "subscribe" => run_subscriber(shutdown).await,
        "publish" => run_publish().await,
        other => anyhow::bail!("unknown mode {other:?}, expected hub, subscribe or publish"),
    }
}
