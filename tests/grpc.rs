mod common;

use async_trait::async_trait;
use common::{eventually, OrderPlaced, RecordOrders};
use event_relay::commands::{Command, CommandExecutor, CommandHandler, CommandRegistry};
use event_relay::messaging::{
    Event, EventHub, EventSource, EventSubscriber, HubConfig, HubEndpoint, SubscriberConfig,
};
use event_relay::storage::InMemoryStorage;
use event_relay::transport::{self, CommandClient, CommandService, EventHubService, HubClient, TransportError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Code;

#[derive(Serialize, Deserialize, Clone, Debug)]
struct StockLow {
    sku: String,
}

impl Event for StockLow {
    fn event_type() -> &'static str {
        "inventory.StockLow"
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct Reserve {
    sku: String,
    quantity: u32,
}

impl Command for Reserve {
    type Result = u32;
    const NAME: &'static str = "inventory.Reserve";
}

struct ReserveHandler;

#[async_trait]
impl CommandHandler<Reserve> for ReserveHandler {
    async fn execute(&self, command: Reserve, _ct: CancellationToken) -> anyhow::Result<u32> {
        if command.quantity > 100 {
            anyhow::bail!("not enough {} in stock", command.sku);
        }
        Ok(100 - command.quantity)
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct Cancel {
    reservation: u32,
}

impl Command for Cancel {
    type Result = ();
    const NAME: &'static str = "inventory.Cancel";
}

struct TestServer {
    addr: SocketAddr,
    orders: EventHub<OrderPlaced>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), TransportError>>,
}

impl TestServer {
    async fn start() -> Self {
        let orders = EventHub::<OrderPlaced>::new(
            Arc::new(InMemoryStorage::new()),
            HubConfig {
                broadcast_poll_interval: Duration::from_millis(20),
                ..HubConfig::broker()
            },
        );
        let stock = EventHub::<StockLow>::new(Arc::new(InMemoryStorage::new()), HubConfig::default());

        let hubs = EventHubService::builder()
            .hub(Arc::new(orders.clone()) as Arc<dyn HubEndpoint>)
            .hub(Arc::new(stock) as Arc<dyn HubEndpoint>)
            .build();

        let mut registry = CommandRegistry::new();
        registry.register_handler::<Reserve, _>(|| ReserveHandler);
        let commands = CommandService::builder(CommandExecutor::new(Arc::new(registry)))
            .command::<Reserve>()
            .build();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(transport::serve(listener, hubs, Some(commands), shutdown.clone()));

        eventually(|| orders.state() == event_relay::messaging::HubState::Ready).await;

        Self {
            addr,
            orders,
            shutdown,
            task,
        }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}

fn status_code(error: TransportError) -> Code {
    match error {
        TransportError::Status(status) => status.code(),
        other => panic!("expected a status, got {other}"),
    }
}

#[tokio::test]
async fn test_broker_publish_reaches_remote_subscriber() {
    let server = TestServer::start().await;
    let handler = RecordOrders::new();

    let source = Arc::new(HubClient::connect_lazy(server.url()).unwrap());
    let handle = EventSubscriber::<OrderPlaced, RecordOrders>::new(source, Arc::new(InMemoryStorage::new()), {
        let handler = handler.clone();
        move || handler.clone()
    })
    .with_config(SubscriberConfig {
        retry_delay: Duration::from_millis(50),
        ..Default::default()
    })
    .start(&CancellationToken::new());

    let id = handle.subscriber_id().to_string();
    eventually(|| server.orders.is_connected(&id)).await;

    let publisher = HubClient::connect_lazy(server.url()).unwrap();
    publisher.publish(&OrderPlaced { order_id: 11 }).await.unwrap();
    publisher.publish(&OrderPlaced { order_id: 12 }).await.unwrap();

    handler.wait_for(2).await;
    assert_eq!(handler.sorted(), vec![11, 12]);

    handle.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_publish_to_non_broker_hub_is_refused() {
    let server = TestServer::start().await;
    let publisher = HubClient::connect_lazy(server.url()).unwrap();

    let err = publisher
        .publish(&StockLow {
            sku: "sku-1".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status_code(err), Code::Unimplemented);

    server.stop().await;
}

#[tokio::test]
async fn test_subscribe_validation() {
    let server = TestServer::start().await;
    let client = HubClient::connect_lazy(server.url()).unwrap();

    let empty_id = client.open("", OrderPlaced::event_type()).await.err().unwrap();
    assert_eq!(status_code(empty_id), Code::InvalidArgument);

    let unknown = client.open("sub-1", "billing.InvoiceSent").await.err().unwrap();
    assert_eq!(status_code(unknown), Code::Unimplemented);

    server.stop().await;
}

#[tokio::test]
async fn test_remote_command_execution() {
    let server = TestServer::start().await;
    let client = CommandClient::connect_lazy(&server.url()).unwrap();

    let remaining = client
        .execute(&Reserve {
            sku: "sku-1".to_string(),
            quantity: 30,
        })
        .await
        .unwrap();
    assert_eq!(remaining, 70);

    let failed = client
        .execute(&Reserve {
            sku: "sku-1".to_string(),
            quantity: 500,
        })
        .await
        .unwrap_err();
    assert_eq!(status_code(failed), Code::Internal);

    let unknown = client.execute(&Cancel { reservation: 1 }).await.unwrap_err();
    assert_eq!(status_code(unknown), Code::Unimplemented);

    server.stop().await;
}

#[tokio::test]
async fn test_health_reports_serving_once_hubs_are_ready() {
    use tonic_health::pb::health_check_response::ServingStatus;
    use tonic_health::pb::health_client::HealthClient;
    use tonic_health::pb::HealthCheckRequest;

    let server = TestServer::start().await;
    let channel = tonic::transport::Endpoint::from_shared(server.url())
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut health = HealthClient::new(channel);

    let mut status = ServingStatus::Unknown;
    for _ in 0..100 {
        let response = health
            .check(HealthCheckRequest {
                service: event_relay::transport::HUB_SERVICE.to_string(),
            })
            .await
            .unwrap();
        status = response.into_inner().status();
        if status == ServingStatus::Serving {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, ServingStatus::Serving);

    server.stop().await;
}
