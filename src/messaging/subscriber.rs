use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::SubscriberConfig;
use super::connection::EventSource;
use super::errors::{ErrorReceiver, NoopErrorReceiver};
use super::event::{deserialize_event, Event};
use super::purge::run_purge_loop;
use super::subscriber_id::{local_host_name, subscriber_id};
use crate::metrics::Metrics;
use crate::storage::{EventStorageRecord, StorageProvider};
use crate::utils::{retry_until_cancelled, sleep_or_cancelled};

// ============================================================================
// Event Subscriber - client side of one (event type, handler type) pair
// ============================================================================
//
// Two loops share a local storage queue:
//
//   hub stream -> [receiver] -> store -> signal
//                                          |
//              [executor] <- batch <- wait-+ -> handler -> mark complete
//
// The receiver never runs handlers and the executor never touches the
// network, so a slow handler does not hold the hub stream and a dropped
// stream does not stop execution of what was already received.
//
// ============================================================================

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: E, ct: CancellationToken) -> anyhow::Result<()>;
}

pub type EventHandlerFactory<H> = Arc<dyn Fn() -> H + Send + Sync>;

pub struct EventSubscriber<E: Event, H: EventHandler<E>> {
    source: Arc<dyn EventSource>,
    storage: Arc<dyn StorageProvider>,
    factory: EventHandlerFactory<H>,
    config: SubscriberConfig,
    errors: Arc<dyn ErrorReceiver>,
    metrics: Option<Arc<Metrics>>,
    host: String,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event, H: EventHandler<E>> EventSubscriber<E, H> {
    pub fn new(
        source: Arc<dyn EventSource>,
        storage: Arc<dyn StorageProvider>,
        factory: impl Fn() -> H + Send + Sync + 'static,
    ) -> Self {
        Self {
            source,
            storage,
            factory: Arc::new(factory),
            config: SubscriberConfig::default(),
            errors: Arc::new(NoopErrorReceiver),
            metrics: None,
            host: local_host_name(),
            _event: PhantomData,
        }
    }

    pub fn with_config(mut self, config: SubscriberConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_receiver(mut self, errors: Arc<dyn ErrorReceiver>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Overrides the host part of the subscriber id
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn subscriber_id(&self) -> String {
        subscriber_id(
            &self.host,
            std::any::type_name::<H>(),
            self.source.target(),
            self.config.client_id.as_deref(),
        )
    }

    /// Starts the receiver, executor and purge tasks
    pub fn start(self, parent: &CancellationToken) -> SubscriberHandle {
        let ct = parent.child_token();
        let subscriber_id = self.subscriber_id();

        tracing::info!(
            subscriber_id = %subscriber_id,
            event_type = E::event_type(),
            handler = std::any::type_name::<H>(),
            "Starting event subscriber"
        );

        let purge = tokio::spawn(run_purge_loop(
            "subscriber",
            self.storage.clone(),
            self.errors.clone(),
            self.config.purge_interval,
            ct.clone(),
        ));

        let runner = Arc::new(SubscriberRunner::<E, H> {
            subscriber_id: subscriber_id.clone(),
            event_type: E::event_type(),
            source: self.source,
            storage: self.storage,
            factory: self.factory,
            config: self.config,
            errors: self.errors,
            metrics: self.metrics,
            signal: Semaphore::new(0),
            _event: PhantomData,
        });

        let receiver = tokio::spawn(runner.clone().receive_loop(ct.clone()));
        let executor = tokio::spawn(runner.execute_loop(ct.clone()));

        SubscriberHandle {
            subscriber_id,
            ct,
            tasks: vec![receiver, executor, purge],
        }
    }
}

pub struct SubscriberHandle {
    subscriber_id: String,
    ct: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriberHandle {
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Cancels the loops and waits for them. In-flight storage calls and
    /// handlers finish first.
    pub async fn stop(self) {
        self.ct.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(subscriber_id = %self.subscriber_id, error = %e, "Subscriber task failed");
            }
        }
        tracing::info!(subscriber_id = %self.subscriber_id, "Event subscriber stopped");
    }
}

struct SubscriberRunner<E: Event, H: EventHandler<E>> {
    subscriber_id: String,
    event_type: &'static str,
    source: Arc<dyn EventSource>,
    storage: Arc<dyn StorageProvider>,
    factory: EventHandlerFactory<H>,
    config: SubscriberConfig,
    errors: Arc<dyn ErrorReceiver>,
    metrics: Option<Arc<Metrics>>,
    /// One permit per stored record, consumed by the executor
    signal: Semaphore,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event, H: EventHandler<E>> SubscriberRunner<E, H> {
    // ========================================================================
    // Receiver: hub stream -> local storage
    // ========================================================================

    async fn receive_loop(self: Arc<Self>, ct: CancellationToken) {
        while !ct.is_cancelled() {
            let opened = tokio::select! {
                _ = ct.cancelled() => return,
                opened = self.source.open(&self.subscriber_id, self.event_type) => opened,
            };

            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(
                        subscriber_id = %self.subscriber_id,
                        event_type = self.event_type,
                        target = self.source.target(),
                        error = %e,
                        "Failed to open hub stream"
                    );
                    if !sleep_or_cancelled(self.config.retry_delay, &ct).await {
                        return;
                    }
                    continue;
                }
            };

            tracing::info!(subscriber_id = %self.subscriber_id, event_type = self.event_type, "Subscribed to hub");

            loop {
                let next = tokio::select! {
                    _ = ct.cancelled() => return,
                    next = stream.next() => next,
                };

                match next {
                    Ok(Some(payload)) => {
                        let record = EventStorageRecord::new(
                            self.subscriber_id.as_str(),
                            self.event_type,
                            payload,
                            self.config.record_ttl,
                        );
                        if !self.store_received(record, &ct).await {
                            return;
                        }
                        self.signal.add_permits(1);
                    }
                    Ok(None) => {
                        tracing::info!(subscriber_id = %self.subscriber_id, "Hub closed the stream");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(subscriber_id = %self.subscriber_id, error = %e, "Hub stream failed");
                        break;
                    }
                }
            }

            if !sleep_or_cancelled(self.config.retry_delay, &ct).await {
                return;
            }
        }
    }

    /// Stores one received record, retrying until it sticks. False on shutdown.
    async fn store_received(&self, record: EventStorageRecord, ct: &CancellationToken) -> bool {
        let storage = &self.storage;
        let errors = &self.errors;
        let event_type = self.event_type;

        retry_until_cancelled(
            self.config.retry_delay,
            ct,
            |_attempt| storage.store_events(vec![record.clone()]),
            |attempt, e| errors.on_store_failure(event_type, std::slice::from_ref(&record), attempt, e),
        )
        .await
        .is_some()
    }

    // ========================================================================
    // Executor: local storage -> handler
    // ========================================================================

    async fn execute_loop(self: Arc<Self>, ct: CancellationToken) {
        let in_memory = self.storage.is_in_memory();
        let mut failures = 0u32;

        // Failed in-memory records were already dequeued; they are retried from
        // here instead of going back into a queue the receiver keeps filling.
        let mut retry: Vec<EventStorageRecord> = Vec::new();

        while !ct.is_cancelled() {
            let batch = if !retry.is_empty() {
                let now = Utc::now();
                retry.retain(|record| !record.is_expired_at(now));
                std::mem::take(&mut retry)
            } else {
                match self
                    .storage
                    .get_next_batch(&self.subscriber_id, self.event_type, self.config.batch_size)
                    .await
                {
                    Ok(batch) => {
                        failures = 0;
                        batch
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(
                            subscriber_id = %self.subscriber_id,
                            attempt = failures,
                            error = %e,
                            "Failed to fetch pending records"
                        );
                        self.errors.on_retrieve_failure(self.event_type, &self.subscriber_id, failures, &e);
                        if !sleep_or_cancelled(self.config.retry_delay, &ct).await {
                            return;
                        }
                        continue;
                    }
                }
            };

            if batch.is_empty() {
                self.wait_for_signal(&ct).await;
                continue;
            }

            let total = batch.len();
            let outcomes = join_all(batch.into_iter().map(|record| self.execute_record(record, in_memory, &ct))).await;

            let mut failed = 0usize;
            for outcome in outcomes {
                if let Err(unfinished) = outcome {
                    failed += 1;
                    retry.extend(unfinished);
                }
            }

            if failed > 0 {
                tracing::warn!(
                    subscriber_id = %self.subscriber_id,
                    failed = failed,
                    total = total,
                    "Some events failed, retrying after delay"
                );
                if !sleep_or_cancelled(self.config.retry_delay, &ct).await {
                    return;
                }
            }
        }
    }

    async fn wait_for_signal(&self, ct: &CancellationToken) {
        tokio::select! {
            _ = ct.cancelled() => {}
            acquired = tokio::time::timeout(self.config.idle_wait, self.signal.acquire()) => {
                if let Ok(Ok(permit)) = acquired {
                    permit.forget();
                }

                let pending = self.signal.available_permits();
                if pending > 0 {
                    if let Ok(permits) = self.signal.try_acquire_many(pending as u32) {
                        permits.forget();
                    }
                }
            }
        }
    }

    /// Runs one record through a fresh handler.
    ///
    /// On failure an in-memory record is handed back for the executor to
    /// retry; a durable one stays pending in storage.
    async fn execute_record(
        &self,
        record: EventStorageRecord,
        in_memory: bool,
        ct: &CancellationToken,
    ) -> Result<(), Option<EventStorageRecord>> {
        let started = Instant::now();

        let outcome = match deserialize_event::<E>(&record.event) {
            Ok(event) => {
                let handler = (self.factory)();
                match AssertUnwindSafe(handler.handle(event, ct.clone())).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("event handler panicked")),
                }
            }
            Err(e) => {
                tracing::error!(record_id = %record.record_id, error = %e, "Failed to deserialize event");
                self.errors.on_serialize_failure(self.event_type, &e);
                Err(anyhow::Error::new(e).context("failed to deserialize event"))
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_handled(self.event_type, started.elapsed().as_secs_f64(), outcome.is_ok());
        }

        match outcome {
            Ok(()) => {
                if !in_memory {
                    self.mark_complete(&record, ct).await;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    subscriber_id = %self.subscriber_id,
                    record_id = %record.record_id,
                    error = %e,
                    "Event handler failed"
                );
                self.errors.on_handler_failure(&record, &e);

                if in_memory {
                    Err(Some(record))
                } else {
                    Err(None)
                }
            }
        }
    }

    async fn mark_complete(&self, record: &EventStorageRecord, ct: &CancellationToken) {
        let storage = &self.storage;
        let errors = &self.errors;

        retry_until_cancelled(
            self.config.retry_delay,
            ct,
            move |_attempt| storage.mark_complete(record),
            |attempt, e| errors.on_mark_complete_failure(record, attempt, e),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{EventHub, HubConfig, HubEndpoint, InProcessSource};
    use crate::storage::{InMemoryStorage, InMemoryStorageConfig};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Tick {
        n: u32,
    }

    impl Event for Tick {
        fn event_type() -> &'static str {
            "tests.Tick"
        }
    }

    struct Collect {
        seen: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl EventHandler<Tick> for Collect {
        async fn handle(&self, event: Tick, _ct: CancellationToken) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event.n);
            Ok(())
        }
    }

    /// Fails the first `failures` calls across all instances
    struct Flaky {
        failures: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl EventHandler<Tick> for Flaky {
        async fn handle(&self, event: Tick, _ct: CancellationToken) -> anyhow::Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("transient handler failure");
            }
            self.seen.lock().unwrap().push(event.n);
            Ok(())
        }
    }

    async fn hub_and_source() -> (EventHub<Tick>, Arc<InProcessSource>) {
        let hub = EventHub::<Tick>::new(Arc::new(InMemoryStorage::new()), HubConfig::default());
        hub.initialize().await.unwrap();
        let source = Arc::new(InProcessSource::new("in-process").with_hub(Arc::new(hub.clone())));
        (hub, source)
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<u32>>>, count: usize) {
        while seen.lock().unwrap().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn fast_config() -> SubscriberConfig {
        SubscriberConfig {
            retry_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_subscriber_id_depends_on_handler_and_client() {
        let source: Arc<dyn EventSource> = Arc::new(InProcessSource::new("hub"));
        let storage: Arc<dyn StorageProvider> = Arc::new(InMemoryStorage::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let a = EventSubscriber::<Tick, _>::new(source.clone(), storage.clone(), {
            let seen = seen.clone();
            move || Collect { seen: seen.clone() }
        })
        .with_host("node-1");
        let b = EventSubscriber::<Tick, _>::new(source, storage, move || Collect { seen: seen.clone() })
            .with_host("node-1")
            .with_config(SubscriberConfig::default().with_client_id("worker-2"));

        assert_eq!(a.subscriber_id().len(), 64);
        assert_ne!(a.subscriber_id(), b.subscriber_id());
    }

    #[tokio::test]
    async fn test_events_flow_from_hub_to_handler() {
        let (hub, source) = hub_and_source().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler_seen = seen.clone();

        let handle = EventSubscriber::<Tick, _>::new(source, Arc::new(InMemoryStorage::new()), move || Collect {
            seen: handler_seen.clone(),
        })
        .with_config(fast_config())
        .start(&CancellationToken::new());

        while !hub.is_connected(handle.subscriber_id()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for n in 1..=3 {
            hub.broadcast_event_task(Tick { n }).await;
        }

        wait_for(&seen, 3).await;
        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec![1, 2, 3]);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_failed_handler_is_retried() {
        let (hub, source) = hub_and_source().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(AtomicUsize::new(2));
        let (handler_seen, handler_failures) = (seen.clone(), failures.clone());

        let handle = EventSubscriber::<Tick, _>::new(source, Arc::new(InMemoryStorage::new()), move || Flaky {
            failures: handler_failures.clone(),
            seen: handler_seen.clone(),
        })
        .with_config(fast_config())
        .start(&CancellationToken::new());

        while !hub.is_connected(handle.subscriber_id()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        hub.broadcast_event_task(Tick { n: 42 }).await;

        wait_for(&seen, 1).await;
        assert_eq!(*seen.lock().unwrap(), vec![42]);
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_the_hub_connection() {
        let (hub, source) = hub_and_source().await;
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = EventSubscriber::<Tick, _>::new(source.clone(), Arc::new(InMemoryStorage::new()), move || Collect {
            seen: seen.clone(),
        })
        .start(&CancellationToken::new());
        let id = handle.subscriber_id().to_string();

        while !hub.is_connected(&id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;

        // The hub notices on its next write; the id stays known
        hub.broadcast_event_task(Tick { n: 1 }).await;
        while hub.is_connected(&id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.subscriber_ids(), vec![id]);
    }

    /// First call is slow and fails, every later one succeeds
    struct SlowFirstFailure {
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl EventHandler<Tick> for SlowFirstFailure {
        async fn handle(&self, event: Tick, _ct: CancellationToken) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(300)).await;
                anyhow::bail!("downstream timeout");
            }
            self.seen.lock().unwrap().push(event.n);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_record_retried_while_local_queue_is_full() {
        let (hub, source) = hub_and_source().await;
        let storage = Arc::new(InMemoryStorage::with_config(InMemoryStorageConfig {
            queue_capacity: 2,
            ..Default::default()
        }));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let (handler_seen, handler_calls) = (seen.clone(), calls.clone());

        let handle = EventSubscriber::<Tick, _>::new(source, storage, move || SlowFirstFailure {
            calls: handler_calls.clone(),
            seen: handler_seen.clone(),
        })
        .with_config(SubscriberConfig {
            batch_size: 1,
            ..fast_config()
        })
        .start(&CancellationToken::new());

        while !hub.is_connected(handle.subscriber_id()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for n in 1..=6 {
            hub.broadcast_event_task(Tick { n }).await;
        }

        tokio::time::timeout(Duration::from_secs(10), wait_for(&seen, 6))
            .await
            .unwrap();
        let mut got = seen.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, (1..=6).collect::<Vec<_>>());
        assert_eq!(calls.load(Ordering::SeqCst), 7);

        handle.stop().await;
    }
}
