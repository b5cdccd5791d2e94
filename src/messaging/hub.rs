use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::{HubConfig, HubMode};
use super::connection::EventSink;
use super::errors::{ErrorReceiver, NoopErrorReceiver};
use super::event::{deserialize_event, serialize_event, Event};
use super::purge::run_purge_loop;
use crate::metrics::Metrics;
use crate::storage::{EventStorageRecord, StorageError, StorageProvider};
use crate::utils::{retry_until_cancelled, sleep_or_cancelled};

// ============================================================================
// Event Hub - server side of one event type
// ============================================================================
//
// Every broadcast is written to storage first, one record per target
// subscriber, and only then streamed. A subscriber that is offline keeps
// collecting records under its id and drains them on its next connection.
//
// Lifecycle:
//   Uninitialized -> Initializing (restore subscriber ids) -> Ready
//
// Per connected subscriber the hub runs one loop:
//   fetch batch -> write each record -> mark complete (durable storage)
//   nothing pending -> wait for a wake permit, at most `idle_wait`
//
// Targets of a broadcast:
// - default: every known subscriber, connected or not
// - ROUND_ROBIN: exactly one connected subscriber, rotating by id
//
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubState {
    Uninitialized,
    Initializing,
    Ready,
}

impl HubState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HubState::Initializing,
            2 => HubState::Ready,
            _ => HubState::Uninitialized,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HubState::Uninitialized => 0,
            HubState::Initializing => 1,
            HubState::Ready => 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Hub for {event_type} did not restore subscribers within {timeout:?}")]
    RestoreTimeout { event_type: String, timeout: Duration },

    #[error("Hub for {event_type} failed to restore subscribers: {source}")]
    Restore {
        event_type: String,
        #[source]
        source: StorageError,
    },

    #[error("Hub for {event_type} is not ready")]
    NotReady { event_type: String },

    #[error("Hub for {event_type} does not accept external events")]
    PublishNotAllowed { event_type: String },

    #[error("Invalid {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Type-erased view of a hub, used by transports to route calls by event type
#[async_trait]
pub trait HubEndpoint: Send + Sync + 'static {
    fn event_type(&self) -> &'static str;

    fn state(&self) -> HubState;

    /// True in EVENT_BROKER mode
    fn accepts_external_publish(&self) -> bool;

    /// Restore known subscribers and become Ready. Calling it on a Ready hub is a no-op.
    async fn initialize(&self) -> Result<(), HubError>;

    /// Stream records to one subscriber until the sink fails, `ct` fires,
    /// the subscriber is evicted, or the hub shuts down.
    async fn serve_subscriber(
        &self,
        subscriber_id: String,
        sink: Box<dyn EventSink>,
        ct: CancellationToken,
    ) -> Result<(), HubError>;

    /// Event published by a remote client. The broadcast runs in the background.
    async fn receive_payload(&self, payload: Vec<u8>) -> Result<(), HubError>;

    fn shutdown(&self);
}

struct HubSubscriber {
    connections: AtomicUsize,
    /// One permit per record stored for this subscriber since its last fetch
    wake: Semaphore,
    evicted: CancellationToken,
}

impl HubSubscriber {
    fn new(hub_shutdown: &CancellationToken) -> Self {
        Self {
            connections: AtomicUsize::new(0),
            wake: Semaphore::new(0),
            evicted: hub_shutdown.child_token(),
        }
    }

    fn is_connected(&self) -> bool {
        self.connections.load(Ordering::Acquire) > 0
    }
}

struct HubInner {
    event_type: &'static str,
    config: HubConfig,
    storage: Arc<dyn StorageProvider>,
    errors: Arc<dyn ErrorReceiver>,
    metrics: Option<Arc<Metrics>>,
    subscribers: DashMap<String, Arc<HubSubscriber>>,
    /// Round-robin cursor: id chosen by the previous broadcast
    last_chosen: Mutex<Option<String>>,
    state: AtomicU8,
    shutdown: CancellationToken,
}

pub struct EventHub<E: Event> {
    inner: Arc<HubInner>,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _event: PhantomData,
        }
    }
}

pub struct EventHubBuilder<E: Event> {
    storage: Arc<dyn StorageProvider>,
    config: HubConfig,
    errors: Arc<dyn ErrorReceiver>,
    metrics: Option<Arc<Metrics>>,
    shutdown: CancellationToken,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event> EventHubBuilder<E> {
    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn error_receiver(mut self, errors: Arc<dyn ErrorReceiver>) -> Self {
        self.errors = errors;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The hub stops when `parent` is cancelled
    pub fn shutdown_token(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    pub fn build(self) -> EventHub<E> {
        EventHub {
            inner: Arc::new(HubInner {
                event_type: E::event_type(),
                config: self.config,
                storage: self.storage,
                errors: self.errors,
                metrics: self.metrics,
                subscribers: DashMap::new(),
                last_chosen: Mutex::new(None),
                state: AtomicU8::new(HubState::Uninitialized.as_u8()),
                shutdown: self.shutdown,
            }),
            _event: PhantomData,
        }
    }
}

impl<E: Event> EventHub<E> {
    pub fn builder(storage: Arc<dyn StorageProvider>) -> EventHubBuilder<E> {
        EventHubBuilder {
            storage,
            config: HubConfig::default(),
            errors: Arc::new(NoopErrorReceiver),
            metrics: None,
            shutdown: CancellationToken::new(),
            _event: PhantomData,
        }
    }

    pub fn new(storage: Arc<dyn StorageProvider>, config: HubConfig) -> Self {
        Self::builder(storage).config(config).build()
    }

    pub fn mode(&self) -> HubMode {
        self.inner.config.mode
    }

    /// Known subscriber ids, sorted
    pub fn subscriber_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.subscribers.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_connected(&self, subscriber_id: &str) -> bool {
        self.inner
            .subscribers
            .get(subscriber_id)
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    /// Local publish, available in every mode
    pub fn publish(&self, event: E) -> JoinHandle<()> {
        self.broadcast(event)
    }

    /// Fire-and-forget broadcast. Never fails; problems go to the error
    /// receiver and the log.
    pub fn broadcast(&self, event: E) -> JoinHandle<()> {
        let hub = self.clone();

        tokio::spawn(async move {
            let event_type = hub.inner.event_type;

            if let Err(panic) = AssertUnwindSafe(hub.broadcast_event_task(event)).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());

                tracing::error!(event_type = event_type, panic = %message, "Broadcast task panicked");
            }
        })
    }

    /// Broadcast body; completes once the records are stored and targets woken
    pub async fn broadcast_event_task(&self, event: E) {
        let payload = match serialize_event(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(event_type = self.inner.event_type, error = %e, "Failed to serialize event");
                self.inner.errors.on_serialize_failure(self.inner.event_type, &e);
                return;
            }
        };

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_published(self.inner.event_type);
        }

        self.inner.broadcast_payload(payload).await;
    }
}

#[async_trait]
impl<E: Event> HubEndpoint for EventHub<E> {
    fn event_type(&self) -> &'static str {
        self.inner.event_type
    }

    fn state(&self) -> HubState {
        self.inner.state()
    }

    fn accepts_external_publish(&self) -> bool {
        self.inner.config.mode.contains(HubMode::EVENT_BROKER)
    }

    async fn initialize(&self) -> Result<(), HubError> {
        self.inner.initialize().await
    }

    async fn serve_subscriber(
        &self,
        subscriber_id: String,
        sink: Box<dyn EventSink>,
        ct: CancellationToken,
    ) -> Result<(), HubError> {
        self.inner.serve(subscriber_id, sink, ct).await
    }

    async fn receive_payload(&self, payload: Vec<u8>) -> Result<(), HubError> {
        if !self.accepts_external_publish() {
            return Err(HubError::PublishNotAllowed {
                event_type: self.inner.event_type.to_string(),
            });
        }

        let event: E = deserialize_event(&payload).map_err(|source| {
            self.inner.errors.on_serialize_failure(self.inner.event_type, &source);
            HubError::Payload {
                event_type: self.inner.event_type.to_string(),
                source,
            }
        })?;

        self.broadcast(event);
        Ok(())
    }

    fn shutdown(&self) {
        tracing::info!(event_type = self.inner.event_type, "Hub shutting down");
        self.inner.shutdown.cancel();
    }
}

impl HubInner {
    fn state(&self) -> HubState {
        HubState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn not_ready(&self) -> HubError {
        HubError::NotReady {
            event_type: self.event_type.to_string(),
        }
    }

    async fn initialize(&self) -> Result<(), HubError> {
        match self.state.compare_exchange(
            HubState::Uninitialized.as_u8(),
            HubState::Initializing.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(current) if HubState::from_u8(current) == HubState::Ready => return Ok(()),
            Err(_) => return Err(self.not_ready()),
        }

        tracing::info!(event_type = self.event_type, "Restoring hub subscribers");

        let restored = tokio::time::timeout(
            self.config.restore_timeout,
            self.storage.restore_subscriber_ids(self.event_type),
        )
        .await;

        let ids = match restored {
            Ok(Ok(ids)) => ids,
            Ok(Err(source)) => {
                self.state.store(HubState::Uninitialized.as_u8(), Ordering::Release);
                tracing::error!(event_type = self.event_type, error = %source, "Failed to restore subscribers");
                self.errors
                    .on_restore_failure(self.event_type, &anyhow::Error::msg(source.to_string()));
                return Err(HubError::Restore {
                    event_type: self.event_type.to_string(),
                    source,
                });
            }
            Err(_) => {
                self.state.store(HubState::Uninitialized.as_u8(), Ordering::Release);
                let timeout = self.config.restore_timeout;
                tracing::error!(
                    event_type = self.event_type,
                    timeout_secs = timeout.as_secs(),
                    "Timed out restoring subscribers"
                );
                self.errors.on_restore_failure(
                    self.event_type,
                    &anyhow::anyhow!("restore timed out after {:?}", timeout),
                );
                return Err(HubError::RestoreTimeout {
                    event_type: self.event_type.to_string(),
                    timeout,
                });
            }
        };

        let restored_count = ids.len();
        for id in ids {
            self.subscribers
                .entry(id)
                .or_insert_with(|| Arc::new(HubSubscriber::new(&self.shutdown)));
        }

        self.state.store(HubState::Ready.as_u8(), Ordering::Release);

        tokio::spawn(run_purge_loop(
            "hub",
            self.storage.clone(),
            self.errors.clone(),
            self.config.purge_interval,
            self.shutdown.child_token(),
        ));

        tracing::info!(
            event_type = self.event_type,
            restored = restored_count,
            mode = self.config.mode.bits(),
            "Hub ready"
        );

        Ok(())
    }

    async fn serve(&self, subscriber_id: String, mut sink: Box<dyn EventSink>, ct: CancellationToken) -> Result<(), HubError> {
        if self.state() != HubState::Ready {
            return Err(self.not_ready());
        }

        let subscriber = self
            .subscribers
            .entry(subscriber_id.clone())
            .or_insert_with(|| Arc::new(HubSubscriber::new(&self.shutdown)))
            .value()
            .clone();

        // Stops on eviction or hub shutdown (parent) as well as on `ct`
        let stop = subscriber.evicted.child_token();
        let watcher = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = ct.cancelled() => stop.cancel(),
                    _ = stop.cancelled() => {}
                }
            })
        };

        subscriber.connections.fetch_add(1, Ordering::AcqRel);
        if let Some(metrics) = &self.metrics {
            metrics.subscriber_connected(self.event_type);
        }
        tracing::info!(subscriber_id = %subscriber_id, event_type = self.event_type, "Subscriber connected");

        self.stream_records(&subscriber_id, &subscriber, sink.as_mut(), &stop).await;

        subscriber.connections.fetch_sub(1, Ordering::AcqRel);
        if let Some(metrics) = &self.metrics {
            metrics.subscriber_disconnected(self.event_type);
        }
        stop.cancel();
        let _ = watcher.await;

        tracing::info!(subscriber_id = %subscriber_id, event_type = self.event_type, "Subscriber disconnected");
        Ok(())
    }

    async fn stream_records(
        &self,
        subscriber_id: &str,
        subscriber: &HubSubscriber,
        sink: &mut dyn EventSink,
        stop: &CancellationToken,
    ) {
        let in_memory = self.storage.is_in_memory();
        let mut failures = 0u32;

        while !stop.is_cancelled() {
            let batch = match self
                .storage
                .get_next_batch(subscriber_id, self.event_type, self.config.batch_size)
                .await
            {
                Ok(batch) => {
                    failures = 0;
                    batch
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        subscriber_id = %subscriber_id,
                        event_type = self.event_type,
                        attempt = failures,
                        error = %e,
                        "Failed to fetch records for subscriber"
                    );
                    self.errors.on_retrieve_failure(self.event_type, subscriber_id, failures, &e);
                    if !sleep_or_cancelled(self.config.retry_delay, stop).await {
                        return;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                self.wait_for_wake(subscriber, stop).await;
                continue;
            }

            tracing::debug!(subscriber_id = %subscriber_id, count = batch.len(), "Streaming batch");

            let mut records = batch.into_iter();
            while let Some(record) = records.next() {
                if sink.write(&record.event).await.is_err() {
                    if in_memory {
                        // Already dequeued, hand the rest back
                        let unsent: Vec<EventStorageRecord> = std::iter::once(record).chain(records).collect();
                        self.requeue(unsent).await;
                    }
                    tracing::debug!(subscriber_id = %subscriber_id, "Subscriber stream closed");
                    return;
                }

                if let Some(metrics) = &self.metrics {
                    metrics.record_delivered(self.event_type);
                }

                if !in_memory {
                    self.mark_complete(&record, stop).await;
                }
            }
        }
    }

    async fn wait_for_wake(&self, subscriber: &HubSubscriber, stop: &CancellationToken) {
        tokio::select! {
            _ = stop.cancelled() => {}
            acquired = tokio::time::timeout(self.config.idle_wait, subscriber.wake.acquire()) => {
                if let Ok(Ok(permit)) = acquired {
                    permit.forget();
                }

                // The next fetch picks up everything stored so far
                let pending = subscriber.wake.available_permits();
                if pending > 0 {
                    if let Ok(permits) = subscriber.wake.try_acquire_many(pending as u32) {
                        permits.forget();
                    }
                }
            }
        }
    }

    async fn mark_complete(&self, record: &EventStorageRecord, stop: &CancellationToken) {
        let storage = &self.storage;
        let errors = &self.errors;

        retry_until_cancelled(
            self.config.retry_delay,
            stop,
            move |_attempt| storage.mark_complete(record),
            |attempt, e| errors.on_mark_complete_failure(record, attempt, e),
        )
        .await;
    }

    /// Hands records that were dequeued but never written back to storage
    async fn requeue(&self, records: Vec<EventStorageRecord>) {
        let count = records.len();
        if self.store_records(records).await.is_some() {
            tracing::debug!(event_type = self.event_type, count = count, "Returned undelivered records");
        }
    }

    async fn broadcast_payload(&self, payload: Vec<u8>) {
        let Some(targets) = self.wait_for_targets().await else {
            tracing::warn!(event_type = self.event_type, "No subscribers for event, dropping it");
            return;
        };

        let records: Vec<EventStorageRecord> = targets
            .iter()
            .map(|id| EventStorageRecord::new(id.as_str(), self.event_type, payload.clone(), self.config.record_ttl))
            .collect();

        let Some(overflowed) = self.store_records(records).await else {
            tracing::debug!(event_type = self.event_type, "Broadcast abandoned on shutdown");
            return;
        };

        tracing::debug!(
            event_type = self.event_type,
            targets = targets.len(),
            overflowed = overflowed.len(),
            "Broadcast stored"
        );
    }

    /// Stores `records` and wakes their subscribers.
    ///
    /// Backend failures are retried every `retry_delay`. Records refused by a
    /// full queue are stored again once the subscriber has had time to drain
    /// it; subscribers whose queue overflowed are evicted and their records
    /// dropped. Returns the evicted ids, or None when the hub shut down first.
    async fn store_records(&self, mut pending: Vec<EventStorageRecord>) -> Option<Vec<String>> {
        let mut overflowed: Vec<String> = Vec::new();
        let mut failures = 0u32;

        loop {
            let result = self.storage.store_events(pending.clone()).await;

            let stored = pending
                .iter()
                .map(|r| r.subscriber_id.as_str())
                .filter(|id| result.as_ref().err().map_or(true, |e| !e.rejects(id)));
            for id in stored {
                if let Some(subscriber) = self.subscribers.get(id) {
                    subscriber.wake.add_permits(1);
                }
            }

            match result {
                Ok(()) => return Some(overflowed),
                Err(StorageError::Rejected { overflowed: stale, full }) => {
                    for id in &stale {
                        self.evict(id);
                    }
                    overflowed.extend(stale);

                    pending.retain(|r| full.contains(&r.subscriber_id));
                    if pending.is_empty() {
                        return Some(overflowed);
                    }
                    tracing::debug!(
                        event_type = self.event_type,
                        subscribers = ?full,
                        "Subscriber queues full, storing again after delay"
                    );
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        event_type = self.event_type,
                        attempt = failures,
                        count = pending.len(),
                        error = %e,
                        "Failed to store records"
                    );
                    self.errors.on_store_failure(self.event_type, &pending, failures, &e);
                }
            }

            if !sleep_or_cancelled(self.config.retry_delay, &self.shutdown).await {
                return None;
            }
        }
    }

    /// Polls for targets until one appears or `broadcast_wait` runs out
    async fn wait_for_targets(&self) -> Option<Vec<String>> {
        let deadline = Instant::now() + self.config.broadcast_wait;

        loop {
            let targets = self.choose_targets();
            if !targets.is_empty() {
                return Some(targets);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let pause = self.config.broadcast_poll_interval.min(deadline - now);
            if !sleep_or_cancelled(pause, &self.shutdown).await {
                return None;
            }
        }
    }

    fn choose_targets(&self) -> Vec<String> {
        if self.state() != HubState::Ready {
            return Vec::new();
        }

        if self.config.mode.contains(HubMode::ROUND_ROBIN) {
            self.next_round_robin().into_iter().collect()
        } else {
            self.subscribers.iter().map(|s| s.key().clone()).collect()
        }
    }

    /// Next connected id after the previous pick in id order, wrapping around.
    /// With two or more candidates the same id is never chosen twice in a row.
    fn next_round_robin(&self) -> Option<String> {
        let mut connected: Vec<String> = self
            .subscribers
            .iter()
            .filter(|s| s.value().is_connected())
            .map(|s| s.key().clone())
            .collect();

        if connected.is_empty() {
            return None;
        }
        connected.sort();

        let mut last = self.last_chosen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let chosen = match last.as_deref() {
            Some(previous) => connected
                .iter()
                .find(|id| id.as_str() > previous)
                .unwrap_or(&connected[0])
                .clone(),
            None => connected[0].clone(),
        };

        *last = Some(chosen.clone());
        Some(chosen)
    }

    fn evict(&self, subscriber_id: &str) {
        if let Some((_, subscriber)) = self.subscribers.remove(subscriber_id) {
            subscriber.evicted.cancel();
        }

        tracing::warn!(
            subscriber_id = %subscriber_id,
            event_type = self.event_type,
            "Subscriber queue overflowed, removing subscriber"
        );
        self.errors.on_overflow(self.event_type, subscriber_id);
    }
}
