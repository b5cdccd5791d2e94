use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::errors::ErrorReceiver;
use crate::storage::StorageProvider;

/// Periodic `purge_stale` sweep, first run one `interval` after start
pub(crate) async fn run_purge_loop(
    owner: &'static str,
    storage: Arc<dyn StorageProvider>,
    errors: Arc<dyn ErrorReceiver>,
    interval: Duration,
    ct: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ct.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tracing::debug!(owner = owner, "Purging stale records");

        if let Err(e) = storage.purge_stale().await {
            tracing::warn!(owner = owner, error = %e, "Purge failed");
            errors.on_purge_failure(&e);
        }
    }

    tracing::debug!(owner = owner, "Purge loop stopped");
}
