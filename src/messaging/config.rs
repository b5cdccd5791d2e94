use std::ops::BitOr;
use std::time::Duration;

// ============================================================================
// Hub & Subscriber Configuration
// ============================================================================

/// Hub behaviour flags, combined with `|`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HubMode(u8);

impl HubMode {
    /// Local publish only
    pub const EVENT_PUBLISHER: HubMode = HubMode(0b001);
    /// Also accepts events published by remote clients
    pub const EVENT_BROKER: HubMode = HubMode(0b010);
    /// Each event goes to exactly one connected subscriber
    pub const ROUND_ROBIN: HubMode = HubMode(0b100);

    pub const fn contains(self, other: HubMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl Default for HubMode {
    fn default() -> Self {
        HubMode::EVENT_PUBLISHER
    }
}

impl BitOr for HubMode {
    type Output = HubMode;

    fn bitor(self, rhs: HubMode) -> HubMode {
        HubMode(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub mode: HubMode,
    /// Records fetched per round trip to storage while streaming to a subscriber
    pub batch_size: usize,
    /// Lifetime of a hub-side record before it is dropped undelivered
    pub record_ttl: Duration,
    /// Delay after a failed storage call
    pub retry_delay: Duration,
    /// How long a broadcast waits for a first target to appear
    pub broadcast_wait: Duration,
    pub broadcast_poll_interval: Duration,
    /// Upper bound on waiting for new records while a subscriber is connected
    pub idle_wait: Duration,
    pub restore_timeout: Duration,
    pub purge_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mode: HubMode::default(),
            batch_size: 25,
            record_ttl: Duration::from_secs(4 * 60 * 60),
            retry_delay: Duration::from_secs(5),
            broadcast_wait: Duration::from_secs(60),
            broadcast_poll_interval: Duration::from_secs(5),
            idle_wait: Duration::from_secs(60),
            restore_timeout: Duration::from_secs(30),
            purge_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl HubConfig {
    /// Accepts remote publishers as well as local ones
    pub fn broker() -> Self {
        Self {
            mode: HubMode::EVENT_PUBLISHER | HubMode::EVENT_BROKER,
            ..Default::default()
        }
    }

    /// Work distribution: one subscriber per event
    pub fn round_robin() -> Self {
        Self {
            mode: HubMode::EVENT_PUBLISHER | HubMode::ROUND_ROBIN,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: HubMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    /// Records executed concurrently per batch
    pub batch_size: usize,
    pub record_ttl: Duration,
    pub retry_delay: Duration,
    /// Upper bound on waiting for new records when nothing is pending
    pub idle_wait: Duration,
    pub purge_interval: Duration,
    /// Separates several processes on one host
    pub client_id: Option<String>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            batch_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            record_ttl: Duration::from_secs(4 * 60 * 60),
            retry_delay: Duration::from_secs(5),
            idle_wait: Duration::from_secs(10),
            purge_interval: Duration::from_secs(60 * 60),
            client_id: None,
        }
    }
}

impl SubscriberConfig {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags_combine() {
        let mode = HubMode::EVENT_BROKER | HubMode::ROUND_ROBIN;

        assert!(mode.contains(HubMode::EVENT_BROKER));
        assert!(mode.contains(HubMode::ROUND_ROBIN));
        assert!(!mode.contains(HubMode::EVENT_PUBLISHER));
        assert!(HubMode::default().contains(HubMode::EVENT_PUBLISHER));
    }

    #[test]
    fn test_defaults() {
        let hub = HubConfig::default();
        assert_eq!(hub.batch_size, 25);
        assert_eq!(hub.restore_timeout, Duration::from_secs(30));
        assert!(!hub.mode.contains(HubMode::EVENT_BROKER));

        let subscriber = SubscriberConfig::default();
        assert!(subscriber.batch_size >= 1);
        assert_eq!(subscriber.idle_wait, Duration::from_secs(10));
        assert!(HubConfig::broker().mode.contains(HubMode::EVENT_BROKER));
    }
}
