use crate::{Error, Result};
use core::time::Duration;

/// Largest batch a single long poll asks for unless configured otherwise.
pub const DEFAULT_MAX_BATCH: usize = 10;
/// How long a single receive request may wait for messages to arrive.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(15);
/// Lease granted by the backend when a message is first received.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
/// Time between two lease extensions of an unacknowledged message.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
/// Lease requested by each heartbeat. Must exceed the interval.
pub const DEFAULT_HEARTBEAT_EXTENSION: Duration = Duration::from_secs(30);

/// Runtime configuration for a single [`Broker::subscribe`] call.
///
/// `queue` and `max_messages` are the only required values; everything else
/// falls back to defaults suited to long-polling backends. The value is
/// immutable once handed to `subscribe`.
///
/// [`Broker::subscribe`]: crate::Broker::subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// Queue identifier passed verbatim to the backend.
    pub queue: String,
    /// Ceiling on messages concurrently handed to the handler. Also the
    /// number of workers.
    pub max_messages: usize,
    /// Upper bound on messages requested by one receive call.
    pub batch_size: usize,
    /// Long-poll wait of one receive call.
    pub wait_time: Duration,
    /// Lease requested when receiving.
    pub visibility_timeout: Duration,
    /// Delay between heartbeats.
    pub heartbeat_interval: Duration,
    /// Lease requested by each heartbeat.
    pub heartbeat_extension: Duration,
}

impl SubscriptionConfig {
    pub fn new(queue: impl Into<String>, max_messages: usize) -> Self {
        Self {
            queue: queue.into(),
            max_messages,
            batch_size: max_messages.clamp(1, DEFAULT_MAX_BATCH),
            wait_time: DEFAULT_WAIT_TIME,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_extension: DEFAULT_HEARTBEAT_EXTENSION,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    #[must_use]
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Overrides both heartbeat timings at once since they are only valid as
    /// a pair.
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, extension: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_extension = extension;
        self
    }

    /// Returns the heartbeat timings as a [`HeartbeatPolicy`].
    pub const fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy {
            interval: self.heartbeat_interval,
            extension: self.heartbeat_extension,
        }
    }

    /// Checks the invariants the subscription relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if:
    /// - `queue` is empty
    /// - `max_messages` or `batch_size` is zero
    /// - `max_messages` does not fit a semaphore
    /// - `heartbeat_interval` is zero
    /// - `heartbeat_extension` is not strictly greater than
    ///   `heartbeat_interval`
    /// - `visibility_timeout` is not strictly greater than
    ///   `heartbeat_interval`. A lease equal to the interval (for example
    ///   20 s with a 20 s heartbeat) is rejected: it would lapse exactly when
    ///   the first extension is sent.
    pub fn validate(&self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(invalid("queue must not be empty"));
        }
        if self.max_messages == 0 {
            return Err(invalid("max_messages must be greater than 0"));
        }
        if self.max_messages > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(invalid(format!(
                "max_messages ({}) exceeds the supported maximum ({})",
                self.max_messages,
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be greater than 0"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval must be greater than 0"));
        }
        if self.heartbeat_extension <= self.heartbeat_interval {
            return Err(invalid(format!(
                "heartbeat_extension ({:?}) must exceed heartbeat_interval ({:?})",
                self.heartbeat_extension, self.heartbeat_interval
            )));
        }
        if self.visibility_timeout <= self.heartbeat_interval {
            return Err(invalid(format!(
                "visibility_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.visibility_timeout, self.heartbeat_interval
            )));
        }
        Ok(())
    }
}

/// Timing of the lease heartbeat every in-flight message runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// Wait between the start (or last extension) and the next extension.
    pub interval: Duration,
    /// Lease requested by every extension.
    pub extension: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            extension: DEFAULT_HEARTBEAT_EXTENSION,
        }
    }
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidConfig {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SubscriptionConfig::new("orders", 4);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.heartbeat_policy(), HeartbeatPolicy::default());
        config.validate().unwrap();
    }

    #[test]
    fn batch_size_is_capped_by_default() {
        assert_eq!(SubscriptionConfig::new("q", 64).batch_size, DEFAULT_MAX_BATCH);
    }

    #[test]
    fn rejects_zero_ceiling() {
        let err = SubscriptionConfig::new("q", 0).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn rejects_empty_queue() {
        assert!(SubscriptionConfig::new("", 1).validate().is_err());
    }

    #[test]
    fn rejects_zero_batch() {
        let config = SubscriptionConfig::new("q", 2).with_batch_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn extension_must_outlast_interval() {
        let config = SubscriptionConfig::new("q", 1)
            .with_heartbeat(Duration::from_secs(20), Duration::from_secs(20));
        assert!(config.validate().is_err());

        let config = SubscriptionConfig::new("q", 1)
            .with_heartbeat(Duration::from_secs(20), Duration::from_secs(21));
        config.validate().unwrap();
    }

    #[test]
    fn initial_lease_must_outlast_first_heartbeat() {
        let config =
            SubscriptionConfig::new("q", 1).with_visibility_timeout(Duration::from_secs(20));
        assert!(config.validate().is_err());
    }

    #[test]
    fn lease_equal_to_interval_is_rejected() {
        let config = SubscriptionConfig::new("q", 1)
            .with_visibility_timeout(Duration::from_secs(20))
            .with_heartbeat(Duration::from_secs(20), Duration::from_secs(30));
        let err = config.validate().unwrap_err();
        let Error::InvalidConfig { reason } = &err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(reason.contains("visibility_timeout"));

        let config = config.with_visibility_timeout(Duration::from_secs(21));
        config.validate().unwrap();
    }
}
