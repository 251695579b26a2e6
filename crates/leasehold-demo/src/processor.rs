use crate::config::DemoConfig;
use core::time::Duration;
use leasehold::{CancellationToken, Handler, InFlightMessage};
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{collections::HashSet, sync::Arc};

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub acked: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
}

/// Demo handler: simulates work, acknowledges, and stops the subscription
/// once every published message has been acknowledged.
pub struct Processor {
    stats: Arc<ProcessorStats>,
    handler_time: Duration,
    skip_every: u64,
    total: u64,
    // Messages whose first delivery was deliberately left unacknowledged.
    skipped: Arc<Mutex<HashSet<u64>>>,
    done: CancellationToken,
}

impl Processor {
    pub fn new(config: &DemoConfig, done: CancellationToken) -> Self {
        Self {
            stats: Arc::default(),
            handler_time: config.handler_time,
            skip_every: config.skip_every,
            total: config.message_count,
            skipped: Arc::default(),
            done,
        }
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    /// Returns `true` the first time a message selected for skipping shows
    /// up.
    fn should_skip(&self, message: &InFlightMessage) -> bool {
        if self.skip_every == 0 {
            return false;
        }
        let Some(index) = parse_index(message.body()) else {
            return false;
        };
        index % self.skip_every == 0 && self.skipped.lock().insert(index)
    }
}

impl Handler for Processor {
    fn handle(
        &self,
        _token: CancellationToken,
        message: InFlightMessage,
    ) -> impl Future<Output = ()> + Send {
        let skip = self.should_skip(&message);
        let stats = Arc::clone(&self.stats);
        let handler_time = self.handler_time;
        let total = self.total;
        let done = self.done.clone();

        async move {
            tokio::time::sleep(handler_time).await;

            if skip {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Leaving {} from group {} for redelivery",
                    message.receipt(),
                    message.group_id()
                );
                return;
            }

            match message.ack().await {
                Ok(()) => {
                    if stats.acked.fetch_add(1, Ordering::Relaxed) + 1 == total {
                        #[cfg(feature = "tracing")]
                        tracing::info!("All {total} messages acknowledged");
                        done.cancel();
                    }
                }
                Err(_e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "tracing")]
                    tracing::error!("Acknowledgment failed: {_e}");
                }
            }
        }
    }
}

fn parse_index(body: &[u8]) -> Option<u64> {
    core::str::from_utf8(body).ok()?.parse().ok()
}
