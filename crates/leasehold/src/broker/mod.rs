//! The public facade: publishing messages and running subscriptions.
//!
//! A subscription session wires three pieces together:
//!
//! - a `Poller` that long-polls the backend while
//!   concurrency slots are free,
//! - a `WorkerPool` of `max_messages` workers that hand
//!   messages to the [`Handler`],
//! - an `ErrorSink` whose first report cancels the session token and
//!   becomes the result of [`Broker::subscribe`].
//!
//! The session token is a child of the caller's token, so cancelling the
//! caller's token stops the session without an error, while a fatal error
//! stops the session without touching the caller's token.

mod handler;
mod poller;
mod pool;

pub use handler::Handler;

use crate::{QueueService, Result, SubscriptionConfig, signal::ErrorSink, telemetry};
use bytes::Bytes;
use poller::Poller;
use pool::WorkerPool;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// Consumer and producer front end over a [`QueueService`].
///
/// Cloning is cheap; clones share the same backend.
pub struct Broker<Q> {
    service: Arc<Q>,
}

impl<Q> Clone for Broker<Q> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

impl<Q: QueueService> Broker<Q> {
    pub fn new(service: Q) -> Self {
        Self::from_arc(Arc::new(service))
    }

    /// Creates a broker over a backend that is shared with other owners.
    pub const fn from_arc(service: Arc<Q>) -> Self {
        Self { service }
    }

    /// The backend this broker talks to.
    pub fn service(&self) -> &Q {
        &self.service
    }

    /// Sends one message tagged with `group_id` to `queue`.
    ///
    /// # Errors
    ///
    /// Returns the backend's error unchanged.
    pub async fn publish(
        &self,
        queue: &str,
        group_id: &str,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        let result = self.service.send(queue, group_id, body.into()).await;
        #[cfg(feature = "tracing")]
        if let Err(e) = &result {
            tracing::warn!("Publish to {queue} failed: {e}");
        }
        result
    }

    /// Consumes `config.queue` until `cancel` fires or a fatal error occurs.
    ///
    /// Up to `config.max_messages` messages are handed to `handler`
    /// concurrently. Each message keeps its lease alive through a heartbeat
    /// until the handler acknowledges it or returns.
    ///
    /// # Shutdown
    ///
    /// Either way, no receive is issued once shutdown has begun, running
    /// handlers are awaited rather than interrupted, and every worker has
    /// exited before this returns. Messages that were received but never
    /// reached a handler are abandoned and will be redelivered by the
    /// backend.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `config` fails validation. Nothing is
    ///   started in that case.
    /// - The first fatal error of the session: a failed receive, delete, or
    ///   lease extension, or a panicking handler. The error wins even if
    ///   `cancel` fired at the same time.
    ///
    /// Returns `Ok(())` when the session ended only because `cancel` fired.
    ///
    /// [`Error::InvalidConfig`]: crate::Error::InvalidConfig
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(
            skip_all,
            fields(queue = %config.queue, max_messages = config.max_messages)
        )
    )]
    pub async fn subscribe<H: Handler>(
        &self,
        cancel: CancellationToken,
        config: SubscriptionConfig,
        handler: H,
    ) -> Result<()> {
        config.validate()?;

        let max_messages = config.max_messages;
        let config = Arc::new(config);
        let token = cancel.child_token();
        // One slot per possible reporter: the poller plus every in-flight
        // message. Later reports are dropped once a slot is taken anyway.
        let (sink, mut errors) = ErrorSink::channel(max_messages + 1, token.clone());
        let permits = Arc::new(Semaphore::new(max_messages));
        let (tx, rx) = mpsc::channel(max_messages);
        let deliveries = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);

        #[cfg(feature = "tracing")]
        tracing::info!("Subscription started");

        let pool = WorkerPool::spawn(max_messages, &deliveries, &handler, &token);
        let poller = tokio::spawn(in_current_span(
            Poller {
                service: Arc::clone(&self.service),
                config,
                permits,
                deliveries: tx,
                sink: sink.clone(),
            }
            .run(),
        ));

        let poller_done = async {
            if let Err(e) = poller.await {
                #[cfg(feature = "tracing")]
                tracing::error!("Poller failed: {e}");
                sink.report(crate::Error::WorkerPanicked {
                    context: format!("poller: {e}"),
                });
            }
        };
        tokio::join!(pool.join(&sink), poller_done);

        // Nothing reads the channel anymore. Dropping what is left stops
        // the heartbeats and lets the leases lapse.
        let mut rx = deliveries.lock().await;
        rx.close();
        let mut _abandoned = 0usize;
        while let Ok(delivery) = rx.try_recv() {
            drop(delivery);
            _abandoned += 1;
        }
        #[cfg(feature = "tracing")]
        if _abandoned > 0 {
            tracing::debug!("Abandoned {_abandoned} undelivered messages");
        }

        match errors.try_recv() {
            Ok(e) => {
                telemetry::increment_subscription_errors();
                #[cfg(feature = "tracing")]
                tracing::error!("Subscription failed: {e}");
                Err(e)
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Subscription stopped");
                Ok(())
            }
        }
    }
}

#[cfg(feature = "tracing")]
pub(crate) fn in_current_span<F: Future>(fut: F) -> tracing::instrument::Instrumented<F> {
    use tracing::Instrument;
    fut.in_current_span()
}

#[cfg(not(feature = "tracing"))]
pub(crate) fn in_current_span<F: Future>(fut: F) -> F {
    fut
}
