//! Fixed-size pool of workers consuming [`Delivery`]s.
//!
//! All workers pull from one shared bounded channel, so a message goes to
//! whichever worker is idle first and never to more than one. The shared
//! [`CancellationToken`] is the stop signal: a worker finishes the handler it
//! is running, then exits.

use super::{handler::Handler, poller::Delivery};
use crate::{Error, signal::ErrorSink, telemetry};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

pub(crate) type SharedDeliveries = Arc<Mutex<mpsc::Receiver<Delivery>>>;

pub(crate) struct WorkerPool {
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawns `size` workers. Must be called within a tokio runtime.
    pub(crate) fn spawn<H: Handler>(
        size: usize,
        deliveries: &SharedDeliveries,
        handler: &Arc<H>,
        token: &CancellationToken,
    ) -> Self {
        let mut workers = JoinSet::new();
        for worker_id in 0..size {
            workers.spawn(super::in_current_span(worker_loop(
                worker_id,
                Arc::clone(deliveries),
                Arc::clone(handler),
                token.clone(),
            )));
        }
        Self { workers }
    }

    /// Waits for every worker to exit.
    ///
    /// A worker that panicked is reported to `sink` as
    /// [`Error::WorkerPanicked`], which also stops the remaining workers.
    pub(crate) async fn join(mut self, sink: &ErrorSink) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                #[cfg(feature = "tracing")]
                tracing::error!("Worker failed: {e}");
                sink.report(Error::WorkerPanicked {
                    context: e.to_string(),
                });
            }
        }
    }
}

/// Worker task: hands deliveries to the handler until the token is
/// cancelled.
///
/// The concurrency slot of a delivery is released only after the handler
/// returns, whether or not the message was acknowledged, or when the handler
/// panics.
pub(crate) async fn worker_loop<H: Handler>(
    _worker_id: usize,
    deliveries: SharedDeliveries,
    handler: Arc<H>,
    token: CancellationToken,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} started");

    loop {
        let next = {
            let mut rx = tokio::select! {
                biased;
                () = token.cancelled() => break,
                rx = deliveries.lock() => rx,
            };
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                next = rx.recv() => next,
            }
        };

        let Some(Delivery { message, slot }) = next else {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker {_worker_id} found the delivery channel closed");
            break;
        };

        let start = Instant::now();
        handler.handle(token.clone(), message).await;
        telemetry::record_handler_duration(start.elapsed().as_secs_f64() * 1000.0);
        drop(slot);
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} stopped");
}
