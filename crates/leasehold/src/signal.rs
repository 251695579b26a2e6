use crate::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Non-blocking reporter of fatal errors for one subscription.
///
/// Every report cancels the subscription token, which is the stop signal
/// observed by the poller and the workers. The error itself is parked in a
/// bounded channel sized to the number of possible reporters; when it is
/// full an earlier error is already pending and the new one is dropped, so
/// the first report always wins.
#[derive(Clone, Debug)]
pub(crate) struct ErrorSink {
    tx: mpsc::Sender<Error>,
    token: CancellationToken,
}

impl ErrorSink {
    pub(crate) fn channel(
        capacity: usize,
        token: CancellationToken,
    ) -> (Self, mpsc::Receiver<Error>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, token }, rx)
    }

    pub(crate) fn report(&self, err: Error) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(_err)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Dropping error, another one is already pending: {_err}");
            }
            Err(TrySendError::Closed(_err)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Dropping error reported after teardown: {_err}");
            }
        }
        self.token.cancel();
    }

    pub(crate) const fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operation;

    #[tokio::test]
    async fn first_report_wins_and_cancels() {
        let token = CancellationToken::new();
        let (sink, mut rx) = ErrorSink::channel(1, token.clone());

        sink.report(Error::transport(Operation::Receive, "first"));
        sink.report(Error::transport(Operation::Receive, "second"));

        assert!(token.is_cancelled());
        assert_eq!(
            rx.try_recv().unwrap(),
            Error::transport(Operation::Receive, "first")
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reporting_after_receiver_drop_still_cancels() {
        let token = CancellationToken::new();
        let (sink, rx) = ErrorSink::channel(4, token.clone());
        drop(rx);

        sink.report(Error::Cancelled);
        assert!(token.is_cancelled());
    }
}
