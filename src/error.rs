use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::client::ClientError;
use crate::cluster::ClusterError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient back-pressure or contention).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the canonical capability errors; callers that care
/// about a specific failure match on the inner variant.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Client(e) => e.transience(),
            Error::Cluster(e) => e.transience(),
        }
    }
}

/// Sink for errors surfaced outside a caller's stack frame.
pub type ErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

/// Error sink paired with a counter, so operators can watch the error rate
/// without parsing logs.
#[derive(Clone)]
pub struct CountedErrorHandler {
    sink: ErrorSink,
    count: Arc<AtomicU64>,
}

impl CountedErrorHandler {
    pub fn new(sink: ErrorSink) -> Self {
        Self {
            sink,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn on_error(&self, error: &Error) {
        self.count.fetch_add(1, Ordering::Relaxed);
        (self.sink)(error);
    }

    pub fn error_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for CountedErrorHandler {
    fn default() -> Self {
        Self::new(Arc::new(|error| {
            tracing::error!("unhandled agent error: {error}");
        }))
    }
}

impl std::fmt::Debug for CountedErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountedErrorHandler")
            .field("count", &self.error_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn counted_handler_counts_and_forwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let handler = CountedErrorHandler::new(Arc::new(move |e: &Error| {
            sink_seen.lock().unwrap().push(e.to_string());
        }));

        handler.on_error(&Error::Client(ClientError::ClientClosed));
        handler.on_error(&Error::Client(ClientError::ClientClosed));

        assert_eq!(handler.error_count(), 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn transience_classification() {
        assert_eq!(
            Error::Client(ClientError::ClientClosed).transience(),
            Transience::Permanent
        );
        assert!(
            Error::Cluster(ClusterError::UnableToAppend { event: "timer" })
                .transience()
                .is_retryable()
        );
    }
}
