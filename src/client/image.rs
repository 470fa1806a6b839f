//! Per-remote-source view of a subscribed stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::concurrent::counters::Position;
use crate::concurrent::ring::FrameQueue;

use super::log_buffers::LogBuffers;

/// Outcome of a controlled fragment handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlledPollAction {
    /// Consume the fragment and continue polling.
    Continue,
    /// Leave the fragment in place; it is redelivered on the next poll.
    Abort,
}

pub(crate) struct ImageInner {
    correlation_id: i64,
    session_id: i32,
    subscription_registration_id: i64,
    source_identity: String,
    subscriber_position: Position,
    log_buffers: Arc<LogBuffers>,
    terms: FrameQueue,
    closed: AtomicBool,
}

/// A receive handle onto one remote publication. Polling is single-consumer:
/// only the owning agent thread reads.
#[derive(Clone)]
pub struct Image {
    pub(crate) inner: Arc<ImageInner>,
}

impl Image {
    pub(crate) fn new(
        correlation_id: i64,
        session_id: i32,
        subscription_registration_id: i64,
        source_identity: String,
        subscriber_position: Position,
        log_buffers: Arc<LogBuffers>,
    ) -> Self {
        let terms = log_buffers.terms();
        Self {
            inner: Arc::new(ImageInner {
                correlation_id,
                session_id,
                subscription_registration_id,
                source_identity,
                subscriber_position,
                log_buffers,
                terms,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn correlation_id(&self) -> i64 {
        self.inner.correlation_id
    }

    pub fn session_id(&self) -> i32 {
        self.inner.session_id
    }

    pub fn subscription_registration_id(&self) -> i64 {
        self.inner.subscription_registration_id
    }

    pub fn source_identity(&self) -> &str {
        &self.inner.source_identity
    }

    pub fn position(&self) -> i64 {
        self.inner.subscriber_position.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn log_buffers(&self) -> &Arc<LogBuffers> {
        &self.inner.log_buffers
    }

    /// Consume up to `limit` fragments.
    pub fn poll(&self, handler: &mut dyn FnMut(&Bytes), limit: usize) -> usize {
        let mut fragments = 0;
        while fragments < limit && !self.is_closed() {
            match self.inner.terms.pop() {
                Some(frame) => {
                    self.advance(frame.len());
                    handler(&frame);
                    fragments += 1;
                }
                None => break,
            }
        }
        fragments
    }

    /// Poll with per-fragment flow control. An `Abort` leaves the fragment
    /// at the head so the exact same fragment is redelivered next poll.
    /// Returns fragments consumed and whether the handler aborted.
    pub fn controlled_poll(
        &self,
        handler: &mut dyn FnMut(&Bytes) -> ControlledPollAction,
        limit: usize,
    ) -> (usize, bool) {
        let mut fragments = 0;
        while fragments < limit && !self.is_closed() {
            let Some(frame) = self.inner.terms.peek() else {
                break;
            };
            match handler(&frame) {
                ControlledPollAction::Continue => {
                    self.inner.terms.pop();
                    self.advance(frame.len());
                    fragments += 1;
                }
                ControlledPollAction::Abort => return (fragments, true),
            }
        }
        (fragments, false)
    }

    fn advance(&self, length: usize) {
        let position = self.inner.subscriber_position.get();
        self.inner.subscriber_position.set(position + length as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::log_buffers::LogBufferCache;
    use crate::concurrent::counters::CountersBuffer;
    use crate::testing::TestLogBuffersFactory;

    fn image() -> (Image, FrameQueue) {
        let counters = CountersBuffer::new(2);
        let factory = TestLogBuffersFactory::new();
        let terms = factory.terms("img-log");
        let mut cache = LogBufferCache::new(Arc::new(factory));
        let log_buffers = cache.acquire(31, "img-log").unwrap();

        let image = Image::new(
            31,
            5,
            11,
            "ipc:remote".to_string(),
            Position::new(counters, 0),
            log_buffers,
        );
        (image, terms)
    }

    #[test]
    fn poll_consumes_and_advances_position() {
        let (image, terms) = image();
        terms.offer(Bytes::from_static(b"abc"));
        terms.offer(Bytes::from_static(b"defg"));

        let mut seen = Vec::new();
        let consumed = image.poll(&mut |frame| seen.push(frame.clone()), 10);
        assert_eq!(consumed, 2);
        assert_eq!(image.position(), 7);
        assert_eq!(seen[0], Bytes::from_static(b"abc"));
    }

    #[test]
    fn controlled_poll_abort_redelivers_same_fragment() {
        let (image, terms) = image();
        terms.offer(Bytes::from_static(b"one"));
        terms.offer(Bytes::from_static(b"two"));

        let (consumed, aborted) = image.controlled_poll(
            &mut |frame| {
                if frame.as_ref() == b"two" {
                    ControlledPollAction::Abort
                } else {
                    ControlledPollAction::Continue
                }
            },
            10,
        );
        assert_eq!(consumed, 1);
        assert!(aborted);
        assert_eq!(image.position(), 3);

        // The aborted fragment is still at the head.
        let (consumed, aborted) =
            image.controlled_poll(&mut |_| ControlledPollAction::Continue, 10);
        assert_eq!(consumed, 1);
        assert!(!aborted);
        assert_eq!(image.position(), 6);
    }
}
