//! Send handles bound to a channel and stream id.
//!
//! The term-buffer packing itself lives behind the frame transport; this
//! layer owns position accounting, back-pressure sentinels and the
//! claim-then-commit path the sequencer uses for in-place encoding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};

use crate::concurrent::counters::{Position, StatusIndicator};
use crate::concurrent::ring::FrameQueue;

use super::log_buffers::LogBuffers;
use super::{Client, ClientError};

/// Sentinel results for `offer` and `try_claim`.
pub const NOT_CONNECTED: i64 = -1;
pub const BACK_PRESSURED: i64 = -2;
pub const ADMIN_ACTION: i64 = -3;
pub const CLOSED: i64 = -4;

/// Frames advance the publisher position in aligned units.
const FRAME_ALIGNMENT: u64 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublicationKind {
    /// Many writers; shared per (channel, stream id) within one client.
    Shared,
    /// Single writer; every add returns a distinct publication.
    Exclusive,
}

pub(crate) struct PublicationInner {
    channel: String,
    stream_id: i32,
    session_id: i32,
    /// Registry key: the correlation id of the add that created this handle.
    registration_id: i64,
    /// The driver's own registration id, which keys the log-buffer cache.
    original_registration_id: i64,
    kind: PublicationKind,
    position_limit: Position,
    channel_status: StatusIndicator,
    log_buffers: Arc<LogBuffers>,
    terms: FrameQueue,
    position: AtomicU64,
    closed: AtomicBool,
}

impl PublicationInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        channel: String,
        stream_id: i32,
        session_id: i32,
        registration_id: i64,
        original_registration_id: i64,
        kind: PublicationKind,
        position_limit: Position,
        channel_status: StatusIndicator,
        log_buffers: Arc<LogBuffers>,
    ) -> Self {
        let terms = log_buffers.terms();
        Self {
            channel,
            stream_id,
            session_id,
            registration_id,
            original_registration_id,
            kind,
            position_limit,
            channel_status,
            log_buffers,
            terms,
            position: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn channel(&self) -> &str {
        &self.channel
    }

    pub(crate) fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub(crate) fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub(crate) fn original_registration_id(&self) -> i64 {
        self.original_registration_id
    }

    pub(crate) fn kind(&self) -> PublicationKind {
        self.kind
    }

    pub(crate) fn log_buffers(&self) -> &Arc<LogBuffers> {
        &self.log_buffers
    }

    pub(crate) fn channel_status(&self) -> &StatusIndicator {
        &self.channel_status
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publish the closed state. Returns true the first time only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn check_limits(&self, length: usize) -> Result<u64, i64> {
        if self.is_closed() {
            return Err(CLOSED);
        }

        let limit = self.position_limit.get().max(0) as u64;
        let position = self.position();
        if position + length as u64 > limit {
            return Err(if limit == 0 { NOT_CONNECTED } else { BACK_PRESSURED });
        }

        Ok(position)
    }

    fn advance(&self, length: usize) -> u64 {
        let aligned = (length as u64).div_ceil(FRAME_ALIGNMENT) * FRAME_ALIGNMENT;
        self.position.fetch_add(aligned, Ordering::AcqRel) + aligned
    }

    pub(crate) fn offer_frame(&self, frame: Bytes) -> i64 {
        let length = frame.len();
        match self.check_limits(length) {
            Ok(_) => {
                if !self.terms.offer(frame) {
                    return BACK_PRESSURED;
                }
                self.advance(length) as i64
            }
            Err(sentinel) => sentinel,
        }
    }
}

/// A send handle. Cloning shares the same underlying publication; each
/// successful `add_publication` must be balanced by exactly one `close`.
#[derive(Clone)]
pub struct Publication {
    pub(crate) inner: Arc<PublicationInner>,
    pub(crate) client: Client,
}

impl Publication {
    pub fn channel(&self) -> &str {
        self.inner.channel()
    }

    pub fn stream_id(&self) -> i32 {
        self.inner.stream_id()
    }

    pub fn session_id(&self) -> i32 {
        self.inner.session_id
    }

    pub fn registration_id(&self) -> i64 {
        self.inner.registration_id()
    }

    pub fn original_registration_id(&self) -> i64 {
        self.inner.original_registration_id()
    }

    pub fn kind(&self) -> PublicationKind {
        self.inner.kind()
    }

    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    pub fn position_limit(&self) -> i64 {
        self.inner.position_limit.get()
    }

    pub fn channel_status(&self) -> i64 {
        self.inner.channel_status().value()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.inner.position_limit.get() > 0
    }

    /// Offer a fully framed payload. Returns the new position, or a negative
    /// sentinel (`NOT_CONNECTED`, `BACK_PRESSURED`, `CLOSED`).
    pub fn offer(&self, payload: &[u8]) -> i64 {
        self.inner.offer_frame(Bytes::copy_from_slice(payload))
    }

    /// Offer an already-built frame without copying.
    pub fn offer_frame(&self, frame: Bytes) -> i64 {
        self.inner.offer_frame(frame)
    }

    /// Reserve `length` bytes for in-place encoding. On failure the sentinel
    /// mirrors `offer`.
    pub fn try_claim(&self, length: usize) -> Result<BufferClaim, i64> {
        self.inner.check_limits(length)?;
        if !self.inner.terms.can_accept() {
            return Err(BACK_PRESSURED);
        }

        Ok(BufferClaim {
            buffer: BytesMut::zeroed(length),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Release this handle back through the conductor. Synchronous: awaits
    /// the driver's acknowledgement. Idempotent.
    pub fn close(&self) -> Result<(), ClientError> {
        self.client.release_publication(&self.inner)
    }
}

/// A claimed region of a publication. Commit to publish, or drop to abort.
pub struct BufferClaim {
    buffer: BytesMut,
    inner: Arc<PublicationInner>,
}

impl BufferClaim {
    pub fn buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Publish the claimed region. Returns the new position or a sentinel.
    pub fn commit(self) -> i64 {
        let BufferClaim { buffer, inner } = self;
        inner.offer_frame(buffer.freeze())
    }

    /// Abandon the claim.
    pub fn abort(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::counters::{CountersBuffer, StatusIndicator};
    use crate::testing::TestLogBuffersFactory;

    fn inner_with_limit(limit: i64) -> (Arc<PublicationInner>, CountersBuffer) {
        let counters = CountersBuffer::new(4);
        counters.set(0, limit);
        let factory = TestLogBuffersFactory::new();
        let mut cache =
            crate::client::log_buffers::LogBufferCache::new(Arc::new(factory));
        let log_buffers = cache.acquire(17, "log-17").unwrap();

        let inner = Arc::new(PublicationInner::new(
            "ipc:test".to_string(),
            7,
            1,
            42,
            17,
            PublicationKind::Shared,
            Position::new(counters.clone(), 0),
            StatusIndicator::Unallocated,
            log_buffers,
        ));
        (inner, counters)
    }

    #[test]
    fn offer_advances_position() {
        let (inner, _) = inner_with_limit(1 << 20);
        let position = inner.offer_frame(Bytes::from_static(b"hello"));
        assert_eq!(position, FRAME_ALIGNMENT as i64);
        assert_eq!(inner.terms.len(), 1);
    }

    #[test]
    fn offer_not_connected_when_limit_zero() {
        let (inner, _) = inner_with_limit(0);
        assert_eq!(inner.offer_frame(Bytes::from_static(b"x")), NOT_CONNECTED);
    }

    #[test]
    fn offer_back_pressured_at_limit() {
        let (inner, counters) = inner_with_limit(48);
        assert!(inner.offer_frame(Bytes::from_static(b"0123456789")) > 0);
        assert_eq!(
            inner.offer_frame(Bytes::from_static(b"overflowing-the-window")),
            BACK_PRESSURED
        );

        counters.set(0, 1 << 20);
        assert!(inner.offer_frame(Bytes::from_static(b"fits-now")) > 0);
    }

    #[test]
    fn offer_closed_after_mark() {
        let (inner, _) = inner_with_limit(1 << 20);
        assert!(inner.mark_closed());
        assert!(!inner.mark_closed());
        assert_eq!(inner.offer_frame(Bytes::from_static(b"x")), CLOSED);
    }
}
