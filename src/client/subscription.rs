//! Receive handles holding zero or more images, one per remote publication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::concurrent::counters::StatusIndicator;

use super::image::{ControlledPollAction, Image};
use super::{Client, ClientError};

/// Callback invoked as images come and go. Panics raised inside are caught
/// by the conductor and routed to the error sink.
pub type ImageHandler = Arc<dyn Fn(&Image) + Send + Sync>;

pub(crate) struct SubscriptionInner {
    channel: String,
    stream_id: i32,
    registration_id: i64,
    available_image_handler: Option<ImageHandler>,
    unavailable_image_handler: Option<ImageHandler>,
    // Bound by the driver's acknowledgement, which may arrive after the
    // first image event; starts out unallocated.
    channel_status: Mutex<StatusIndicator>,
    images: Mutex<Vec<Image>>,
    closed: AtomicBool,
}

impl SubscriptionInner {
    pub(crate) fn new(
        channel: String,
        stream_id: i32,
        registration_id: i64,
        available_image_handler: Option<ImageHandler>,
        unavailable_image_handler: Option<ImageHandler>,
    ) -> Self {
        Self {
            channel,
            stream_id,
            registration_id,
            available_image_handler,
            unavailable_image_handler,
            channel_status: Mutex::new(StatusIndicator::Unallocated),
            images: Mutex::new(Vec::new()),
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

    pub(crate) fn available_image_handler(&self) -> Option<ImageHandler> {
        self.available_image_handler.clone()
    }

    pub(crate) fn unavailable_image_handler(&self) -> Option<ImageHandler> {
        self.unavailable_image_handler.clone()
    }

    pub(crate) fn set_channel_status(&self, indicator: StatusIndicator) {
        *self.lock_status() = indicator;
    }

    pub(crate) fn channel_status_id(&self) -> i32 {
        self.lock_status().id()
    }

    pub(crate) fn channel_status_value(&self) -> i64 {
        self.lock_status().value()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn contains_image(&self, correlation_id: i64) -> bool {
        self.lock_images()
            .iter()
            .any(|image| image.correlation_id() == correlation_id)
    }

    pub(crate) fn add_image(&self, image: Image) {
        self.lock_images().push(image);
    }

    pub(crate) fn remove_image(&self, correlation_id: i64) -> Option<Image> {
        let mut images = self.lock_images();
        let index = images
            .iter()
            .position(|image| image.correlation_id() == correlation_id)?;
        Some(images.swap_remove(index))
    }

    pub(crate) fn drain_images(&self) -> Vec<Image> {
        std::mem::take(&mut *self.lock_images())
    }

    pub(crate) fn image_count(&self) -> usize {
        self.lock_images().len()
    }

    fn snapshot_images(&self) -> Vec<Image> {
        self.lock_images().clone()
    }

    fn lock_images(&self) -> std::sync::MutexGuard<'_, Vec<Image>> {
        self.images.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, StatusIndicator> {
        self.channel_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// A receive handle. Cloning shares the underlying subscription.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<SubscriptionInner>,
    pub(crate) client: Client,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        self.inner.channel()
    }

    pub fn stream_id(&self) -> i32 {
        self.inner.stream_id()
    }

    pub fn registration_id(&self) -> i64 {
        self.inner.registration_id()
    }

    pub fn channel_status(&self) -> i64 {
        self.inner.channel_status_value()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn image_count(&self) -> usize {
        self.inner.image_count()
    }

    pub fn has_image(&self, correlation_id: i64) -> bool {
        self.inner.contains_image(correlation_id)
    }

    pub fn images(&self) -> Vec<Image> {
        self.inner.snapshot_images()
    }

    /// Poll every image for fragments, up to `fragment_limit` in total.
    pub fn poll(&self, handler: &mut dyn FnMut(&Bytes), fragment_limit: usize) -> usize {
        let mut fragments = 0;
        for image in self.inner.snapshot_images() {
            if fragments >= fragment_limit {
                break;
            }
            fragments += image.poll(handler, fragment_limit - fragments);
        }
        fragments
    }

    /// Controlled poll across images. Stops for the cycle when a handler
    /// aborts, leaving the aborted fragment for redelivery.
    pub fn controlled_poll(
        &self,
        handler: &mut dyn FnMut(&Bytes) -> ControlledPollAction,
        fragment_limit: usize,
    ) -> usize {
        let mut fragments = 0;
        for image in self.inner.snapshot_images() {
            if fragments >= fragment_limit {
                break;
            }
            let (consumed, aborted) =
                image.controlled_poll(handler, fragment_limit - fragments);
            fragments += consumed;
            if aborted {
                break;
            }
        }
        fragments
    }

    /// Release this handle back through the conductor. Synchronous: awaits
    /// the driver's acknowledgement. Idempotent.
    pub fn close(&self) -> Result<(), ClientError> {
        self.client.release_subscription(&self.inner)
    }
}
