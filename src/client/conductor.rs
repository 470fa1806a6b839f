//! The client conductor: a single-threaded agent that processes driver
//! events, enforces keep-alive and service deadlines, expires lingering
//! log buffers, and serves client API calls under the client-wide lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::concurrent::clock::{EpochClock, NanoClock};
use crate::concurrent::counters::{CountersBuffer, MAX_KEY_LENGTH, MAX_LABEL_LENGTH, Position, StatusIndicator};
use crate::driver::events::DriverEventsAdapter;
use crate::driver::proxy::DriverProxy;
use crate::driver::DriverEvent;
use crate::error::{CountedErrorHandler, Error};

use super::counter::CounterInner;
use super::image::Image;
use super::log_buffers::LogBufferCache;
use super::publication::{PublicationInner, PublicationKind};
use super::registry::{Resource, ResourceRegistry};
use super::subscription::{ImageHandler, SubscriptionInner};
use super::{ClientContext, ClientError};

/// Refcount for shared publications handed out per (channel, stream id).
struct SharedPublicationRef {
    registration_id: i64,
    ref_count: usize,
}

pub(crate) struct Conductor {
    keep_alive_interval_ns: u64,
    driver_timeout_ms: u64,
    driver_timeout_ns: u64,
    inter_service_timeout_ns: u64,
    resource_linger_ns: u64,
    resource_check_interval_ns: u64,
    idle_sleep_ns: u64,
    event_batch_limit: usize,

    time_of_last_keep_alive_ns: u64,
    time_of_last_service_ns: u64,
    time_of_last_resources_check_ns: u64,
    is_closed: bool,

    stashed_channel: Option<String>,
    driver_error: Option<ClientError>,

    epoch_clock: Arc<dyn EpochClock>,
    nano_clock: Arc<dyn NanoClock>,
    proxy: DriverProxy,
    events: DriverEventsAdapter,
    registry: ResourceRegistry,
    log_cache: LogBufferCache,
    publications_by_stream: HashMap<(String, i32), SharedPublicationRef>,
    counters: CountersBuffer,
    errors: CountedErrorHandler,
    default_available_image_handler: Option<ImageHandler>,
    default_unavailable_image_handler: Option<ImageHandler>,
    driver_agent_invoker: Option<Box<dyn FnMut() + Send>>,
    event_scratch: Vec<DriverEvent>,
}

impl Conductor {
    pub(crate) fn new(ctx: ClientContext) -> Self {
        let proxy = DriverProxy::new(
            ctx.command_ring,
            ctx.driver_heartbeat,
            ctx.idle_strategy.clone(),
        );
        let events = DriverEventsAdapter::new(ctx.event_ring);
        let now_ns = ctx.nano_clock.nano_time();

        Self {
            keep_alive_interval_ns: ctx.config.keep_alive_interval_ns,
            driver_timeout_ms: ctx.config.driver_timeout_ms,
            driver_timeout_ns: ctx.config.driver_timeout_ns(),
            inter_service_timeout_ns: ctx.config.inter_service_timeout_ns,
            resource_linger_ns: ctx.config.resource_linger_ns,
            resource_check_interval_ns: ctx.config.resource_check_interval_ns,
            idle_sleep_ns: ctx.config.idle_sleep_ns,
            event_batch_limit: ctx.config.event_batch_limit,
            time_of_last_keep_alive_ns: now_ns,
            time_of_last_service_ns: now_ns,
            time_of_last_resources_check_ns: now_ns,
            is_closed: false,
            stashed_channel: None,
            driver_error: None,
            epoch_clock: ctx.epoch_clock,
            nano_clock: ctx.nano_clock,
            proxy,
            events,
            registry: ResourceRegistry::default(),
            log_cache: LogBufferCache::new(ctx.log_buffers_factory),
            publications_by_stream: HashMap::new(),
            counters: ctx.counters,
            errors: ctx.error_handler,
            default_available_image_handler: ctx.available_image_handler,
            default_unavailable_image_handler: ctx.unavailable_image_handler,
            driver_agent_invoker: ctx.driver_agent_invoker,
            event_scratch: Vec::new(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub(crate) fn next_correlation_id(&self) -> i64 {
        self.proxy.next_correlation_id()
    }

    pub(crate) fn registry_len(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn lingering_len(&self) -> usize {
        self.log_cache.lingering_len()
    }

    pub(crate) fn mapped_log_count(&self) -> usize {
        self.log_cache.mapped_len()
    }

    /// Close the conductor and force-close every resource. Idempotent.
    pub(crate) fn on_close(&mut self) {
        if self.is_closed {
            return;
        }
        self.is_closed = true;

        let lingering_before = self.log_cache.lingering_len();
        self.force_close_resources();

        // Give the driver a beat to observe the removals before the maps go.
        if self.log_cache.lingering_len() > lingering_before {
            std::thread::sleep(Duration::from_millis(1));
        }

        self.log_cache.delete_all_lingering();
        tracing::info!("client conductor closed");
    }

    /// One work cycle: timeout checks plus a bounded batch of driver events.
    /// With no awaited correlation id, failures are routed to the error sink
    /// and swallowed; an awaiting API caller gets them back as well.
    pub(crate) fn service(
        &mut self,
        await_correlation_id: Option<i64>,
    ) -> Result<usize, ClientError> {
        match self.do_service() {
            Ok(work_count) => Ok(work_count),
            Err(error) => {
                self.errors.on_error(&Error::Client(error.clone()));
                if await_correlation_id.is_some() {
                    Err(error)
                } else {
                    Ok(0)
                }
            }
        }
    }

    fn do_service(&mut self) -> Result<usize, ClientError> {
        let mut work_count = self.on_check_timeouts()?;
        work_count += self.poll_driver_events()?;
        Ok(work_count)
    }

    // ---- client API operations -------------------------------------------

    pub(crate) fn add_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Arc<PublicationInner>, ClientError> {
        self.ensure_open()?;

        let key = (channel.to_string(), stream_id);
        if let Some(shared) = self.publications_by_stream.get_mut(&key) {
            shared.ref_count += 1;
            let registration_id = shared.registration_id;
            if let Some(Resource::SharedPublication(inner)) = self.registry.get(registration_id) {
                return Ok(Arc::clone(inner));
            }
        }

        self.stashed_channel = Some(channel.to_string());
        let correlation_id = self.proxy.add_publication(channel, stream_id);
        self.await_response(correlation_id)?;

        let inner = match self.registry.get(correlation_id) {
            Some(Resource::SharedPublication(inner)) => Arc::clone(inner),
            _ => return Err(ClientError::UnexpectedResponse { correlation_id }),
        };
        self.publications_by_stream.insert(
            key,
            SharedPublicationRef {
                registration_id: correlation_id,
                ref_count: 1,
            },
        );
        Ok(inner)
    }

    pub(crate) fn add_exclusive_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Arc<PublicationInner>, ClientError> {
        self.ensure_open()?;

        self.stashed_channel = Some(channel.to_string());
        let correlation_id = self.proxy.add_exclusive_publication(channel, stream_id);
        self.await_response(correlation_id)?;

        match self.registry.get(correlation_id) {
            Some(Resource::ExclusivePublication(inner)) => Ok(Arc::clone(inner)),
            _ => Err(ClientError::UnexpectedResponse { correlation_id }),
        }
    }

    pub(crate) fn release_publication(
        &mut self,
        inner: &Arc<PublicationInner>,
    ) -> Result<(), ClientError> {
        if inner.is_closed() {
            return Ok(());
        }
        self.ensure_open()?;

        if inner.kind() == PublicationKind::Shared {
            let key = (inner.channel().to_string(), inner.stream_id());
            if let Some(shared) = self.publications_by_stream.get_mut(&key) {
                shared.ref_count -= 1;
                if shared.ref_count > 0 {
                    return Ok(());
                }
                self.publications_by_stream.remove(&key);
            }
        }

        if !inner.mark_closed() {
            return Ok(());
        }

        if self.registry.remove(inner.registration_id()).is_some() {
            let now_ns = self.nano_clock.nano_time();
            self.log_cache
                .release(inner.log_buffers(), inner.original_registration_id(), now_ns);
            let correlation_id = self.proxy.remove_publication(inner.registration_id());
            self.await_response(correlation_id)?;
        }
        Ok(())
    }

    pub(crate) fn add_subscription(
        &mut self,
        channel: &str,
        stream_id: i32,
        available: Option<ImageHandler>,
        unavailable: Option<ImageHandler>,
    ) -> Result<Arc<SubscriptionInner>, ClientError> {
        self.ensure_open()?;

        let available = available.or_else(|| self.default_available_image_handler.clone());
        let unavailable = unavailable.or_else(|| self.default_unavailable_image_handler.clone());

        let correlation_id = self.proxy.add_subscription(channel, stream_id);
        let inner = Arc::new(SubscriptionInner::new(
            channel.to_string(),
            stream_id,
            correlation_id,
            available,
            unavailable,
        ));

        // Registered before the acknowledgement arrives: an available-image
        // event may beat the subscription-ready event and must resolve.
        self.registry
            .register_result(correlation_id, Resource::Subscription(Arc::clone(&inner)));

        self.await_response(correlation_id)?;
        Ok(inner)
    }

    pub(crate) fn release_subscription(
        &mut self,
        inner: &Arc<SubscriptionInner>,
    ) -> Result<(), ClientError> {
        if inner.is_closed() {
            return Ok(());
        }
        self.ensure_open()?;

        if !inner.mark_closed() {
            return Ok(());
        }

        let now_ns = self.nano_clock.nano_time();
        for image in inner.drain_images() {
            if image.mark_closed() {
                self.log_cache
                    .release(image.log_buffers(), image.correlation_id(), now_ns);
            }
        }

        let correlation_id = self.proxy.remove_subscription(inner.registration_id());
        self.await_response(correlation_id)?;
        self.registry.remove(inner.registration_id());
        Ok(())
    }

    pub(crate) fn add_counter(
        &mut self,
        type_id: i32,
        key: &[u8],
        label: &str,
    ) -> Result<Arc<CounterInner>, ClientError> {
        self.ensure_open()?;

        if key.len() > MAX_KEY_LENGTH {
            return Err(ClientError::InvalidArgument {
                field: "key",
                len: key.len(),
                max: MAX_KEY_LENGTH,
            });
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(ClientError::InvalidArgument {
                field: "label",
                len: label.len(),
                max: MAX_LABEL_LENGTH,
            });
        }

        let correlation_id = self
            .proxy
            .add_counter(type_id, Bytes::copy_from_slice(key), label);
        self.await_response(correlation_id)?;

        match self.registry.get(correlation_id) {
            Some(Resource::Counter(inner)) => Ok(Arc::clone(inner)),
            _ => Err(ClientError::UnexpectedResponse { correlation_id }),
        }
    }

    pub(crate) fn release_counter(
        &mut self,
        inner: &Arc<CounterInner>,
    ) -> Result<(), ClientError> {
        if inner.is_closed() {
            return Ok(());
        }
        self.ensure_open()?;

        if !inner.mark_closed() {
            return Ok(());
        }

        let correlation_id = self.proxy.remove_counter(inner.registration_id());
        self.await_response(correlation_id)?;
        self.registry.remove(inner.registration_id());
        Ok(())
    }

    pub(crate) fn add_destination(
        &mut self,
        registration_id: i64,
        endpoint_channel: &str,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let correlation_id = self.proxy.add_destination(registration_id, endpoint_channel);
        self.await_response(correlation_id)
    }

    pub(crate) fn remove_destination(
        &mut self,
        registration_id: i64,
        endpoint_channel: &str,
    ) -> Result<(), ClientError> {
        self.ensure_open()?;
        let correlation_id = self
            .proxy
            .remove_destination(registration_id, endpoint_channel);
        self.await_response(correlation_id)
    }

    // ---- response correlation --------------------------------------------

    fn await_response(&mut self, correlation_id: i64) -> Result<(), ClientError> {
        self.driver_error = None;
        let deadline_ns = self.nano_clock.nano_time() + self.driver_timeout_ns;

        loop {
            match &mut self.driver_agent_invoker {
                Some(invoke_driver) => invoke_driver(),
                None => std::thread::sleep(Duration::from_millis(1)),
            }

            self.service(Some(correlation_id))?;

            if self.events.last_received_correlation_id() == correlation_id {
                if let Some(error) = self.driver_error.take() {
                    return Err(error);
                }
                return Ok(());
            }

            if self.nano_clock.nano_time() >= deadline_ns {
                return Err(ClientError::DriverTimeout {
                    window_ms: self.driver_timeout_ms,
                });
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed {
            Err(ClientError::ClientClosed)
        } else {
            Ok(())
        }
    }

    // ---- timeout supervision ---------------------------------------------

    fn on_check_timeouts(&mut self) -> Result<usize, ClientError> {
        let mut work_count = 0;
        let now_ns = self.nano_clock.nano_time();

        if now_ns > self.time_of_last_service_ns + self.idle_sleep_ns {
            self.check_service_interval(now_ns)?;
            self.time_of_last_service_ns = now_ns;

            work_count += self.check_liveness(now_ns)?;
            work_count += self.check_lingering_resources(now_ns);
        }

        Ok(work_count)
    }

    fn check_service_interval(&mut self, now_ns: u64) -> Result<(), ClientError> {
        if now_ns > self.time_of_last_service_ns + self.inter_service_timeout_ns {
            let lingering_before = self.log_cache.lingering_len();
            self.force_close_resources();
            if self.log_cache.lingering_len() > lingering_before {
                std::thread::sleep(Duration::from_millis(1000));
            }

            self.on_close();

            return Err(ClientError::ServiceTimeout {
                interval_ns: self.inter_service_timeout_ns,
            });
        }
        Ok(())
    }

    fn check_liveness(&mut self, now_ns: u64) -> Result<usize, ClientError> {
        if now_ns > self.time_of_last_keep_alive_ns + self.keep_alive_interval_ns {
            let now_ms = self.epoch_clock.time_ms();
            if now_ms > self.proxy.time_of_last_driver_keepalive_ms() + self.driver_timeout_ms {
                self.on_close();
                return Err(ClientError::DriverTimeout {
                    window_ms: self.driver_timeout_ms,
                });
            }

            self.proxy.send_client_keepalive();
            self.time_of_last_keep_alive_ns = now_ns;
            return Ok(1);
        }
        Ok(0)
    }

    fn check_lingering_resources(&mut self, now_ns: u64) -> usize {
        if now_ns > self.time_of_last_resources_check_ns + self.resource_check_interval_ns {
            self.log_cache.check_lingering(now_ns, self.resource_linger_ns);
            self.time_of_last_resources_check_ns = now_ns;
            return 1;
        }
        0
    }

    fn force_close_resources(&mut self) {
        let now_ns = self.nano_clock.nano_time();
        let resources = self.registry.drain();
        if !resources.is_empty() {
            tracing::warn!(count = resources.len(), "force closing client resources");
        }

        for resource in resources {
            match resource {
                Resource::SharedPublication(inner) | Resource::ExclusivePublication(inner) => {
                    if inner.mark_closed() {
                        self.proxy.remove_publication(inner.registration_id());
                        self.log_cache.release(
                            inner.log_buffers(),
                            inner.original_registration_id(),
                            now_ns,
                        );
                    }
                }
                Resource::Subscription(inner) => {
                    if inner.mark_closed() {
                        for image in inner.drain_images() {
                            if image.mark_closed() {
                                self.log_cache.release(
                                    image.log_buffers(),
                                    image.correlation_id(),
                                    now_ns,
                                );
                            }
                        }
                        self.proxy.remove_subscription(inner.registration_id());
                    }
                }
                Resource::Counter(inner) => {
                    if inner.mark_closed() {
                        self.proxy.remove_counter(inner.registration_id());
                    }
                }
            }
        }

        self.publications_by_stream.clear();
    }

    // ---- driver event dispatch -------------------------------------------

    fn poll_driver_events(&mut self) -> Result<usize, ClientError> {
        let mut batch = std::mem::take(&mut self.event_scratch);
        batch.clear();
        self.events.drain(self.event_batch_limit, &mut batch);

        let count = batch.len();
        let mut failure = None;
        for event in batch.drain(..) {
            if failure.is_none() {
                if let Err(error) = self.dispatch(event) {
                    failure = Some(error);
                }
            }
        }
        self.event_scratch = batch;

        match failure {
            Some(error) => Err(error),
            None => Ok(count),
        }
    }

    fn dispatch(&mut self, event: DriverEvent) -> Result<(), ClientError> {
        match event {
            DriverEvent::PublicationReady {
                correlation_id,
                registration_id,
                stream_id,
                session_id,
                publication_limit_counter_id,
                channel_status_indicator_id,
                log_file,
            } => self.on_new_publication(
                PublicationKind::Shared,
                correlation_id,
                registration_id,
                stream_id,
                session_id,
                publication_limit_counter_id,
                channel_status_indicator_id,
                &log_file,
            ),
            DriverEvent::ExclusivePublicationReady {
                correlation_id,
                registration_id,
                stream_id,
                session_id,
                publication_limit_counter_id,
                channel_status_indicator_id,
                log_file,
            } => self.on_new_publication(
                PublicationKind::Exclusive,
                correlation_id,
                registration_id,
                stream_id,
                session_id,
                publication_limit_counter_id,
                channel_status_indicator_id,
                &log_file,
            ),
            DriverEvent::SubscriptionReady {
                correlation_id,
                channel_status_indicator_id,
            } => {
                self.on_new_subscription(correlation_id, channel_status_indicator_id);
                Ok(())
            }
            DriverEvent::CounterReady {
                correlation_id,
                counter_id,
            } => {
                self.on_new_counter(correlation_id, counter_id);
                Ok(())
            }
            DriverEvent::OperationSuccess { .. } => Ok(()),
            DriverEvent::AvailableImage {
                correlation_id,
                stream_id: _,
                session_id,
                subscription_registration_id,
                subscriber_position_id,
                log_file,
                source_identity,
            } => self.on_available_image(
                correlation_id,
                session_id,
                subscription_registration_id,
                subscriber_position_id,
                &log_file,
                source_identity,
            ),
            DriverEvent::UnavailableImage {
                correlation_id,
                subscription_registration_id,
                stream_id: _,
            } => {
                self.on_unavailable_image(correlation_id, subscription_registration_id);
                Ok(())
            }
            DriverEvent::Error {
                correlation_id: _,
                code,
                message,
            } => {
                self.driver_error = Some(ClientError::Registration { code, message });
                Ok(())
            }
            DriverEvent::ChannelEndpointError {
                status_indicator_id,
                message,
            } => {
                self.on_channel_endpoint_error(status_indicator_id, &message);
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_new_publication(
        &mut self,
        kind: PublicationKind,
        correlation_id: i64,
        registration_id: i64,
        stream_id: i32,
        session_id: i32,
        publication_limit_counter_id: i32,
        channel_status_indicator_id: i32,
        log_file: &str,
    ) -> Result<(), ClientError> {
        let channel = self.stashed_channel.take().unwrap_or_default();
        let log_buffers = self.log_cache.acquire(registration_id, log_file)?;

        let inner = Arc::new(PublicationInner::new(
            channel,
            stream_id,
            session_id,
            correlation_id,
            registration_id,
            kind,
            Position::new(self.counters.clone(), publication_limit_counter_id),
            StatusIndicator::from_id(&self.counters, channel_status_indicator_id),
            log_buffers,
        ));

        let resource = match kind {
            PublicationKind::Shared => Resource::SharedPublication(inner),
            PublicationKind::Exclusive => Resource::ExclusivePublication(inner),
        };
        self.registry.register_result(correlation_id, resource);
        Ok(())
    }

    fn on_new_subscription(&mut self, correlation_id: i64, channel_status_indicator_id: i32) {
        match self.registry.get(correlation_id) {
            Some(Resource::Subscription(inner)) => {
                inner.set_channel_status(StatusIndicator::from_id(
                    &self.counters,
                    channel_status_indicator_id,
                ));
            }
            _ => {
                tracing::debug!(correlation_id, "subscription ready for unknown registration");
            }
        }
    }

    fn on_new_counter(&mut self, correlation_id: i64, counter_id: i32) {
        self.registry.register_result(
            correlation_id,
            Resource::Counter(Arc::new(CounterInner::new(
                correlation_id,
                counter_id,
                self.counters.clone(),
            ))),
        );
    }

    fn on_available_image(
        &mut self,
        correlation_id: i64,
        session_id: i32,
        subscription_registration_id: i64,
        subscriber_position_id: i32,
        log_file: &str,
        source_identity: String,
    ) -> Result<(), ClientError> {
        let subscription = match self.registry.get(subscription_registration_id) {
            Some(Resource::Subscription(inner)) => Arc::clone(inner),
            _ => return Ok(()),
        };
        if subscription.contains_image(correlation_id) {
            return Ok(());
        }

        let log_buffers = self.log_cache.acquire(correlation_id, log_file)?;
        let image = Image::new(
            correlation_id,
            session_id,
            subscription_registration_id,
            source_identity,
            Position::new(self.counters.clone(), subscriber_position_id),
            log_buffers,
        );

        if let Some(handler) = subscription.available_image_handler() {
            self.invoke_image_handler(&handler, &image);
        }

        subscription.add_image(image);
        Ok(())
    }

    fn on_unavailable_image(&mut self, correlation_id: i64, subscription_registration_id: i64) {
        let subscription = match self.registry.get(subscription_registration_id) {
            Some(Resource::Subscription(inner)) => Arc::clone(inner),
            _ => return,
        };

        if let Some(image) = subscription.remove_image(correlation_id) {
            if let Some(handler) = subscription.unavailable_image_handler() {
                self.invoke_image_handler(&handler, &image);
            }
            if image.mark_closed() {
                let now_ns = self.nano_clock.nano_time();
                self.log_cache
                    .release(image.log_buffers(), image.correlation_id(), now_ns);
            }
        }
    }

    fn on_channel_endpoint_error(&mut self, status_indicator_id: i32, message: &str) {
        let mut matches = Vec::new();
        for resource in self.registry.values() {
            let id = match resource {
                Resource::SharedPublication(inner) | Resource::ExclusivePublication(inner) => {
                    inner.channel_status().id()
                }
                Resource::Subscription(inner) => inner.channel_status_id(),
                Resource::Counter(_) => continue,
            };
            if id == status_indicator_id {
                matches.push(id);
            }
        }

        for _ in matches {
            self.errors
                .on_error(&Error::Client(ClientError::ChannelEndpoint {
                    status_indicator_id,
                    message: message.to_string(),
                }));
        }
    }

    fn invoke_image_handler(&self, handler: &ImageHandler, image: &Image) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(image)));
        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            self.errors
                .on_error(&Error::Client(ClientError::ImageHandler { message }));
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// The conductor's behavior is exercised end to end, with a scripted driver
// on the far side of the rings, in tests/client_conductor.rs.
