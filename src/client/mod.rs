//! Client-side API over the out-of-process media driver.
//!
//! A [`Client`] owns the conductor behind the client-wide lock. API calls
//! lock it and await their driver round trip; the conductor agent acquires
//! it with a try-lock each duty cycle so callers can always make progress.

mod conductor;
mod counter;
mod image;
mod log_buffers;
mod publication;
mod registry;
mod subscription;

use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use thiserror::Error;

use crate::concurrent::agent::{Agent, AgentError};
use crate::concurrent::clock::{EpochClock, NanoClock, SystemEpochClock, SystemNanoClock};
use crate::concurrent::counters::CountersBuffer;
use crate::concurrent::idle::IdleStrategy;
use crate::concurrent::ring::RecordRing;
use crate::config::ClientConfig;
use crate::driver::{DriverCommand, DriverErrorCode, DriverEvent, DriverHeartbeat};
use crate::error::CountedErrorHandler;
use crate::Transience;

use conductor::Conductor;

pub use counter::Counter;
pub use image::{ControlledPollAction, Image};
pub use log_buffers::{LogBuffersFactory, MappedLog};
pub use publication::{
    BufferClaim, Publication, PublicationKind, ADMIN_ACTION, BACK_PRESSURED, CLOSED, NOT_CONNECTED,
};
pub use subscription::{ImageHandler, Subscription};

/// Failures surfaced by the client conductor.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ClientError {
    /// The driver reported a failure for a specific registration.
    #[error("driver rejected registration ({code:?}): {message}")]
    Registration {
        code: DriverErrorCode,
        message: String,
    },

    /// No driver response, or driver heartbeat older than the window.
    #[error("no driver response within {window_ms} ms")]
    DriverTimeout { window_ms: u64 },

    /// The conductor's own work loop missed its deadline; fatal.
    #[error("conductor service interval exceeded {interval_ns} ns")]
    ServiceTimeout { interval_ns: u64 },

    /// Asynchronous per-endpoint failure.
    #[error("channel endpoint errored (status indicator {status_indicator_id}): {message}")]
    ChannelEndpoint {
        status_indicator_id: i32,
        message: String,
    },

    #[error("{field} length {len} out of bounds (max {max})")]
    InvalidArgument {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("client is closed")]
    ClientClosed,

    /// The driver acknowledged with a resource of an unexpected kind.
    #[error("unexpected response for correlation id {correlation_id}")]
    UnexpectedResponse { correlation_id: i64 },

    #[error("failed to map log file {log_file}: {reason}")]
    MapLog { log_file: String, reason: String },

    #[error("image handler panicked: {message}")]
    ImageHandler { message: String },
}

impl ClientError {
    pub fn transience(&self) -> Transience {
        match self {
            ClientError::Registration { .. }
            | ClientError::ServiceTimeout { .. }
            | ClientError::InvalidArgument { .. }
            | ClientError::ClientClosed => Transience::Permanent,
            ClientError::DriverTimeout { .. }
            | ClientError::ChannelEndpoint { .. }
            | ClientError::UnexpectedResponse { .. }
            | ClientError::MapLog { .. }
            | ClientError::ImageHandler { .. } => Transience::Unknown,
        }
    }
}

/// Seams and transports the conductor is built from. The rings, counters
/// buffer and heartbeat cell are shared with the driver process; the log
/// buffers factory maps files on the conductor's behalf.
pub struct ClientContext {
    pub config: ClientConfig,
    pub command_ring: RecordRing<DriverCommand>,
    pub event_ring: RecordRing<DriverEvent>,
    pub counters: CountersBuffer,
    pub driver_heartbeat: DriverHeartbeat,
    pub log_buffers_factory: Arc<dyn LogBuffersFactory>,
    pub error_handler: CountedErrorHandler,
    pub idle_strategy: IdleStrategy,
    pub epoch_clock: Arc<dyn EpochClock>,
    pub nano_clock: Arc<dyn NanoClock>,
    pub available_image_handler: Option<ImageHandler>,
    pub unavailable_image_handler: Option<ImageHandler>,
    /// Embedded driver duty cycle, invoked instead of parking while a
    /// response is awaited.
    pub driver_agent_invoker: Option<Box<dyn FnMut() + Send>>,
}

impl ClientContext {
    pub fn new(
        command_ring: RecordRing<DriverCommand>,
        event_ring: RecordRing<DriverEvent>,
        counters: CountersBuffer,
        driver_heartbeat: DriverHeartbeat,
        log_buffers_factory: Arc<dyn LogBuffersFactory>,
    ) -> Self {
        Self {
            config: ClientConfig::default(),
            command_ring,
            event_ring,
            counters,
            driver_heartbeat,
            log_buffers_factory,
            error_handler: CountedErrorHandler::default(),
            idle_strategy: IdleStrategy::default(),
            epoch_clock: Arc::new(SystemEpochClock),
            nano_clock: Arc::new(SystemNanoClock::new()),
            available_image_handler: None,
            unavailable_image_handler: None,
            driver_agent_invoker: None,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_handler(mut self, error_handler: CountedErrorHandler) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub fn with_epoch_clock(mut self, clock: Arc<dyn EpochClock>) -> Self {
        self.epoch_clock = clock;
        self
    }

    pub fn with_nano_clock(mut self, clock: Arc<dyn NanoClock>) -> Self {
        self.nano_clock = clock;
        self
    }
}

struct ClientCore {
    conductor: Mutex<Conductor>,
    errors: CountedErrorHandler,
}

/// Handle to one client attached to the driver. Cheap to clone; all clones
/// share the conductor.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Build the conductor over the given context. The conductor is not
    /// driven yet: pass [`Client::conductor_agent`] to an
    /// [`crate::concurrent::agent::AgentRunner`] or embed it in an invoker.
    pub fn connect(ctx: ClientContext) -> Self {
        let errors = ctx.error_handler.clone();
        Self {
            core: Arc::new(ClientCore {
                conductor: Mutex::new(Conductor::new(ctx)),
                errors,
            }),
        }
    }

    /// The conductor as a runnable agent.
    pub fn conductor_agent(&self) -> ConductorAgent {
        ConductorAgent {
            core: Arc::clone(&self.core),
        }
    }

    pub fn errors(&self) -> &CountedErrorHandler {
        &self.core.errors
    }

    pub fn next_correlation_id(&self) -> i64 {
        self.lock_conductor().next_correlation_id()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_conductor().is_closed()
    }

    /// Close the conductor, force-closing every live resource.
    pub fn close(&self) {
        self.lock_conductor().on_close();
    }

    pub fn add_publication(&self, channel: &str, stream_id: i32) -> Result<Publication, ClientError> {
        let inner = self.lock_conductor().add_publication(channel, stream_id)?;
        Ok(Publication {
            inner,
            client: self.clone(),
        })
    }

    pub fn add_exclusive_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Publication, ClientError> {
        let inner = self
            .lock_conductor()
            .add_exclusive_publication(channel, stream_id)?;
        Ok(Publication {
            inner,
            client: self.clone(),
        })
    }

    pub fn add_subscription(&self, channel: &str, stream_id: i32) -> Result<Subscription, ClientError> {
        self.add_subscription_with_handlers(channel, stream_id, None, None)
    }

    pub fn add_subscription_with_handlers(
        &self,
        channel: &str,
        stream_id: i32,
        available_image_handler: Option<ImageHandler>,
        unavailable_image_handler: Option<ImageHandler>,
    ) -> Result<Subscription, ClientError> {
        let inner = self.lock_conductor().add_subscription(
            channel,
            stream_id,
            available_image_handler,
            unavailable_image_handler,
        )?;
        Ok(Subscription {
            inner,
            client: self.clone(),
        })
    }

    pub fn add_counter(&self, type_id: i32, key: &[u8], label: &str) -> Result<Counter, ClientError> {
        let inner = self.lock_conductor().add_counter(type_id, key, label)?;
        Ok(Counter {
            inner,
            client: self.clone(),
        })
    }

    pub fn add_destination(
        &self,
        publication_registration_id: i64,
        endpoint_channel: &str,
    ) -> Result<(), ClientError> {
        self.lock_conductor()
            .add_destination(publication_registration_id, endpoint_channel)
    }

    pub fn remove_destination(
        &self,
        publication_registration_id: i64,
        endpoint_channel: &str,
    ) -> Result<(), ClientError> {
        self.lock_conductor()
            .remove_destination(publication_registration_id, endpoint_channel)
    }

    /// Live resources currently registered.
    pub fn resource_count(&self) -> usize {
        self.lock_conductor().registry_len()
    }

    /// Log buffers currently mapped (excludes lingering handles).
    pub fn mapped_log_count(&self) -> usize {
        self.lock_conductor().mapped_log_count()
    }

    /// Log buffers awaiting physical release.
    pub fn lingering_log_count(&self) -> usize {
        self.lock_conductor().lingering_len()
    }

    pub(crate) fn release_publication(
        &self,
        inner: &Arc<publication::PublicationInner>,
    ) -> Result<(), ClientError> {
        self.lock_conductor().release_publication(inner)
    }

    pub(crate) fn release_subscription(
        &self,
        inner: &Arc<subscription::SubscriptionInner>,
    ) -> Result<(), ClientError> {
        self.lock_conductor().release_subscription(inner)
    }

    pub(crate) fn release_counter(
        &self,
        inner: &Arc<counter::CounterInner>,
    ) -> Result<(), ClientError> {
        self.lock_conductor().release_counter(inner)
    }

    fn lock_conductor(&self) -> std::sync::MutexGuard<'_, Conductor> {
        self.core
            .conductor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The conductor as an [`Agent`]: one try-locked service pass per duty
/// cycle, terminating once the client is closed.
pub struct ConductorAgent {
    core: Arc<ClientCore>,
}

impl Agent for ConductorAgent {
    fn do_work(&mut self) -> Result<usize, AgentError> {
        let mut conductor = match self.core.conductor.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(0),
        };

        if conductor.is_closed() {
            return Err(AgentError::Terminated);
        }

        // Work-loop failures are routed to the error sink inside service.
        Ok(conductor.service(None).unwrap_or(0))
    }

    fn role_name(&self) -> &'static str {
        "client-conductor"
    }
}
