//! Control-plane transport between this client and the out-of-process media
//! driver: typed command and event records carried over bounded rings. The
//! on-disk wire encoding belongs to the external codec library; this module
//! consumes its named interface only.

pub mod events;
pub mod proxy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

pub use events::DriverEventsAdapter;
pub use proxy::DriverProxy;

/// Commands sent from client to driver. Every mutating command carries the
/// fresh correlation id minted for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCommand {
    AddPublication {
        correlation_id: i64,
        channel: String,
        stream_id: i32,
    },
    AddExclusivePublication {
        correlation_id: i64,
        channel: String,
        stream_id: i32,
    },
    RemovePublication {
        correlation_id: i64,
        registration_id: i64,
    },
    AddSubscription {
        correlation_id: i64,
        channel: String,
        stream_id: i32,
    },
    RemoveSubscription {
        correlation_id: i64,
        registration_id: i64,
    },
    AddCounter {
        correlation_id: i64,
        type_id: i32,
        key: Bytes,
        label: String,
    },
    RemoveCounter {
        correlation_id: i64,
        registration_id: i64,
    },
    AddDestination {
        correlation_id: i64,
        registration_id: i64,
        channel: String,
    },
    RemoveDestination {
        correlation_id: i64,
        registration_id: i64,
        channel: String,
    },
    ClientKeepalive {
        client_id: i64,
    },
}

/// Driver failure codes attached to error events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverErrorCode {
    GenericError,
    InvalidChannel,
    UnknownSubscription,
    UnknownPublication,
    ChannelEndpointError,
    UnknownCounter,
}

/// Events received from the driver. Registration acknowledgements carry the
/// correlation id of the command that produced them; image events carry the
/// owning subscription's registration id instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverEvent {
    PublicationReady {
        correlation_id: i64,
        registration_id: i64,
        stream_id: i32,
        session_id: i32,
        publication_limit_counter_id: i32,
        channel_status_indicator_id: i32,
        log_file: String,
    },
    ExclusivePublicationReady {
        correlation_id: i64,
        registration_id: i64,
        stream_id: i32,
        session_id: i32,
        publication_limit_counter_id: i32,
        channel_status_indicator_id: i32,
        log_file: String,
    },
    SubscriptionReady {
        correlation_id: i64,
        channel_status_indicator_id: i32,
    },
    CounterReady {
        correlation_id: i64,
        counter_id: i32,
    },
    OperationSuccess {
        correlation_id: i64,
    },
    AvailableImage {
        correlation_id: i64,
        stream_id: i32,
        session_id: i32,
        subscription_registration_id: i64,
        subscriber_position_id: i32,
        log_file: String,
        source_identity: String,
    },
    UnavailableImage {
        correlation_id: i64,
        subscription_registration_id: i64,
        stream_id: i32,
    },
    Error {
        correlation_id: i64,
        code: DriverErrorCode,
        message: String,
    },
    ChannelEndpointError {
        status_indicator_id: i32,
        message: String,
    },
}

impl DriverEvent {
    /// The correlation id this event acknowledges, for events that conclude
    /// a client request.
    pub fn response_correlation_id(&self) -> Option<i64> {
        match self {
            DriverEvent::PublicationReady { correlation_id, .. }
            | DriverEvent::ExclusivePublicationReady { correlation_id, .. }
            | DriverEvent::SubscriptionReady { correlation_id, .. }
            | DriverEvent::CounterReady { correlation_id, .. }
            | DriverEvent::OperationSuccess { correlation_id }
            | DriverEvent::Error { correlation_id, .. } => Some(*correlation_id),
            DriverEvent::AvailableImage { .. }
            | DriverEvent::UnavailableImage { .. }
            | DriverEvent::ChannelEndpointError { .. } => None,
        }
    }
}

/// Driver liveness cell: epoch-millisecond timestamp the driver refreshes
/// on its own duty cycle.
#[derive(Clone, Debug, Default)]
pub struct DriverHeartbeat {
    time_ms: Arc<AtomicU64>,
}

impl DriverHeartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver side: refresh the heartbeat.
    pub fn update(&self, now_ms: u64) {
        self.time_ms.store(now_ms, Ordering::Release);
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms.load(Ordering::Acquire)
    }
}
