//! Cluster sequencer: orders client requests into a replicated command log.
//!
//! A single agent accepts ingress session connects, messages, keep-alives
//! and closes, admits sessions, and appends framed events onto the log
//! publication in ingress order.

pub mod codecs;
pub mod ingress;
pub mod sequencer;
pub mod session;
pub mod timer;

use thiserror::Error;

use crate::client::ClientError;
use crate::Transience;

pub use codecs::CodecError;
pub use ingress::{IngressAdapter, IngressListener};
pub use sequencer::{ClusterContext, SequencerAgent};
pub use session::{ClusterSession, SessionState};
pub use timer::{TimerHandler, TimerService};

/// Why a session's close event was logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    UserAction,
    Timeout,
}

impl CloseReason {
    pub fn code(self) -> u32 {
        match self {
            CloseReason::UserAction => 0,
            CloseReason::Timeout => 1,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(CloseReason::UserAction),
            1 => Some(CloseReason::Timeout),
            _ => None,
        }
    }
}

/// Outcome code carried on session events sent back to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventCode {
    Ok,
    Error,
}

impl EventCode {
    pub fn code(self) -> u32 {
        match self {
            EventCode::Ok => 0,
            EventCode::Error => 1,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(EventCode::Ok),
            1 => Some(EventCode::Error),
            _ => None,
        }
    }
}

/// Failures surfaced by the sequencer.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ClusterError {
    /// The log publication refused every claim attempt.
    #[error("unable to append {event} event to log")]
    UnableToAppend { event: &'static str },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl ClusterError {
    pub fn transience(&self) -> Transience {
        match self {
            ClusterError::UnableToAppend { .. } => Transience::Retryable,
            ClusterError::Codec(_) => Transience::Permanent,
            ClusterError::Client(e) => e.transience(),
        }
    }
}
