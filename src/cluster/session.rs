//! Per-session identity and lifecycle for the sequencer.

use crate::client::Publication;

/// Session lifecycle. INIT sessions are parked in the pending list until
/// their open notification lands on the response publication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connected,
    Open,
    Closed,
}

/// A logically-identified client conversation whose messages are serialized
/// into the replicated log.
pub struct ClusterSession {
    id: i64,
    response_publication: Publication,
    state: SessionState,
    time_of_last_activity_ms: u64,
    last_correlation_id: i64,
}

impl ClusterSession {
    pub fn new(id: i64, response_publication: Publication) -> Self {
        Self {
            id,
            response_publication,
            state: SessionState::Init,
            time_of_last_activity_ms: 0,
            last_correlation_id: -1,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn response_publication(&self) -> &Publication {
        &self.response_publication
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Stamp activity from an ingress frame.
    pub fn last_activity(&mut self, now_ms: u64, correlation_id: i64) {
        self.time_of_last_activity_ms = now_ms;
        self.last_correlation_id = correlation_id;
    }

    pub fn time_of_last_activity_ms(&self) -> u64 {
        self.time_of_last_activity_ms
    }

    pub fn set_time_of_last_activity_ms(&mut self, now_ms: u64) {
        self.time_of_last_activity_ms = now_ms;
    }

    pub fn last_correlation_id(&self) -> i64 {
        self.last_correlation_id
    }

    /// Close the session object and its response publication. Idempotent.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Err(error) = self.response_publication.close() {
            tracing::warn!(session_id = self.id, %error, "response publication close failed");
        }
    }
}

impl std::fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("time_of_last_activity_ms", &self.time_of_last_activity_ms)
            .field("last_correlation_id", &self.last_correlation_id)
            .finish()
    }
}
