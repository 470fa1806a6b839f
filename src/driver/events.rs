//! Event side of the driver control plane.

use crate::concurrent::ring::RecordRing;

use super::DriverEvent;

/// Drains driver events from the events ring and tracks the correlation id
/// of the last request-concluding event, which `await_response` polls to
/// know when its round trip has completed.
pub struct DriverEventsAdapter {
    events: RecordRing<DriverEvent>,
    last_received_correlation_id: i64,
}

impl DriverEventsAdapter {
    pub const NO_CORRELATION_ID: i64 = -1;

    pub fn new(events: RecordRing<DriverEvent>) -> Self {
        Self {
            events,
            last_received_correlation_id: Self::NO_CORRELATION_ID,
        }
    }

    /// Drain up to `limit` events into `out`, updating the last received
    /// correlation id as response events pass through.
    pub fn drain(&mut self, limit: usize, out: &mut Vec<DriverEvent>) -> usize {
        let last = &mut self.last_received_correlation_id;
        self.events.drain(limit, |event| {
            if let Some(correlation_id) = event.response_correlation_id() {
                *last = correlation_id;
            }
            out.push(event);
        })
    }

    pub fn last_received_correlation_id(&self) -> i64 {
        self.last_received_correlation_id
    }
}
