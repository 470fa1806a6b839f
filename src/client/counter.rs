//! Driver-managed counters readable by any process attached to the
//! counters file.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::concurrent::counters::CountersBuffer;

use super::{Client, ClientError};

pub(crate) struct CounterInner {
    registration_id: i64,
    counter_id: i32,
    values: CountersBuffer,
    closed: AtomicBool,
}

impl CounterInner {
    pub(crate) fn new(registration_id: i64, counter_id: i32, values: CountersBuffer) -> Self {
        Self {
            registration_id,
            counter_id,
            values,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Handle to one allocated counter cell.
#[derive(Clone)]
pub struct Counter {
    pub(crate) inner: Arc<CounterInner>,
    pub(crate) client: Client,
}

impl Counter {
    pub fn registration_id(&self) -> i64 {
        self.inner.registration_id()
    }

    pub fn counter_id(&self) -> i32 {
        self.inner.counter_id
    }

    pub fn get(&self) -> i64 {
        self.inner.values.get(self.inner.counter_id)
    }

    pub fn set(&self, value: i64) {
        self.inner.values.set(self.inner.counter_id, value);
    }

    pub fn increment(&self) -> i64 {
        self.inner.values.add(self.inner.counter_id, 1)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Release the counter at the driver. Synchronous and idempotent.
    pub fn close(&self) -> Result<(), ClientError> {
        self.client.release_counter(&self.inner)
    }
}
