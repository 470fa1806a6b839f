//! Bounded record transports.
//!
//! [`RecordRing`] is the lock-free multi-producer queue backing the driver
//! control plane in each direction. [`FrameQueue`] is the single-consumer
//! frame pipe standing in for a mapped term buffer; it supports the
//! peek-then-consume discipline controlled polling needs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;

/// Bounded lock-free queue of typed records.
pub struct RecordRing<T> {
    queue: Arc<ArrayQueue<T>>,
}

impl<T> Clone for RecordRing<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> RecordRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
        }
    }

    /// Offer a record; hands the record back when the ring is full so the
    /// caller can back off and retry.
    pub fn offer(&self, record: T) -> Result<(), T> {
        self.queue.push(record)
    }

    /// Consume up to `limit` records, invoking `f` for each.
    pub fn drain(&self, limit: usize, mut f: impl FnMut(T)) -> usize {
        let mut consumed = 0;
        while consumed < limit {
            match self.queue.pop() {
                Some(record) => {
                    f(record);
                    consumed += 1;
                }
                None => break,
            }
        }
        consumed
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Bounded frame pipe with peek support. One consumer by construction;
/// producers may be many.
#[derive(Clone)]
pub struct FrameQueue {
    frames: Arc<Mutex<VecDeque<Bytes>>>,
    capacity: usize,
}

impl FrameQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    /// Append a frame; false when the pipe is full.
    pub fn offer(&self, frame: Bytes) -> bool {
        let mut frames = self.lock();
        if frames.len() >= self.capacity {
            return false;
        }
        frames.push_back(frame);
        true
    }

    /// Room for at least one more frame.
    pub fn can_accept(&self) -> bool {
        self.lock().len() < self.capacity
    }

    /// The frame at the head, without consuming it.
    pub fn peek(&self) -> Option<Bytes> {
        self.lock().front().cloned()
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Bytes>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}
