//! Cells in the shared counters file.
//!
//! The driver owns the file and allocates cell ids; each cell is written by
//! exactly one party and read atomically by everyone else.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Maximum length of a counter's opaque key.
pub const MAX_KEY_LENGTH: usize = 112;
/// Maximum length of a counter's label.
pub const MAX_LABEL_LENGTH: usize = 380;

/// Channel endpoint status values, as published into status-indicator cells.
pub mod channel_status {
    /// Sentinel id meaning no status indicator was allocated.
    pub const NO_ID_ALLOCATED: i32 = -1;

    pub const INITIALIZING: i64 = 0;
    pub const ACTIVE: i64 = 1;
    pub const CLOSING: i64 = 2;
    pub const ERRORED: i64 = -1;
}

/// The counter values buffer: a dense array of atomically readable cells.
#[derive(Clone)]
pub struct CountersBuffer {
    cells: Arc<Vec<AtomicI64>>,
}

impl CountersBuffer {
    pub fn new(num_counters: usize) -> Self {
        let mut cells = Vec::with_capacity(num_counters);
        cells.resize_with(num_counters, || AtomicI64::new(0));
        Self {
            cells: Arc::new(cells),
        }
    }

    pub fn get(&self, id: i32) -> i64 {
        self.cells[id as usize].load(Ordering::Acquire)
    }

    pub fn set(&self, id: i32, value: i64) {
        self.cells[id as usize].store(value, Ordering::Release);
    }

    pub fn add(&self, id: i32, delta: i64) -> i64 {
        self.cells[id as usize].fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl std::fmt::Debug for CountersBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountersBuffer")
            .field("len", &self.len())
            .finish()
    }
}

/// A single owned cell, such as a publication limit or a subscriber position.
#[derive(Clone, Debug)]
pub struct Position {
    buffer: CountersBuffer,
    id: i32,
}

impl Position {
    pub fn new(buffer: CountersBuffer, id: i32) -> Self {
        Self { buffer, id }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn get(&self) -> i64 {
        self.buffer.get(self.id)
    }

    pub fn set(&self, value: i64) {
        self.buffer.set(self.id, value);
    }
}

/// Read side of a channel status cell. The driver may decline to allocate
/// one, in which case the sentinel indicator always reads as active.
#[derive(Clone, Debug)]
pub enum StatusIndicator {
    Unallocated,
    Cell { buffer: CountersBuffer, id: i32 },
}

impl StatusIndicator {
    /// Bind to the cell named by a driver event, honoring the
    /// [`channel_status::NO_ID_ALLOCATED`] sentinel.
    pub fn from_id(buffer: &CountersBuffer, id: i32) -> Self {
        if id == channel_status::NO_ID_ALLOCATED {
            StatusIndicator::Unallocated
        } else {
            StatusIndicator::Cell {
                buffer: buffer.clone(),
                id,
            }
        }
    }

    pub fn id(&self) -> i32 {
        match self {
            StatusIndicator::Unallocated => channel_status::NO_ID_ALLOCATED,
            StatusIndicator::Cell { id, .. } => *id,
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            StatusIndicator::Unallocated => channel_status::ACTIVE,
            StatusIndicator::Cell { buffer, id } => buffer.get(*id),
        }
    }
}
