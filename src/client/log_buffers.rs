//! Refcounted handles to mapped log files, keyed by driver-assigned
//! registration id, with a lingering list that delays physical release.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::concurrent::ring::FrameQueue;

use super::ClientError;

/// A mapped log file. The mapping itself is owned by whoever implements the
/// factory; this crate only tracks lifetime.
pub trait MappedLog: Send + Sync {
    fn file_name(&self) -> &str;

    /// The term transport backed by this mapping.
    fn terms(&self) -> FrameQueue;
}

/// Maps log files on behalf of the conductor.
pub trait LogBuffersFactory: Send + Sync {
    fn map_log(&self, log_file: &str) -> Result<Box<dyn MappedLog>, ClientError>;
}

/// Refcounted wrapper around one mapped log.
pub struct LogBuffers {
    file_name: String,
    terms: FrameQueue,
    mapped: Mutex<Option<Box<dyn MappedLog>>>,
    ref_count: AtomicI32,
    time_of_last_state_change_ns: AtomicU64,
}

impl LogBuffers {
    fn new(mapped: Box<dyn MappedLog>) -> Self {
        Self {
            file_name: mapped.file_name().to_string(),
            terms: mapped.terms(),
            mapped: Mutex::new(Some(mapped)),
            ref_count: AtomicI32::new(0),
            time_of_last_state_change_ns: AtomicU64::new(0),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn terms(&self) -> FrameQueue {
        self.terms.clone()
    }

    pub fn inc_ref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dec_ref(&self) -> i32 {
        self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn time_of_last_state_change_ns(&self) -> u64 {
        self.time_of_last_state_change_ns.load(Ordering::Acquire)
    }

    pub fn set_time_of_last_state_change_ns(&self, now_ns: u64) {
        self.time_of_last_state_change_ns
            .store(now_ns, Ordering::Release);
    }

    /// Drop the mapping. Idempotent.
    pub fn delete(&self) {
        self.mapped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_deleted(&self) -> bool {
        self.mapped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// The log-buffer cache: primary map plus the lingering list of handles
/// pending physical release.
pub struct LogBufferCache {
    factory: Arc<dyn LogBuffersFactory>,
    by_registration_id: HashMap<i64, Arc<LogBuffers>>,
    lingering: Vec<Arc<LogBuffers>>,
}

impl LogBufferCache {
    pub fn new(factory: Arc<dyn LogBuffersFactory>) -> Self {
        Self {
            factory,
            by_registration_id: HashMap::new(),
            lingering: Vec::new(),
        }
    }

    /// Map on first use, otherwise return the cached handle; the refcount is
    /// incremented either way.
    pub fn acquire(
        &mut self,
        registration_id: i64,
        log_file: &str,
    ) -> Result<Arc<LogBuffers>, ClientError> {
        let log_buffers = match self.by_registration_id.get(&registration_id) {
            Some(existing) => Arc::clone(existing),
            None => {
                let mapped = self.factory.map_log(log_file)?;
                let log_buffers = Arc::new(LogBuffers::new(mapped));
                self.by_registration_id
                    .insert(registration_id, Arc::clone(&log_buffers));
                log_buffers
            }
        };

        log_buffers.inc_ref();
        Ok(log_buffers)
    }

    /// Decrement; at zero the handle leaves the primary map and joins the
    /// lingering list stamped with the current monotonic time.
    pub fn release(&mut self, log_buffers: &Arc<LogBuffers>, registration_id: i64, now_ns: u64) {
        if log_buffers.dec_ref() == 0 {
            log_buffers.set_time_of_last_state_change_ns(now_ns);
            self.by_registration_id.remove(&registration_id);
            self.lingering.push(Arc::clone(log_buffers));
        }
    }

    /// Physically release every lingering handle older than `linger_ns`.
    pub fn check_lingering(&mut self, now_ns: u64, linger_ns: u64) -> usize {
        let mut released = 0;
        for i in (0..self.lingering.len()).rev() {
            if now_ns > self.lingering[i].time_of_last_state_change_ns() + linger_ns {
                let log_buffers = self.lingering.swap_remove(i);
                log_buffers.delete();
                released += 1;
            }
        }
        released
    }

    /// Physically release everything still lingering, ignoring the linger
    /// window. Used during shutdown.
    pub fn delete_all_lingering(&mut self) {
        for log_buffers in self.lingering.drain(..) {
            log_buffers.delete();
        }
    }

    pub fn lingering_len(&self) -> usize {
        self.lingering.len()
    }

    pub fn mapped_len(&self) -> usize {
        self.by_registration_id.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct FakeMapped {
        name: String,
        terms: FrameQueue,
    }

    impl MappedLog for FakeMapped {
        fn file_name(&self) -> &str {
            &self.name
        }

        fn terms(&self) -> FrameQueue {
            self.terms.clone()
        }
    }

    struct CountingFactory {
        maps: AtomicUsize,
    }

    impl LogBuffersFactory for CountingFactory {
        fn map_log(&self, log_file: &str) -> Result<Box<dyn MappedLog>, ClientError> {
            self.maps.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeMapped {
                name: log_file.to_string(),
                terms: FrameQueue::default(),
            }))
        }
    }

    fn cache() -> (LogBufferCache, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory {
            maps: AtomicUsize::new(0),
        });
        (LogBufferCache::new(factory.clone()), factory)
    }

    #[test]
    fn acquire_maps_once_per_registration_id() {
        let (mut cache, factory) = cache();
        let a = cache.acquire(17, "/tmp/log-17").unwrap();
        let b = cache.acquire(17, "/tmp/log-17").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.maps.load(Ordering::SeqCst), 1);
        assert_eq!(a.ref_count(), 2);
    }

    #[test]
    fn release_to_zero_moves_to_lingering() {
        let (mut cache, _) = cache();
        let lb = cache.acquire(5, "/tmp/log-5").unwrap();

        cache.release(&lb, 5, 100);
        assert_eq!(cache.mapped_len(), 0);
        assert_eq!(cache.lingering_len(), 1);
        assert_eq!(lb.time_of_last_state_change_ns(), 100);
        assert!(!lb.is_deleted());
    }

    #[test]
    fn lingering_release_respects_window() {
        let (mut cache, _) = cache();
        let lb = cache.acquire(5, "/tmp/log-5").unwrap();
        cache.release(&lb, 5, 100);

        assert_eq!(cache.check_lingering(100 + 50, 60), 0);
        assert!(!lb.is_deleted());

        assert_eq!(cache.check_lingering(100 + 61, 60), 1);
        assert!(lb.is_deleted());
        assert_eq!(cache.lingering_len(), 0);
    }

    #[test]
    fn shared_log_releases_only_at_zero() {
        let (mut cache, _) = cache();
        let a = cache.acquire(9, "/tmp/log-9").unwrap();
        let b = cache.acquire(9, "/tmp/log-9").unwrap();
        assert_eq!(a.ref_count(), 2);

        cache.release(&a, 9, 10);
        assert_eq!(cache.lingering_len(), 0);
        assert_eq!(cache.mapped_len(), 1);

        cache.release(&b, 9, 20);
        assert_eq!(cache.lingering_len(), 1);
        assert_eq!(cache.mapped_len(), 0);
    }

    #[test]
    fn delete_all_lingering_ignores_window() {
        let (mut cache, _) = cache();
        let lb = cache.acquire(1, "/tmp/log-1").unwrap();
        cache.release(&lb, 1, 5);
        cache.delete_all_lingering();
        assert!(lb.is_deleted());
        assert_eq!(cache.lingering_len(), 0);
    }
}
