//! Deadline service for cluster timers.
//!
//! Schedule and cancel requests arrive over the timer subscription;
//! expirations fire in non-decreasing deadline order, ties broken by
//! insertion order, and are appended to the log by the handler.

use std::collections::{BTreeMap, HashMap};

use crate::client::Subscription;
use crate::error::{CountedErrorHandler, Error};

use super::codecs::{self, TimerRequest};
use super::ClusterError;

/// Receiver of fired timers. An append failure is fatal to the work cycle.
pub trait TimerHandler {
    fn on_expire_timer(&mut self, correlation_id: i64, now_ms: u64) -> Result<(), ClusterError>;
}

pub struct TimerService {
    subscription: Subscription,
    fragment_limit: usize,
    poll_limit: usize,
    deadlines: BTreeMap<(u64, u64), i64>,
    by_correlation: HashMap<i64, (u64, u64)>,
    next_seq: u64,
    errors: CountedErrorHandler,
}

impl TimerService {
    pub fn new(
        subscription: Subscription,
        poll_limit: usize,
        fragment_limit: usize,
        errors: CountedErrorHandler,
    ) -> Self {
        Self {
            subscription,
            fragment_limit,
            poll_limit,
            deadlines: BTreeMap::new(),
            by_correlation: HashMap::new(),
            next_seq: 0,
            errors,
        }
    }

    /// Schedule a deadline; rescheduling an existing correlation id replaces
    /// its deadline.
    pub fn schedule(&mut self, correlation_id: i64, deadline_ms: u64) {
        self.cancel(correlation_id);
        let key = (deadline_ms, self.next_seq);
        self.next_seq += 1;
        self.deadlines.insert(key, correlation_id);
        self.by_correlation.insert(correlation_id, key);
    }

    pub fn cancel(&mut self, correlation_id: i64) -> bool {
        match self.by_correlation.remove(&correlation_id) {
            Some(key) => {
                self.deadlines.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, correlation_id: i64) -> bool {
        self.by_correlation.contains_key(&correlation_id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.deadlines.len()
    }

    /// Absorb timer-channel requests, then fire due deadlines up to the
    /// poll limit.
    pub fn poll(
        &mut self,
        now_ms: u64,
        handler: &mut dyn TimerHandler,
    ) -> Result<usize, ClusterError> {
        let mut requests = Vec::new();
        {
            let errors = &self.errors;
            self.subscription.poll(
                &mut |frame| match codecs::decode_timer_request(frame) {
                    Ok(request) => requests.push(request),
                    Err(error) => errors.on_error(&Error::Cluster(error.into())),
                },
                self.fragment_limit,
            );
        }

        let mut work_count = requests.len();
        for request in requests {
            match request {
                TimerRequest::Schedule {
                    correlation_id,
                    deadline_ms,
                } => self.schedule(correlation_id, deadline_ms),
                TimerRequest::Cancel { correlation_id } => {
                    self.cancel(correlation_id);
                }
            }
        }

        let mut fired = 0;
        while fired < self.poll_limit {
            let Some((&(deadline_ms, seq), &correlation_id)) = self.deadlines.first_key_value()
            else {
                break;
            };
            if deadline_ms > now_ms {
                break;
            }

            self.deadlines.remove(&(deadline_ms, seq));
            self.by_correlation.remove(&correlation_id);
            handler.on_expire_timer(correlation_id, now_ms)?;
            fired += 1;
        }

        work_count += fired;
        Ok(work_count)
    }
}
