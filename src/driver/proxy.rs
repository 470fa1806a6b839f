//! Command side of the driver control plane.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;

use crate::concurrent::idle::{IdleStrategy, Idler};
use crate::concurrent::ring::RecordRing;

use super::{DriverCommand, DriverHeartbeat};

/// Writes client commands onto the command ring, minting a fresh correlation
/// id per mutating call. A full ring backs off with the configured idle
/// strategy; there is no retry budget at this layer, since the conductor's
/// response timeout bounds the overall wait.
pub struct DriverProxy {
    commands: RecordRing<DriverCommand>,
    heartbeat: DriverHeartbeat,
    next_correlation_id: Arc<AtomicI64>,
    idler: Idler,
    client_id: i64,
}

impl DriverProxy {
    pub fn new(
        commands: RecordRing<DriverCommand>,
        heartbeat: DriverHeartbeat,
        idle_strategy: IdleStrategy,
    ) -> Self {
        let next_correlation_id = Arc::new(AtomicI64::new(1));
        let client_id = next_correlation_id.fetch_add(1, Ordering::Relaxed);
        Self {
            commands,
            heartbeat,
            next_correlation_id,
            idler: Idler::new(idle_strategy),
            client_id,
        }
    }

    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    pub fn next_correlation_id(&self) -> i64 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Monotonic wall-clock of the driver's last heartbeat.
    pub fn time_of_last_driver_keepalive_ms(&self) -> u64 {
        self.heartbeat.time_ms()
    }

    pub fn add_publication(&mut self, channel: &str, stream_id: i32) -> i64 {
        let correlation_id = self.next_correlation_id();
        self.offer(DriverCommand::AddPublication {
            correlation_id,
            channel: channel.to_string(),
            stream_id,
        });
        correlation_id
    }

    pub fn add_exclusive_publication(&mut self, channel: &str, stream_id: i32) -> i64 {
        let correlation_id = self.next_correlation_id();
        self.offer(DriverCommand::AddExclusivePublication {
            correlation_id,
            channel: channel.to_string(),
            stream_id,
        });
        correlation_id
    }

    pub fn remove_publication(&mut self, registration_id: i64) -> i64 {
        let correlation_id = self.next_correlation_id();
        self.offer(DriverCommand::RemovePublication {
            correlation_id,
            registration_id,
        });
        correlation_id
    }

    pub fn add_subscription(&mut self, channel: &str, stream_id: i32) -> i64 {
        let correlation_id = self.next_correlation_id();
        self.offer(DriverCommand::AddSubscription {
            correlation_id,
            channel: channel.to_string(),
            stream_id,
        });
        correlation_id
    }

    pub fn remove_subscription(&mut self, registration_id: i64) -> i64 {
        let correlation_id = self.next_correlation_id();
        self.offer(DriverCommand::RemoveSubscription {
            correlation_id,
            registration_id,
        });
        correlation_id
    }

    pub fn add_counter(&mut self, type_id: i32, key: Bytes, label: &str) -> i64 {
        let correlation_id = self.next_correlation_id();
        self.offer(DriverCommand::AddCounter {
            correlation_id,
            type_id,
            key,
            label: label.to_string(),
        });
        correlation_id
    }

    pub fn remove_counter(&mut self, registration_id: i64) -> i64 {
        let correlation_id = self.next_correlation_id();
        self.offer(DriverCommand::RemoveCounter {
            correlation_id,
            registration_id,
        });
        correlation_id
    }

    pub fn add_destination(&mut self, registration_id: i64, channel: &str) -> i64 {
        let correlation_id = self.next_correlation_id();
        self.offer(DriverCommand::AddDestination {
            correlation_id,
            registration_id,
            channel: channel.to_string(),
        });
        correlation_id
    }

    pub fn remove_destination(&mut self, registration_id: i64, channel: &str) -> i64 {
        let correlation_id = self.next_correlation_id();
        self.offer(DriverCommand::RemoveDestination {
            correlation_id,
            registration_id,
            channel: channel.to_string(),
        });
        correlation_id
    }

    /// Fire-and-forget liveness heartbeat.
    pub fn send_client_keepalive(&mut self) {
        self.offer(DriverCommand::ClientKeepalive {
            client_id: self.client_id,
        });
    }

    fn offer(&mut self, command: DriverCommand) {
        let mut pending = command;
        loop {
            match self.commands.offer(pending) {
                Ok(()) => {
                    self.idler.reset();
                    return;
                }
                Err(returned) => {
                    pending = returned;
                    self.idler.idle(0);
                }
            }
        }
    }
}
