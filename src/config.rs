//! Tunable surface for the client conductor and the cluster sequencer.
//!
//! Pure data only; transports and other seams are wired through the
//! context structs in [`crate::client`] and [`crate::cluster`].

use serde::{Deserialize, Serialize};

/// Client conductor timing and batching knobs.
///
/// All durations are plain integers with the unit in the field name so the
/// config serializes without surprises.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client -> driver heartbeat cadence.
    pub keep_alive_interval_ns: u64,
    /// Window without a driver heartbeat before the client gives up.
    pub driver_timeout_ms: u64,
    /// Maximum inter-tick interval before the conductor self-terminates.
    pub inter_service_timeout_ns: u64,
    /// Grace window a deregistered log buffer stays mapped.
    pub resource_linger_ns: u64,
    /// Cadence of the lingering-resource sweep.
    pub resource_check_interval_ns: u64,
    /// Duty-cycle threshold below which timeout checks are skipped.
    pub idle_sleep_ns: u64,
    /// Maximum driver events dispatched per service pass.
    pub event_batch_limit: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ns: 500_000_000,
            driver_timeout_ms: 10_000,
            inter_service_timeout_ns: 10_000_000_000,
            resource_linger_ns: 3_000_000_000,
            resource_check_interval_ns: 1_000_000_000,
            idle_sleep_ns: 16_000_000,
            event_batch_limit: 16,
        }
    }
}

impl ClientConfig {
    pub fn driver_timeout_ns(&self) -> u64 {
        self.driver_timeout_ms.saturating_mul(1_000_000)
    }
}

/// Transport addresses and admission knobs for the sequencer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub ingress_channel: String,
    pub ingress_stream_id: i32,
    pub log_channel: String,
    pub log_stream_id: i32,
    pub timer_channel: String,
    pub timer_stream_id: i32,
    /// Maximum age of a session parked in INIT before it is dropped.
    pub pending_session_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ingress_channel: "ipc:cluster-ingress".to_string(),
            ingress_stream_id: 101,
            log_channel: "ipc:cluster-log".to_string(),
            log_stream_id: 100,
            timer_channel: "ipc:cluster-timer".to_string(),
            timer_stream_id: 102,
            pending_session_timeout_ms: 5_000,
        }
    }
}
