//! Health tracking for a bus instance.
//!
//! A bus is healthy while its transport is connected and it either has not
//! seen an error in the last minute or has published successfully since the
//! last error.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared_types::now_ms;

/// How long an error keeps the bus unhealthy without a successful publish.
pub const ERROR_WINDOW_MS: u64 = 60_000;

/// Snapshot returned by [`crate::EventBus::get_health`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub connected: bool,
    pub last_publish_at: Option<u64>,
    pub last_error_at: Option<u64>,
    pub last_error: Option<String>,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct HealthState {
    connected: bool,
    last_publish_at: Option<u64>,
    last_error_at: Option<u64>,
    last_error: Option<String>,
    published_since_error: bool,
}

/// Tracks connection state, last publish and last error.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    state: RwLock<HealthState>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.write().connected = connected;
    }

    pub fn record_publish(&self) {
        self.record_publish_at(now_ms());
    }

    pub fn record_error(&self, error: impl Into<String>) {
        self.record_error_at(error, now_ms());
    }

    fn record_publish_at(&self, at: u64) {
        let mut state = self.state.write();
        state.last_publish_at = Some(at);
        state.published_since_error = true;
    }

    fn record_error_at(&self, error: impl Into<String>, at: u64) {
        let mut state = self.state.write();
        state.last_error_at = Some(at);
        state.last_error = Some(error.into());
        state.published_since_error = false;
    }

    pub fn status(&self) -> HealthStatus {
        self.status_at(now_ms())
    }

    fn status_at(&self, now: u64) -> HealthStatus {
        let state = self.state.read();
        let error_cleared = match state.last_error_at {
            None => true,
            Some(at) => state.published_since_error || now.saturating_sub(at) >= ERROR_WINDOW_MS,
        };
        HealthStatus {
            connected: state.connected,
            last_publish_at: state.last_publish_at,
            last_error_at: state.last_error_at,
            last_error: state.last_error.clone(),
            healthy: state.connected && error_cleared,
        }
    }
}
