//! Health/stats reporting for the running engine. Trimmed from a general
//! health-check registry down to the handful of signals this engine
//! actually produces: ring buffer occupancy, sync state, and the circuit
//! breaker's view of recent failures.

use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::sync_engine::SyncStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    /// Synchronizing or recovering; not yet a problem worth surfacing
    /// loudly.
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    pub overall_status: HealthStatus,
    pub uptime_seconds: u64,
    pub timestamp: u64,
    pub sync_iterations: u64,
    pub synced: bool,
    pub last_stretch_ratio: f32,
    pub input_overruns: u64,
    pub output_ring_fill_percent: f64,
}

impl EngineReport {
    fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Builds [`EngineReport`]s from the engine's own stats; no background
/// polling thread or registry of pluggable checks, since there is exactly
/// one thing to check.
pub struct EngineMonitor {
    start_time: Instant,
}

impl EngineMonitor {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn report(
        &self,
        sync_stats: SyncStats,
        input_overruns: u64,
        output_ring_len: usize,
        output_ring_capacity: usize,
    ) -> EngineReport {
        let fill_percent = if output_ring_capacity == 0 {
            0.0
        } else {
            100.0 * output_ring_len as f64 / output_ring_capacity as f64
        };

        let overall_status = if !sync_stats.synced {
            HealthStatus::Warning
        } else if input_overruns > 0 || fill_percent < 5.0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        EngineReport {
            overall_status,
            uptime_seconds: self.start_time.elapsed().as_secs(),
            timestamp: EngineReport::current_timestamp(),
            sync_iterations: sync_stats.iterations,
            synced: sync_stats.synced,
            last_stretch_ratio: sync_stats.last_ratio,
            input_overruns,
            output_ring_fill_percent: fill_percent,
        }
    }
}

impl Default for EngineMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_engine::SyncStats;

    #[test]
    fn unsynced_engine_reports_warning() {
        let monitor = EngineMonitor::new();
        let stats = SyncStats {
            synced: false,
            ..Default::default()
        };
        let report = monitor.report(stats, 0, 100, 200);
        assert_eq!(report.overall_status, HealthStatus::Warning);
    }

    #[test]
    fn synced_engine_with_full_buffers_reports_healthy() {
        let monitor = EngineMonitor::new();
        let stats = SyncStats {
            synced: true,
            iterations: 10,
            ..Default::default()
        };
        let report = monitor.report(stats, 0, 100, 200);
        assert_eq!(report.overall_status, HealthStatus::Healthy);
    }

    #[test]
    fn overruns_downgrade_to_warning() {
        let monitor = EngineMonitor::new();
        let stats = SyncStats {
            synced: true,
            ..Default::default()
        };
        let report = monitor.report(stats, 3, 100, 200);
        assert_eq!(report.overall_status, HealthStatus::Warning);
    }
}
