//! Release events and their running statistics

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Whether a release destroyed the resource or only shrank it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    Full,
    Incremental,
}

/// Which path triggered a release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseCause {
    Explicit,
    Pressure,
    Expired,
}

/// Emitted after every successful release
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseEvent {
    pub resource_id: String,
    pub type_name: String,
    pub freed_bytes: u64,
    pub kind: ReleaseKind,
    pub cause: ReleaseCause,
    pub snapshot_taken: bool,
    pub released_at: DateTime<Utc>,
    pub duration_ms: f64,
}

/// Per-type release totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeReleaseStats {
    pub count: u64,
    pub bytes: u64,
}

/// Aggregate release statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseStats {
    pub total_released_bytes: u64,
    pub release_count: u64,
    pub incremental_count: u64,
    pub failed_count: u64,
    pub snapshots_taken: u64,
    pub total_duration_ms: f64,
    /// Freed bytes per millisecond of release work
    pub avg_efficiency: f64,
    pub max_efficiency: f64,
    pub by_type: BTreeMap<String, TypeReleaseStats>,
    pub rollback_count: u64,
    pub rollback_success_rate: f64,
}

impl Default for ReleaseStats {
    fn default() -> Self {
        Self {
            total_released_bytes: 0,
            release_count: 0,
            incremental_count: 0,
            failed_count: 0,
            snapshots_taken: 0,
            total_duration_ms: 0.0,
            avg_efficiency: 0.0,
            max_efficiency: 0.0,
            by_type: BTreeMap::new(),
            rollback_count: 0,
            rollback_success_rate: 1.0,
        }
    }
}

/// Bounded release history plus running totals.
#[derive(Debug)]
pub struct ReleaseLog {
    history: VecDeque<ReleaseEvent>,
    capacity: usize,
    stats: ReleaseStats,
    rollback_successes: u64,
}

impl ReleaseLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            stats: ReleaseStats::default(),
            rollback_successes: 0,
        }
    }

    pub fn record(&mut self, event: ReleaseEvent) {
        let stats = &mut self.stats;
        stats.total_released_bytes += event.freed_bytes;
        stats.release_count += 1;
        if event.kind == ReleaseKind::Incremental {
            stats.incremental_count += 1;
        }
        if event.snapshot_taken {
            stats.snapshots_taken += 1;
        }

        stats.total_duration_ms += event.duration_ms;
        if event.duration_ms > 0.0 {
            let efficiency = event.freed_bytes as f64 / event.duration_ms;
            stats.max_efficiency = stats.max_efficiency.max(efficiency);
        }
        if stats.total_duration_ms > 0.0 {
            stats.avg_efficiency = stats.total_released_bytes as f64 / stats.total_duration_ms;
        }

        let by_type = stats.by_type.entry(event.type_name.clone()).or_default();
        by_type.count += 1;
        by_type.bytes += event.freed_bytes;

        if self.capacity == 0 {
            return;
        }
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }

    pub fn record_failure(&mut self) {
        self.stats.failed_count += 1;
    }

    pub fn record_rollback(&mut self, succeeded: bool) {
        self.stats.rollback_count += 1;
        if succeeded {
            self.rollback_successes += 1;
        }
        self.stats.rollback_success_rate =
            self.rollback_successes as f64 / self.stats.rollback_count as f64;
    }

    /// Up to `limit` most recent events, newest first
    pub fn recent(&self, limit: usize) -> Vec<ReleaseEvent> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> ReleaseStats {
        self.stats.clone()
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.stats = ReleaseStats::default();
        self.rollback_successes = 0;
    }
}
