use crate::models::EventsMap;
use hostwatch_agent::state::Shared;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerHealth {
    pub uptime_seconds: u64,
    pub hosts_tracked: usize,
    pub events_tracked: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub memory_usage_mb: Option<f32>,
}

/// Ingest counters shared by the HTTP handlers
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    accepted: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            accepted: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mark_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Unauthorized or undeliverable requests
    pub fn mark_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self, events: &Shared<EventsMap>) -> ServerHealth {
        let events = events.lock();
        let hosts: BTreeSet<&str> = events.keys().map(|(host, _)| host.as_str()).collect();
        ServerHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            hosts_tracked: hosts.len(),
            events_tracked: events.len(),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            memory_usage_mb: memory_usage_mb(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size from `/proc`, Linux only.
fn memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
        let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb as f32 / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
