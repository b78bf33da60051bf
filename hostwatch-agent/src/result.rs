use crate::plugin::{ServerData, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduler state attached to every result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerInfo {
    pub since: DateTime<Utc>,
    pub uptime_secs: u64,
    pub passes: u64,
    pub tasks: usize,
}

impl SchedulerInfo {
    pub fn starting() -> Self {
        Self {
            since: Utc::now(),
            uptime_secs: 0,
            passes: 0,
            tasks: 0,
        }
    }
}

/// Immutable snapshot of one execution, produced by the scheduler and
/// consumed by the collector (or a forwarder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub plugin: String,
    pub module: String,
    pub group: String,
    pub priority: bool,
    pub status: Status,
    pub message: String,
    pub details: ServerData,
    pub hits: u32,
    pub hits_reached: bool,
    pub produced_at: DateTime<Utc>,
    pub context: SchedulerInfo,
}

impl TaskResult {
    pub fn is_problem(&self) -> bool {
        self.status.is_problem()
    }

    /// Counted towards the collector's failure threshold.
    pub fn counts_as_failure(&self) -> bool {
        !self.priority && self.is_problem()
    }
}
