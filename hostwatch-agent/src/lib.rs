//! Hostwatch agent
//!
//! Runs cron-scheduled checks against the local host, batches their results
//! into report sinks (or forwards them to a remote collector) and guards the
//! scheduler loop with a watchdog.

pub mod agent;
pub mod checks;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod forwarder;
pub mod metrics;
pub mod plugin;
pub mod reload;
pub mod result;
pub mod scheduler;
pub mod state;
pub mod watchdog;

pub use agent::{Agent, AgentSummary};
pub use collector::{Collector, CollectorStats, ReportSink, ResultQueue, SinkRegistry};
pub use config::{HostwatchConfig, PublishThresholds, TaskSpec};
pub use forwarder::{AgentRequest, Forwarder, HttpForwarder};
pub use plugin::{Check, Outcome, PluginRegistry, ServerData, Status};
pub use reload::{ConfigSource, FileConfigSource, MemoryConfig};
pub use result::{SchedulerInfo, TaskResult};
pub use scheduler::{Scheduler, SchedulerSettings};
pub use state::Shutdown;
pub use watchdog::{AbortHandler, SignalAbort, Watchdog, WatchdogMode};
