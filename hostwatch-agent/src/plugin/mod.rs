//! Plugin contract
//!
//! A `Check` is the pluggable unit of work. The scheduler never talks to a
//! check directly: it drives a `PluginInstance`, which owns the check together
//! with its parsed schedule and the per-task state (status, message, server
//! data, consecutive non-OK hit count).

pub mod cron;
pub mod data;
pub mod registry;

pub use self::cron::{CronError, CronSchedule};
pub use data::{
    ExceptionData, FileData, FilesystemData, ProcessData, ProcessSummary, ServerData,
    ServerLoadsData,
};
pub use registry::{CheckFactory, PluginRegistry, RegistryError};

use crate::config::TaskSpec;
use crate::metrics::DEFAULT_SAMPLE_INTERVAL;
use crate::result::{SchedulerInfo, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Not enough data yet to decide
    Collecting,
    Ok,
    Warning,
    Failed,
}

impl Status {
    pub fn is_problem(self) -> bool {
        matches!(self, Status::Warning | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Collecting => "COLLECTING",
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Failed => "FAILED",
        };
        f.write_str(text)
    }
}

/// What a check reports for one execution
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: Status,
    pub message: String,
    pub data: ServerData,
}

impl Outcome {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: ServerData::None,
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(Status::Ok, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Status::Warning, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Status::Failed, message)
    }

    pub fn collecting(message: impl Into<String>) -> Self {
        Self::new(Status::Collecting, message)
    }

    pub fn with_data(mut self, data: ServerData) -> Self {
        self.data = data;
        self
    }
}

/// Per-tick information handed to every execution
#[derive(Debug, Clone)]
pub struct ExecContext {
    /// Minute-truncated local time the schedule was evaluated at
    pub reference_time: DateTime<Local>,
    pub info: SchedulerInfo,
}

/// Agent-wide settings available to check factories
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub sample_interval: Duration,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

#[async_trait]
pub trait Check: Send {
    async fn execute(&mut self, ctx: &ExecContext) -> anyhow::Result<Outcome>;

    /// Applies a changed spec in place. Errors keep the previous settings.
    fn reconfigure(&mut self, _spec: &TaskSpec) -> anyhow::Result<()> {
        Ok(())
    }

    fn run_on_startup(&self) -> bool {
        false
    }

    /// Releases background resources (sampler loops).
    async fn stop(&mut self) {}
}

/// An execution that did not produce an outcome
#[derive(Debug, Clone, PartialEq)]
pub struct PluginFault {
    pub message: String,
    pub stack: Vec<String>,
}

impl PluginFault {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: err.chain().map(|cause| cause.to_string()).collect(),
        }
    }

    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let text = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self {
            message: format!("check panicked: {text}"),
            stack: vec![text],
        }
    }

    pub fn timed_out(limit: Duration) -> Self {
        let message = format!("check did not finish within {}s", limit.as_secs_f64());
        Self {
            stack: vec![message.clone()],
            message,
        }
    }
}

/// A configured check and its runtime state.
pub struct PluginInstance {
    spec: TaskSpec,
    schedule: CronSchedule,
    check: Box<dyn Check>,
    status: Status,
    message: String,
    server_data: ServerData,
    hit_count: u32,
    since: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    generation: u64,
    retired: bool,
}

impl PluginInstance {
    pub fn new(spec: TaskSpec, check: Box<dyn Check>, generation: u64) -> Result<Self, CronError> {
        let schedule = CronSchedule::parse(&spec.cron)?;
        Ok(Self::with_schedule(spec, schedule, check, generation))
    }

    /// Like `new`, for a cron expression the caller already parsed.
    pub fn with_schedule(
        spec: TaskSpec,
        schedule: CronSchedule,
        check: Box<dyn Check>,
        generation: u64,
    ) -> Self {
        Self {
            spec,
            schedule,
            check,
            status: Status::Collecting,
            message: String::new(),
            server_data: ServerData::None,
            hit_count: 0,
            since: Utc::now(),
            last_run_at: None,
            generation,
            retired: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn module(&self) -> &str {
        &self.spec.module
    }

    pub fn cron(&self) -> &CronSchedule {
        &self.schedule
    }

    pub fn group(&self) -> &str {
        &self.spec.group
    }

    pub fn priority(&self) -> bool {
        self.spec.priority
    }

    /// Enabled in its spec and still present in the configuration.
    pub fn enabled(&self) -> bool {
        self.spec.enabled && !self.retired
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.spec.attributes
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn server_data(&self) -> &ServerData {
        &self.server_data
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        self.last_run_at
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn run_on_startup(&self) -> bool {
        self.spec
            .run_on_startup
            .unwrap_or_else(|| self.check.run_on_startup())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.spec.timeout_limit()
    }

    pub fn is_due(&self, at: &DateTime<Local>) -> bool {
        self.schedule.matches(at)
    }

    pub fn hits_reached(&self) -> bool {
        self.hit_count >= self.spec.hits
    }

    pub fn reset_hits(&mut self) {
        self.hit_count = 0;
    }

    pub fn increment_hit(&mut self) {
        self.hit_count = self.hit_count.saturating_add(1);
    }

    /// Runs the check once and records its outcome. Errors are returned
    /// untouched; the caller turns them into a failure with `fail()`.
    pub async fn execute(&mut self, ctx: &ExecContext) -> anyhow::Result<Status> {
        self.last_run_at = Some(Utc::now());
        let outcome = self.check.execute(ctx).await?;
        Ok(self.apply(outcome))
    }

    pub fn apply(&mut self, outcome: Outcome) -> Status {
        self.status = outcome.status;
        self.message = outcome.message;
        self.server_data = outcome.data;
        if self.status == Status::Ok {
            self.reset_hits();
        } else {
            self.increment_hit();
        }
        self.status
    }

    pub fn fail(&mut self, fault: PluginFault) -> Status {
        self.apply(Outcome {
            status: Status::Failed,
            message: fault.message,
            data: ServerData::Exception(ExceptionData {
                exception: fault.stack.first().cloned().unwrap_or_default(),
                stacktrace: fault.stack,
            }),
        })
    }

    /// Moves the instance to a new config generation. Returns `Ok(true)` when
    /// the spec changed; an unchanged spec keeps all runtime state. A rejected
    /// spec leaves the instance untouched, generation included.
    pub fn reconfigure(&mut self, spec: TaskSpec, generation: u64) -> anyhow::Result<bool> {
        if spec == self.spec {
            self.generation = generation;
            self.retired = false;
            return Ok(false);
        }
        let schedule = CronSchedule::parse(&spec.cron)?;
        self.check.reconfigure(&spec)?;
        self.schedule = schedule;
        self.spec = spec;
        self.generation = generation;
        self.retired = false;
        Ok(true)
    }

    /// Keeps the instance (and its state) but stops scheduling it until the
    /// spec reappears. The check is stopped, so background samplers end here.
    pub async fn retire(&mut self) {
        self.retired = true;
        self.check.stop().await;
    }

    /// Brings a retired instance back with a freshly built check. Status, hits
    /// and `since` carry over from before the retirement.
    pub fn revive(
        &mut self,
        spec: TaskSpec,
        schedule: CronSchedule,
        check: Box<dyn Check>,
        generation: u64,
    ) {
        self.spec = spec;
        self.schedule = schedule;
        self.check = check;
        self.generation = generation;
        self.retired = false;
    }

    pub fn snapshot(&self, info: &SchedulerInfo) -> TaskResult {
        TaskResult {
            plugin: self.spec.name.clone(),
            module: self.spec.module.clone(),
            group: self.spec.group.clone(),
            priority: self.spec.priority,
            status: self.status,
            message: self.message.clone(),
            details: self.server_data.clone(),
            hits: self.hit_count,
            hits_reached: self.hits_reached(),
            produced_at: Utc::now(),
            context: info.clone(),
        }
    }

    pub async fn stop(&mut self) {
        self.check.stop().await;
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.spec.name)
            .field("module", &self.spec.module)
            .field("status", &self.status)
            .field("hit_count", &self.hit_count)
            .field("retired", &self.retired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Sequence(VecDeque<Status>);

    #[async_trait]
    impl Check for Sequence {
        async fn execute(&mut self, _ctx: &ExecContext) -> anyhow::Result<Outcome> {
            match self.0.pop_front() {
                Some(status) => Ok(Outcome::new(status, status.to_string())),
                None => anyhow::bail!("script exhausted"),
            }
        }
    }

    fn ctx() -> ExecContext {
        ExecContext {
            reference_time: Local::now(),
            info: SchedulerInfo::starting(),
        }
    }

    fn instance(hits: u32, script: &[Status]) -> PluginInstance {
        let mut spec = TaskSpec::new("dummy", "sequence");
        spec.hits = hits;
        PluginInstance::new(spec, Box::new(Sequence(script.iter().copied().collect())), 1).unwrap()
    }

    #[tokio::test]
    async fn test_starts_collecting() {
        let instance = instance(1, &[]);
        assert_eq!(instance.status(), Status::Collecting);
        assert_eq!(instance.hit_count(), 0);
        assert!(!instance.hits_reached());
        assert_eq!(instance.server_data(), &ServerData::None);
    }

    #[tokio::test]
    async fn test_hits_follow_consecutive_non_ok() {
        let script = [Status::Failed, Status::Warning, Status::Failed, Status::Ok];
        let mut instance = instance(3, &script);
        let ctx = ctx();
        instance.reset_hits();

        instance.execute(&ctx).await.unwrap();
        instance.execute(&ctx).await.unwrap();
        assert!(!instance.hits_reached());

        instance.execute(&ctx).await.unwrap();
        assert_eq!(instance.hit_count(), 3);
        assert!(instance.hits_reached());

        assert_eq!(instance.execute(&ctx).await.unwrap(), Status::Ok);
        assert_eq!(instance.hit_count(), 0);
        assert!(!instance.hits_reached());
    }

    #[tokio::test]
    async fn test_collecting_counts_as_non_ok() {
        let mut instance = instance(2, &[Status::Collecting, Status::Collecting]);
        let ctx = ctx();
        instance.execute(&ctx).await.unwrap();
        instance.execute(&ctx).await.unwrap();
        assert_eq!(instance.status(), Status::Collecting);
        assert!(instance.hits_reached());
    }

    #[tokio::test]
    async fn test_error_becomes_exception_data() {
        let mut instance = instance(1, &[]);
        let err = instance.execute(&ctx()).await.unwrap_err();
        let status = instance.fail(PluginFault::from_error(&err));

        assert_eq!(status, Status::Failed);
        assert_eq!(instance.message(), "script exhausted");
        match instance.server_data() {
            ServerData::Exception(data) => {
                assert_eq!(data.exception, "script exhausted");
                assert_eq!(data.stacktrace, vec!["script exhausted".to_string()]);
            }
            other => panic!("unexpected data {other:?}"),
        }
        assert!(instance.last_run_at().is_some());
    }

    #[test]
    fn test_panic_payloads() {
        let fault = PluginFault::from_panic(&"index out of bounds");
        assert_eq!(fault.message, "check panicked: index out of bounds");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(PluginFault::from_panic(owned.as_ref()).stack, vec!["owned".to_string()]);
    }

    #[tokio::test]
    async fn test_reconfigure_unchanged_keeps_state() {
        let mut instance = instance(1, &[Status::Failed]);
        instance.execute(&ctx()).await.unwrap();
        let since = instance.since();
        let spec = instance.spec().clone();

        assert!(!instance.reconfigure(spec.clone(), 2).unwrap());
        assert_eq!(instance.since(), since);
        assert_eq!(instance.hit_count(), 1);
        assert_eq!(instance.status(), Status::Failed);
        assert_eq!(instance.generation(), 2);

        let changed = spec.with_cron("0 * * * *");
        assert!(instance.reconfigure(changed, 3).unwrap());
        assert_eq!(instance.cron().expr(), "0 * * * *");
        assert_eq!(instance.hit_count(), 1);
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_bad_cron() {
        let mut instance = instance(1, &[]);
        let bad = instance.spec().clone().with_cron("nope");
        assert!(instance.reconfigure(bad, 2).is_err());
        assert_eq!(instance.cron().expr(), "*/5 * * * *");
        assert_eq!(instance.generation(), 1);
    }

    #[tokio::test]
    async fn test_retired_is_disabled() {
        let mut instance = instance(1, &[]);
        assert!(instance.enabled());
        instance.retire().await;
        assert!(!instance.enabled());
        assert!(instance.reconfigure(instance.spec().clone(), 2).is_ok());
        assert!(instance.enabled());
    }

    #[tokio::test]
    async fn test_rejected_spec_leaves_retired_instance_alone() {
        let mut instance = instance(1, &[]);
        instance.retire().await;

        let bad = instance.spec().clone().with_cron("every day");
        assert!(instance.reconfigure(bad, 4).is_err());
        assert!(instance.is_retired());
        assert!(!instance.enabled());
        assert_eq!(instance.generation(), 1);
    }

    #[tokio::test]
    async fn test_revive_swaps_check_and_keeps_state() {
        let mut instance = instance(2, &[Status::Failed]);
        instance.execute(&ctx()).await.unwrap();
        let since = instance.since();
        instance.retire().await;

        let spec = instance.spec().clone().with_cron("0 * * * *");
        let schedule = CronSchedule::parse(&spec.cron).unwrap();
        let check = Box::new(Sequence(VecDeque::from([Status::Warning])));
        instance.revive(spec, schedule, check, 3);

        assert!(instance.enabled());
        assert_eq!(instance.generation(), 3);
        assert_eq!(instance.cron().expr(), "0 * * * *");
        assert_eq!(instance.since(), since);
        assert_eq!(instance.hit_count(), 1);
        assert_eq!(instance.execute(&ctx()).await.unwrap(), Status::Warning);
        assert!(instance.hits_reached());
    }
}
