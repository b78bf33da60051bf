/*!
Test doubles for the hostwatch pipeline

Stand-ins for every seam a test needs to observe or break:
- `RecordingSink` / `FailingSink` behind the collector
- `ScriptedCheck`, a check that follows a per-task script
- `RecordingForwarder` in place of the HTTP forwarder
- `RecordingAbort` in place of the process abort
*/

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hostwatch_agent::collector::ReportSink;
use hostwatch_agent::config::TaskSpec;
use hostwatch_agent::forwarder::Forwarder;
use hostwatch_agent::plugin::{BuildContext, Check, ExecContext, Outcome, PluginRegistry, Status};
use hostwatch_agent::result::TaskResult;
use hostwatch_agent::state::{new_state, Shared};
use hostwatch_agent::watchdog::AbortHandler;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// What a sink saw, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Notify {
        plugin: String,
        status: Status,
        hits_reached: bool,
    },
    Publish,
}

/// Shared view on a `RecordingSink`'s history, kept by the test.
#[derive(Clone, Default)]
pub struct SinkLog {
    events: Shared<Vec<SinkEvent>>,
}

impl SinkLog {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn notifications(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Notify { .. }))
            .count()
    }

    pub fn publishes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Publish))
            .count()
    }

    /// Statuses notified for `plugin`, oldest first
    pub fn statuses_of(&self, plugin: &str) -> Vec<Status> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Notify { plugin: p, status, .. } if p == plugin => Some(*status),
                _ => None,
            })
            .collect()
    }

    /// Plugins that were notified with `hits_reached` set
    pub fn alerts(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Notify {
                    plugin,
                    hits_reached: true,
                    ..
                } => Some(plugin.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: SinkEvent) {
        self.events.lock().push(event);
    }
}

pub struct RecordingSink {
    name: String,
    log: SinkLog,
}

impl RecordingSink {
    pub fn new(name: &str) -> (Self, SinkLog) {
        let log = SinkLog::default();
        let sink = Self {
            name: name.to_string(),
            log: log.clone(),
        };
        (sink, log)
    }
}

#[async_trait]
impl ReportSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&mut self, result: &TaskResult) -> Result<()> {
        self.log.push(SinkEvent::Notify {
            plugin: result.plugin.clone(),
            status: result.status,
            hits_reached: result.hits_reached,
        });
        Ok(())
    }

    async fn publish(&mut self) -> Result<()> {
        self.log.push(SinkEvent::Publish);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Error,
    Panic,
}

/// Sink whose calls fail the configured way
pub struct FailingSink {
    on_notify: Option<Failure>,
    on_publish: Option<Failure>,
}

impl FailingSink {
    pub fn new(on_notify: Option<Failure>, on_publish: Option<Failure>) -> Self {
        Self {
            on_notify,
            on_publish,
        }
    }

    fn act(failure: Option<Failure>, call: &str) -> Result<()> {
        match failure {
            None => Ok(()),
            Some(Failure::Error) => Err(anyhow!("{call} refused")),
            Some(Failure::Panic) => panic!("{call} exploded"),
        }
    }
}

#[async_trait]
impl ReportSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn notify(&mut self, _result: &TaskResult) -> Result<()> {
        Self::act(self.on_notify, "notify")
    }

    async fn publish(&mut self) -> Result<()> {
        Self::act(self.on_publish, "publish")
    }
}

/// One scripted execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Report {
        status: Status,
        #[serde(default)]
        message: String,
    },
    Error {
        message: String,
    },
    Panic {
        message: String,
    },
    /// Sleeps, then reports OK
    Hang {
        secs: u64,
    },
}

impl Step {
    pub fn report(status: Status) -> Self {
        Step::Report {
            status,
            message: format!("scripted {status}"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScriptAttributes {
    #[serde(default)]
    script: Vec<Step>,
    #[serde(default)]
    startup: bool,
}

/// Executions per task name, shared between the checks and the test
#[derive(Clone, Default)]
pub struct RunLedger {
    runs: Shared<HashMap<String, usize>>,
}

impl RunLedger {
    pub fn runs(&self, task: &str) -> usize {
        self.runs.lock().get(task).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.runs.lock().values().sum()
    }

    fn record(&self, task: &str) {
        *self.runs.lock().entry(task.to_string()).or_default() += 1;
    }
}

/// Plays its script one step per execution; the last step repeats forever.
/// An empty script reports OK.
pub struct ScriptedCheck {
    task: String,
    script: VecDeque<Step>,
    last: Step,
    startup: bool,
    ledger: RunLedger,
}

impl ScriptedCheck {
    pub fn new(task: &str, steps: impl IntoIterator<Item = Step>, ledger: RunLedger) -> Self {
        Self {
            task: task.to_string(),
            script: steps.into_iter().collect(),
            last: Step::report(Status::Ok),
            startup: false,
            ledger,
        }
    }

    /// Script from the task's `script` attribute, e.g.
    /// `[{step: report, status: FAILED}, {step: panic, message: boom}]`
    pub fn from_spec(spec: &TaskSpec, ledger: RunLedger) -> Result<Self> {
        let attrs: ScriptAttributes = spec.attributes_as()?;
        let mut check = Self::new(&spec.name, attrs.script, ledger);
        check.startup = attrs.startup;
        Ok(check)
    }

    fn next_step(&mut self) -> Step {
        if let Some(step) = self.script.pop_front() {
            self.last = step;
        }
        self.last.clone()
    }
}

#[async_trait]
impl Check for ScriptedCheck {
    async fn execute(&mut self, _ctx: &ExecContext) -> Result<Outcome> {
        self.ledger.record(&self.task);
        match self.next_step() {
            Step::Report { status, message } => Ok(Outcome::new(status, message)),
            Step::Error { message } => Err(anyhow!(message)),
            Step::Panic { message } => panic!("{message}"),
            Step::Hang { secs } => {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                Ok(Outcome::ok("woke up"))
            }
        }
    }

    fn reconfigure(&mut self, spec: &TaskSpec) -> Result<()> {
        let attrs: ScriptAttributes = spec.attributes_as()?;
        self.script = attrs.script.into();
        self.startup = attrs.startup;
        Ok(())
    }

    fn run_on_startup(&self) -> bool {
        self.startup
    }
}

/// Registry with a single `scripted` module backed by `ScriptedCheck`
pub fn scripted_registry(ledger: RunLedger) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register("scripted", move |spec: &TaskSpec, _: &BuildContext| {
        Ok(Box::new(ScriptedCheck::from_spec(spec, ledger.clone())?) as Box<dyn Check>)
    });
    registry
}

/// Task spec for the `scripted` module, due every minute
pub fn scripted_task(name: &str, steps: &[Step]) -> TaskSpec {
    let script = serde_json::to_value(steps).unwrap_or_default();
    TaskSpec::new(name, "scripted")
        .with_cron("* * * * *")
        .with_attribute("script", script)
}

/// Keeps every forwarded result
#[derive(Clone, Default)]
pub struct RecordingForwarder {
    results: Shared<Vec<TaskResult>>,
}

impl RecordingForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<TaskResult> {
        self.results.lock().clone()
    }
}

impl Forwarder for RecordingForwarder {
    fn put(&self, result: &TaskResult) {
        self.results.lock().push(result.clone());
    }
}

/// Counts abort requests instead of killing the test process
pub struct RecordingAbort {
    reasons: Shared<Vec<String>>,
}

impl RecordingAbort {
    pub fn new() -> Self {
        Self {
            reasons: new_state(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.reasons.lock().len()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

impl Default for RecordingAbort {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandler for RecordingAbort {
    fn abort(&self, reason: &str) {
        self.reasons.lock().push(reason.to_string());
    }
}
