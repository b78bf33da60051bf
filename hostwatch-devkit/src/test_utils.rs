/*!
Pipeline harness for hostwatch checks

Wires a real `Scheduler` and `Collector` around the doubles:
- tasks come from a `MemoryConfig` the test can replace at any time
- the `scripted` module is registered, plus whatever the test adds
- results land in a `RecordingSink`
- the watchdog aborts into a `RecordingAbort`

Ticks are driven by hand with `tick()`, so minute matching is deterministic.
*/

use crate::doubles::{scripted_registry, RecordingAbort, RecordingSink, RunLedger, SinkLog};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, TimeZone};
use hostwatch_agent::collector::{result_queue, Collector, CollectorStats};
use hostwatch_agent::config::{PublishThresholds, TaskSpec};
use hostwatch_agent::plugin::{BuildContext, PluginRegistry};
use hostwatch_agent::reload::{ConfigSource, MemoryConfig};
use hostwatch_agent::scheduler::{ResultRoute, Scheduler, SchedulerSettings};
use hostwatch_agent::state::Shutdown;
use hostwatch_agent::watchdog::Watchdog;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const POLL: Duration = Duration::from_millis(10);
const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub config: Arc<MemoryConfig>,
    pub sink: SinkLog,
    pub ledger: RunLedger,
    pub abort: Arc<RecordingAbort>,
    pub watchdog: Arc<Watchdog>,
    pub scheduler: Scheduler,
    shutdown: Shutdown,
    collector: JoinHandle<CollectorStats>,
}

impl TestHarness {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self::with_thresholds(tasks, PublishThresholds::default())
    }

    pub fn with_thresholds(tasks: Vec<TaskSpec>, thresholds: PublishThresholds) -> Self {
        let ledger = RunLedger::default();
        Self::build(tasks, thresholds, scripted_registry(ledger.clone()), ledger)
    }

    /// Like `with_thresholds`, with extra modules registered next to `scripted`.
    pub fn with_registry<F>(tasks: Vec<TaskSpec>, thresholds: PublishThresholds, extend: F) -> Self
    where
        F: FnOnce(&mut PluginRegistry),
    {
        let ledger = RunLedger::default();
        let mut registry = scripted_registry(ledger.clone());
        extend(&mut registry);
        Self::build(tasks, thresholds, registry, ledger)
    }

    fn build(
        tasks: Vec<TaskSpec>,
        thresholds: PublishThresholds,
        registry: PluginRegistry,
        ledger: RunLedger,
    ) -> Self {
        init_test_logging();
        let config = Arc::new(MemoryConfig::new(tasks, thresholds));
        let shutdown = Shutdown::new();
        let abort = Arc::new(RecordingAbort::new());
        let watchdog = Arc::new(Watchdog::new(Duration::from_secs(180), abort.clone()));

        let (sink, log) = RecordingSink::new("recording");
        let (queue, rx) = result_queue();
        let collector = Collector::new(
            rx,
            vec![Box::new(sink)],
            config.thresholds(),
            Duration::from_millis(50),
            shutdown.clone(),
        );
        let collector = tokio::spawn(collector.run());

        let scheduler = Scheduler::new(
            config.clone(),
            Arc::new(registry),
            ResultRoute::Queue(queue),
            watchdog.clone(),
            shutdown.clone(),
            BuildContext::default(),
            SchedulerSettings::default(),
        );

        Self {
            config,
            sink: log,
            ledger,
            abort,
            watchdog,
            scheduler,
            shutdown,
            collector,
        }
    }

    /// Loads the current task list into the scheduler.
    pub async fn load(&mut self) -> &mut Self {
        let report = self.scheduler.load_modules().await;
        debug!(?report, "harness loaded tasks");
        self
    }

    /// Swaps the task list and reloads it, as a file change would.
    pub async fn replace(&mut self, tasks: Vec<TaskSpec>) -> &mut Self {
        self.config.replace(tasks);
        self.load().await
    }

    /// One scheduler pass at `now`: heartbeat, then the sweep.
    pub async fn tick(&mut self, now: DateTime<Local>, first_pass: bool) -> usize {
        self.watchdog.trigger();
        self.scheduler.run_tick(now, first_pass).await
    }

    /// Polls until `check` holds on the sink log, failing after a few seconds.
    pub async fn wait_until<F>(&self, what: &str, check: F) -> Result<()>
    where
        F: Fn(&SinkLog) -> bool,
    {
        let waited = tokio::time::timeout(WAIT_LIMIT, async {
            while !check(&self.sink) {
                tokio::time::sleep(POLL).await;
            }
        })
        .await;
        if waited.is_err() {
            bail!("timed out waiting for {what}, sink saw {:?}", self.sink.events());
        }
        Ok(())
    }

    /// Stops the instances and the collector, returning its final stats.
    pub async fn finish(mut self) -> Result<CollectorStats> {
        self.scheduler.stop_instances().await;
        self.shutdown.trigger();
        self.watchdog.stop();
        drop(self.scheduler);
        self.collector.await.context("collector task panicked")
    }
}

/// A fixed minute on 2024-03-04, local time.
pub fn at(hour: u32, minute: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2024, 3, 4, hour, minute, 0)
        .earliest()
        .unwrap_or_else(Local::now)
}

/// Routes tracing output through the test writer; repeated calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doubles::{scripted_task, Step};
    use hostwatch_agent::plugin::Status;

    #[tokio::test]
    async fn test_harness_runs_scripted_task() {
        let mut harness = TestHarness::new(vec![scripted_task(
            "disk",
            &[Step::report(Status::Failed)],
        )]);
        harness.load().await;

        assert_eq!(harness.tick(at(9, 0), false).await, 1);
        harness
            .wait_until("one failure published", |log| log.publishes() >= 1)
            .await
            .unwrap();
        assert_eq!(harness.sink.statuses_of("disk"), vec![Status::Failed]);
        assert_eq!(harness.ledger.runs("disk"), 1);

        let stats = harness.finish().await.unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.sink_errors, 0);
    }

    #[test]
    fn test_at_is_minute_aligned() {
        let minute = at(23, 59);
        assert_eq!(minute.format("%H:%M:%S").to_string(), "23:59:00");
    }
}
