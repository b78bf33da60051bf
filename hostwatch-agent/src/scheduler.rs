//! Cron-driven scheduler
//!
//! Every tick (60 s by default) the scheduler heartbeats the watchdog, runs
//! each enabled instance whose cron expression matches the current minute,
//! turns any fault into a FAILED result and routes the result to the
//! collector queue or a forwarder. It then sleeps for whatever is left of the
//! period, waking early on shutdown or when a new configuration generation
//! arrives.

use crate::collector::ResultQueue;
use crate::config::TaskSpec;
use crate::forwarder::Forwarder;
use crate::plugin::cron::truncate_to_minute;
use crate::plugin::{
    BuildContext, Check, CronSchedule, ExecContext, PluginFault, PluginInstance, PluginRegistry,
    Status,
};
use crate::reload::ConfigSource;
use crate::result::{SchedulerInfo, TaskResult};
use crate::state::Shutdown;
use crate::watchdog::Watchdog;
use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Where finished results go
#[derive(Clone)]
pub enum ResultRoute {
    Queue(ResultQueue),
    Forward(Arc<dyn Forwarder>),
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub period: Duration,
    /// Fallback limit for tasks without their own `timeout`
    pub task_timeout: Option<Duration>,
    /// Consecutive overrunning ticks that force a watchdog panic; 0 disables
    pub max_overruns: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            task_timeout: None,
            max_overruns: 3,
        }
    }
}

/// Counts from one `load_modules` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub reconfigured: usize,
    pub retired: usize,
    pub failed: usize,
}

/// Time left in the period, never negative.
pub fn remaining_sleep(period: Duration, elapsed: Duration) -> Duration {
    period.saturating_sub(elapsed)
}

enum Wake {
    Elapsed,
    Stop,
    Reload,
    ReloadClosed,
}

pub struct Scheduler {
    instances: Vec<PluginInstance>,
    config: Arc<dyn ConfigSource>,
    registry: Arc<PluginRegistry>,
    route: ResultRoute,
    watchdog: Arc<Watchdog>,
    shutdown: Shutdown,
    build: BuildContext,
    settings: SchedulerSettings,
    generation: u64,
    passes: u64,
    overruns: u32,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Scheduler {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        registry: Arc<PluginRegistry>,
        route: ResultRoute,
        watchdog: Arc<Watchdog>,
        shutdown: Shutdown,
        build: BuildContext,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            instances: Vec::new(),
            config,
            registry,
            route,
            watchdog,
            shutdown,
            build,
            settings,
            generation: 0,
            passes: 0,
            overruns: 0,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn instances(&self) -> &[PluginInstance] {
        &self.instances
    }

    pub fn instance(&self, name: &str) -> Option<&PluginInstance> {
        self.instances.iter().find(|i| i.name() == name)
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Asks the loop (and everything sharing the signal) to stop.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    pub fn info(&self) -> SchedulerInfo {
        SchedulerInfo {
            since: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            passes: self.passes,
            tasks: self.instances.iter().filter(|i| !i.is_retired()).count(),
        }
    }

    pub async fn run(&mut self) {
        let shutdown = self.shutdown.clone();
        let mut reload = self.config.subscribe();
        let mut reload_open = true;

        self.load_modules().await;
        info!(
            tasks = self.instances.len(),
            period = ?self.settings.period,
            "scheduler started"
        );

        let mut first_pass = true;
        while !shutdown.is_triggered() {
            self.watchdog.trigger();
            self.passes += 1;
            let tick_start = Instant::now();

            let now = truncate_to_minute(&Local::now());
            let executed = self.run_tick(now, first_pass).await;
            first_pass = false;

            let elapsed = tick_start.elapsed();
            debug!(pass = self.passes, executed, ?elapsed, "tick finished");
            let wake_at = tick_start + elapsed + self.pace(elapsed);

            loop {
                let wake = tokio::select! {
                    _ = tokio::time::sleep_until(wake_at) => Wake::Elapsed,
                    _ = shutdown.wait() => Wake::Stop,
                    changed = reload.changed(), if reload_open => match changed {
                        Ok(()) => Wake::Reload,
                        Err(_) => Wake::ReloadClosed,
                    },
                };
                match wake {
                    Wake::Elapsed | Wake::Stop => break,
                    // Keep sleeping: re-running the sweep would execute the
                    // same minute twice.
                    Wake::Reload => {
                        let report = self.load_modules().await;
                        info!(generation = self.generation, ?report, "modules reloaded");
                    }
                    Wake::ReloadClosed => reload_open = false,
                }
            }
        }

        self.stop_instances().await;
        info!(passes = self.passes, "scheduler stopped");
    }

    /// One sweep over the instances for the minute `now`. Returns how many ran.
    pub async fn run_tick(&mut self, now: DateTime<Local>, first_pass: bool) -> usize {
        let ctx = ExecContext {
            reference_time: now,
            info: self.info(),
        };
        let mut executed = 0;

        for index in 0..self.instances.len() {
            let instance = &mut self.instances[index];
            if !instance.enabled() {
                continue;
            }
            let due = (first_pass && instance.run_on_startup()) || instance.is_due(&now);
            if !due {
                continue;
            }

            debug!(task = %instance.name(), "task is being started");
            let status = run_guarded(instance, &ctx, self.settings.task_timeout).await;
            debug!(task = %instance.name(), %status, hits = instance.hit_count(), "task finished");
            let result = instance.snapshot(&ctx.info);
            executed += 1;
            self.dispatch(result);
        }
        executed
    }

    fn dispatch(&self, result: TaskResult) {
        match &self.route {
            ResultRoute::Queue(queue) => {
                queue.push(result);
            }
            ResultRoute::Forward(forwarder) => forwarder.put(&result),
        }
    }

    /// Remaining sleep for this tick, escalating persistent overruns.
    fn pace(&mut self, elapsed: Duration) -> Duration {
        let pause = remaining_sleep(self.settings.period, elapsed);
        if !pause.is_zero() {
            self.overruns = 0;
            return pause;
        }

        self.overruns += 1;
        warn!(
            ?elapsed,
            period = ?self.settings.period,
            overruns = self.overruns,
            "tick overran its period"
        );
        if self.settings.max_overruns > 0 && self.overruns >= self.settings.max_overruns {
            error!(overruns = self.overruns, "scheduler cannot keep up, escalating to watchdog");
            self.watchdog.panic();
        }
        pause
    }

    /// Matches the current configuration against the live instances by name.
    ///
    /// - new names are resolved and instantiated
    /// - unchanged specs keep all state; changed specs are reconfigured in place,
    ///   or rebuilt when the module changed
    /// - names that disappeared are retired: kept, never executed, check stopped
    /// - retired names that come back get a fresh check and keep their state
    ///
    /// Specs that fail to resolve or construct are logged and skipped.
    pub async fn load_modules(&mut self) -> LoadReport {
        let snapshot = self.config.snapshot();
        self.generation = snapshot.generation;
        let generation = snapshot.generation;
        let mut report = LoadReport::default();
        let mut seen = HashSet::new();

        for spec in snapshot.tasks {
            if !seen.insert(spec.name.clone()) {
                warn!(task = %spec.name, "duplicate task name, later definition ignored");
                continue;
            }

            let position = self.instances.iter().position(|i| i.name() == spec.name);
            match position {
                Some(index)
                    if self.instances[index].is_retired()
                        && self.instances[index].module() == spec.module =>
                {
                    let name = spec.name.clone();
                    match self.construct(&spec) {
                        Ok((schedule, check)) => {
                            self.instances[index].revive(spec, schedule, check, generation);
                            info!(task = %name, "task back in configuration, revived");
                            report.loaded += 1;
                        }
                        Err(e) => {
                            warn!(task = %name, error = %format!("{e:#}"), "could not revive task, stays retired");
                            report.failed += 1;
                        }
                    }
                }
                Some(index) if self.instances[index].module() == spec.module => {
                    let name = spec.name.clone();
                    match self.instances[index].reconfigure(spec, generation) {
                        Ok(true) => {
                            info!(task = %name, "task reconfigured");
                            report.reconfigured += 1;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(task = %name, error = %format!("{e:#}"), "reconfiguration rejected, previous settings kept");
                            report.failed += 1;
                        }
                    }
                }
                Some(index) => match self.instantiate(spec) {
                    Ok(replacement) => {
                        let mut previous = std::mem::replace(&mut self.instances[index], replacement);
                        previous.stop().await;
                        info!(task = %previous.name(), "task module changed, instance rebuilt");
                        report.loaded += 1;
                    }
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "could not rebuild task");
                        report.failed += 1;
                    }
                },
                None => {
                    let name = spec.name.clone();
                    match self.instantiate(spec) {
                        Ok(instance) => {
                            info!(task = %name, module = %instance.module(), cron = %instance.cron().expr(), "task loaded");
                            self.instances.push(instance);
                            report.loaded += 1;
                        }
                        Err(e) => {
                            error!(task = %name, error = %format!("{e:#}"), "could not load task, skipped");
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        for instance in self.instances.iter_mut() {
            if !seen.contains(instance.name()) && !instance.is_retired() {
                info!(task = %instance.name(), "task removed from configuration, retired");
                instance.retire().await;
                report.retired += 1;
            }
        }
        report
    }

    fn instantiate(&self, spec: TaskSpec) -> anyhow::Result<PluginInstance> {
        let (schedule, check) = self.construct(&spec)?;
        Ok(PluginInstance::with_schedule(spec, schedule, check, self.generation))
    }

    /// Parses the cron expression, then constructs the check. Factories may
    /// start background work, so nothing is built for a spec that cannot be
    /// scheduled.
    fn construct(&self, spec: &TaskSpec) -> anyhow::Result<(CronSchedule, Box<dyn Check>)> {
        let factory = self.registry.resolve(&spec.module)?;
        let schedule = CronSchedule::parse(&spec.cron)?;
        let built = std::panic::catch_unwind(AssertUnwindSafe(|| factory(spec, &self.build)));
        let check = match built {
            Ok(check) => check.with_context(|| format!("constructing task '{}'", spec.name))?,
            Err(_) => anyhow::bail!("constructing task '{}' panicked", spec.name),
        };
        Ok((schedule, check))
    }

    /// Stops every instance; `run()` does this on exit.
    pub async fn stop_instances(&mut self) {
        for instance in self.instances.iter_mut() {
            instance.stop().await;
        }
    }
}

/// Executes one instance, converting errors, panics and timeouts to FAILED.
async fn run_guarded(
    instance: &mut PluginInstance,
    ctx: &ExecContext,
    default_timeout: Option<Duration>,
) -> Status {
    let limit = instance.timeout().or(default_timeout);
    let outcome = {
        let guarded = AssertUnwindSafe(instance.execute(ctx)).catch_unwind();
        match limit {
            Some(limit) => tokio::time::timeout(limit, guarded).await.ok(),
            None => Some(guarded.await),
        }
    };

    let fault = match outcome {
        Some(Ok(Ok(status))) => return status,
        Some(Ok(Err(err))) => PluginFault::from_error(&err),
        Some(Err(panic)) => PluginFault::from_panic(panic.as_ref()),
        None => PluginFault::timed_out(limit.unwrap_or_default()),
    };
    warn!(task = %instance.name(), fault = %fault.message, "task failed");
    instance.fail(fault)
}
