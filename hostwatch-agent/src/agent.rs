//! Agent runtime wiring
//!
//! Builds the long-lived pieces from a loaded configuration and runs them
//! until shutdown:
//! - watchdog, fed by the scheduler once per tick
//! - config watcher (file sources only)
//! - collector with its sinks, or an HTTP forwarder in forwarding mode
//! - the scheduler itself, on the calling task

use crate::collector::{result_queue, Collector, CollectorStats, SinkRegistry};
use crate::config::HostwatchConfig;
use crate::discovery::HostIdentity;
use crate::forwarder::{Forwarder, HttpForwarder};
use crate::plugin::{BuildContext, PluginRegistry};
use crate::reload::{ConfigSource, FileConfigSource};
use crate::scheduler::{ResultRoute, Scheduler, SchedulerSettings};
use crate::state::Shutdown;
use crate::watchdog::{AbortHandler, Watchdog, WatchdogMode};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// What a finished run leaves behind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSummary {
    pub passes: u64,
    pub watchdog: WatchdogMode,
    /// `None` in forwarding mode
    pub collector: Option<CollectorStats>,
}

pub struct Agent {
    config: HostwatchConfig,
    source: Arc<dyn ConfigSource>,
    watcher: Option<Arc<FileConfigSource>>,
    registry: Arc<PluginRegistry>,
    sinks: SinkRegistry,
    abort: Arc<dyn AbortHandler>,
    forwarder: Option<Arc<dyn Forwarder>>,
    forward_url: Option<String>,
    shutdown: Shutdown,
}

impl Agent {
    pub fn new(
        config: HostwatchConfig,
        source: Arc<dyn ConfigSource>,
        registry: PluginRegistry,
        abort: Arc<dyn AbortHandler>,
    ) -> Self {
        let forward_url = config.collector.url.clone();
        Self {
            config,
            source,
            watcher: None,
            registry: Arc::new(registry),
            sinks: SinkRegistry::builtin(),
            abort,
            forwarder: None,
            forward_url,
            shutdown: Shutdown::new(),
        }
    }

    /// Loads the YAML files and polls them for changes while running.
    pub async fn from_files(
        main: std::path::PathBuf,
        task_files: Vec<std::path::PathBuf>,
        registry: PluginRegistry,
        abort: Arc<dyn AbortHandler>,
    ) -> Result<Self> {
        let (source, config) = FileConfigSource::open(main.clone(), task_files)
            .await
            .with_context(|| format!("failed to load configuration from {}", main.display()))?;
        let source = Arc::new(source);
        let mut agent = Self::new(config, source.clone(), registry, abort);
        agent.watcher = Some(source);
        Ok(agent)
    }

    /// Overrides `collector.url`.
    pub fn forward_to(mut self, url: impl Into<String>) -> Self {
        self.forward_url = Some(url.into());
        self
    }

    /// Routes results to `forwarder` instead of the local collector.
    pub fn with_forwarder(mut self, forwarder: Arc<dyn Forwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn with_sinks(mut self, sinks: SinkRegistry) -> Self {
        self.sinks = sinks;
        self
    }

    /// Handle that stops the agent when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &HostwatchConfig {
        &self.config
    }

    fn forwarder(&self) -> Result<Option<Arc<dyn Forwarder>>> {
        if let Some(forwarder) = &self.forwarder {
            return Ok(Some(forwarder.clone()));
        }
        let Some(url) = &self.forward_url else {
            return Ok(None);
        };
        let identity = HostIdentity::discover(self.config.agent.hostname.as_deref());
        let forwarder = HttpForwarder::new(
            url,
            &identity.hostname,
            self.config.collector.token.clone(),
            FORWARD_TIMEOUT,
        )
        .with_context(|| format!("cannot forward to {url}"))?;
        info!(url = %forwarder.url(), "forwarding results");
        Ok(Some(Arc::new(forwarder)))
    }

    pub async fn run(self) -> Result<AgentSummary> {
        let agent = &self.config.agent;
        let shutdown = self.shutdown.clone();
        let forwarder = self.forwarder()?;

        let watchdog = Arc::new(Watchdog::new(agent.watchdog_period(), self.abort.clone()));
        let watchdog_task = tokio::spawn(watchdog.clone().run());

        let watcher_task = self
            .watcher
            .clone()
            .map(|watcher| watcher.spawn_watcher(agent.reload_period(), shutdown.clone()));

        let (route, collector_task): (ResultRoute, Option<JoinHandle<CollectorStats>>) =
            match forwarder {
                Some(forwarder) => (ResultRoute::Forward(forwarder), None),
                None => {
                    let (queue, rx) = result_queue();
                    let collector = Collector::new(
                        rx,
                        self.sinks.build(&self.config.collector.sinks),
                        self.source.thresholds(),
                        self.config.collector.idle_period(),
                        shutdown.clone(),
                    );
                    (ResultRoute::Queue(queue), Some(tokio::spawn(collector.run())))
                }
            };

        let settings = SchedulerSettings {
            period: agent.tick_period(),
            task_timeout: agent.task_limit(),
            max_overruns: agent.max_overruns,
        };
        let build = BuildContext {
            sample_interval: agent.sample_period(),
        };
        let mut scheduler = Scheduler::new(
            self.source.clone(),
            self.registry.clone(),
            route,
            watchdog.clone(),
            shutdown.clone(),
            build,
            settings,
        );
        scheduler.run().await;
        let passes = scheduler.passes();
        drop(scheduler);

        // The scheduler only returns on shutdown; make sure every helper sees it.
        shutdown.trigger();
        watchdog.stop();

        let watchdog_mode = watchdog_task.await.context("watchdog task failed")?;
        if let Some(task) = watcher_task {
            if let Err(e) = task.await {
                warn!(error = %e, "config watcher ended abnormally");
            }
        }
        let collector = match collector_task {
            Some(task) => Some(task.await.context("collector task failed")?),
            None => None,
        };

        info!(passes, watchdog = ?watchdog_mode, "agent stopped");
        Ok(AgentSummary {
            passes,
            watchdog: watchdog_mode,
            collector,
        })
    }
}
