//! Agent configuration
//!
//! Handles:
//! - Agent timing (tick, watchdog, task timeout, sampling)
//! - Collector publishing thresholds and report sinks
//! - Task definitions (`objects`), merged from optional task files by name
//! - Config file location (CLI flag, `HOSTWATCH_CONFIG`, OS config dir)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "HOSTWATCH_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("could not find config directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostwatchConfig {
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub collector: CollectorSettings,
    #[serde(default)]
    pub objects: Vec<TaskSpec>,
}

/// Timing of the agent loops, all durations in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Reported hostname; discovered when absent
    pub hostname: Option<String>,
    pub tick: u64,
    pub watchdog_timeout: u64,
    /// Default limit for one task execution, none when absent
    pub task_timeout: Option<u64>,
    /// Consecutive overrunning ticks before the watchdog is forced into panic; 0 disables
    pub max_overruns: u32,
    pub reload_interval: u64,
    pub sample_interval: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            hostname: None,
            tick: 60,
            watchdog_timeout: 180,
            task_timeout: None,
            max_overruns: 3,
            reload_interval: 10,
            sample_interval: 5,
        }
    }
}

impl AgentSettings {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick)
    }

    pub fn watchdog_period(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout)
    }

    pub fn task_limit(&self) -> Option<Duration> {
        self.task_timeout.map(Duration::from_secs)
    }

    pub fn reload_period(&self) -> Duration {
        Duration::from_secs(self.reload_interval.max(1))
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_secs(self.sample_interval)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Idle wait when the queue is empty, seconds
    pub idle: u64,
    pub thresholds: PublishThresholds,
    pub sinks: Vec<SinkSpec>,
    /// When set, results are forwarded to this collector URL instead of local sinks
    pub url: Option<String>,
    /// Sent as `x-api-key` with forwarded results
    pub token: Option<String>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            idle: 5,
            thresholds: PublishThresholds::default(),
            sinks: vec![SinkSpec::named("log")],
            url: None,
            token: None,
        }
    }
}

impl CollectorSettings {
    pub fn idle_period(&self) -> Duration {
        Duration::from_secs(self.idle.max(1))
    }
}

/// Publish when `messages` failures accumulated or `time` seconds elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishThresholds {
    pub messages: u32,
    pub time: u64,
}

impl Default for PublishThresholds {
    fn default() -> Self {
        Self {
            messages: 1,
            time: 60,
        }
    }
}

impl PublishThresholds {
    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.time)
    }
}

/// A report sink and its options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkSpec {
    pub module: String,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl SinkSpec {
    pub fn named(module: &str) -> Self {
        Self {
            module: module.to_string(),
            options: Map::new(),
        }
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }
}

/// One scheduled check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub module: String,
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub priority: bool,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_hits")]
    pub hits: u32,
    /// Overrides the check's own run-on-startup default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_on_startup: Option<bool>,
    /// Per-task execution limit in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

fn default_cron() -> String {
    "*/5 * * * *".to_string()
}

fn default_group() -> String {
    "*".to_string()
}

fn default_hits() -> u32 {
    1
}

impl TaskSpec {
    pub fn new(name: &str, module: &str) -> Self {
        Self {
            name: name.to_string(),
            module: module.to_string(),
            cron: default_cron(),
            group: default_group(),
            priority: false,
            enabled: true,
            hits: default_hits(),
            run_on_startup: None,
            timeout: None,
            attributes: Map::new(),
        }
    }

    pub fn with_cron(mut self, cron: &str) -> Self {
        self.cron = cron.to_string();
        self
    }

    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    /// Deserializes the attribute map into a check's own settings type.
    pub fn attributes_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.attributes.clone()))
    }

    pub fn timeout_limit(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
struct TaskFile {
    #[serde(default)]
    objects: Vec<TaskSpec>,
}

impl HostwatchConfig {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Reads the main file then merges the `objects` of every task file in order.
    pub async fn load(main: &Path, task_files: &[PathBuf]) -> Result<Self, ConfigError> {
        let text = read(main).await?;
        let mut config = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: main.to_path_buf(),
            source,
        })?;
        check_unique(&config.objects, main)?;

        for path in task_files {
            let text = read(path).await?;
            let file: TaskFile = if text.trim().is_empty() {
                TaskFile::default()
            } else {
                serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            };
            check_unique(&file.objects, path)?;
            config.merge_objects(file.objects);
        }

        config.validate()?;
        Ok(config)
    }

    /// Later definitions replace earlier ones with the same name.
    pub fn merge_objects(&mut self, objects: Vec<TaskSpec>) {
        for spec in objects {
            match self.objects.iter_mut().find(|o| o.name == spec.name) {
                Some(existing) => *existing = spec,
                None => self.objects.push(spec),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.tick == 0 {
            return Err(ConfigError::Invalid("agent.tick must be at least 1 second".into()));
        }
        if self.agent.sample_interval == 0 {
            return Err(ConfigError::Invalid(
                "agent.sample_interval must be at least 1 second".into(),
            ));
        }
        if self.agent.watchdog_timeout <= self.agent.tick {
            return Err(ConfigError::Invalid(format!(
                "agent.watchdog_timeout ({}s) must exceed agent.tick ({}s)",
                self.agent.watchdog_timeout, self.agent.tick
            )));
        }
        if let Some(spec) = self.objects.iter().find(|o| o.name.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "task with module '{}' has an empty name",
                spec.module
            )));
        }
        Ok(())
    }

    /// Config path: explicit flag, then `HOSTWATCH_CONFIG`, then the OS config dir
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        Self::config_file_path()
    }

    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push("hostwatch");
        path.push("config.yaml");
        Ok(path)
    }
}

async fn read(path: &Path) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn check_unique(objects: &[TaskSpec], path: &Path) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for spec in objects {
        if !seen.insert(spec.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate task name '{}' in {}",
                spec.name,
                path.display()
            )));
        }
    }
    Ok(())
}
