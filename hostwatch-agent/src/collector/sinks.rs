use crate::config::SinkSpec;
use crate::result::TaskResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Destination for results. Called from the collector task only.
///
/// `notify` sees every result as it is drained; `publish` flushes whatever the
/// sink accumulated and is driven by the collector's thresholds. Alerting sinks
/// should only raise an alert when `result.hits_reached` is set.
#[async_trait]
pub trait ReportSink: Send {
    fn name(&self) -> &str;
    async fn notify(&mut self, result: &TaskResult) -> Result<()>;
    async fn publish(&mut self) -> Result<()>;
}

pub type SinkFactory = Arc<dyn Fn(&SinkSpec) -> Result<Box<dyn ReportSink>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct SinkRegistry {
    factories: HashMap<String, SinkFactory>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `log` and `jsonl`
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register("log", |_| Ok(Box::new(LogSink::new())))
            .register("jsonl", |spec| Ok(Box::new(JsonlSink::from_spec(spec)?)));
        registry
    }

    pub fn register<F>(&mut self, module: &str, factory: F) -> &mut Self
    where
        F: Fn(&SinkSpec) -> Result<Box<dyn ReportSink>> + Send + Sync + 'static,
    {
        self.factories.insert(module.to_string(), Arc::new(factory));
        self
    }

    /// Builds every sink it can; unknown or misconfigured ones are logged and skipped.
    pub fn build(&self, specs: &[SinkSpec]) -> Vec<Box<dyn ReportSink>> {
        let mut sinks = Vec::with_capacity(specs.len());
        for spec in specs {
            let Some(factory) = self.factories.get(&spec.module) else {
                error!(sink = %spec.module, "unknown report sink, skipped");
                continue;
            };
            match factory(spec) {
                Ok(sink) => {
                    debug!(sink = %spec.module, "report sink ready");
                    sinks.push(sink);
                }
                Err(e) => error!(sink = %spec.module, error = %format!("{e:#}"), "report sink not created"),
            }
        }
        sinks
    }
}

/// Writes results to the tracing output; alerts only once `hits_reached`.
#[derive(Debug, Default)]
pub struct LogSink {
    pending: usize,
    alerts: usize,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&mut self, result: &TaskResult) -> Result<()> {
        self.pending += 1;
        if result.is_problem() {
            info!(
                task = %result.plugin,
                status = %result.status,
                hits = result.hits,
                "{}",
                result.message
            );
            if result.hits_reached {
                self.alerts += 1;
                warn!(
                    task = %result.plugin,
                    group = %result.group,
                    hits = result.hits,
                    "ALERT {} is {}: {}",
                    result.plugin,
                    result.status,
                    result.message
                );
            }
        } else {
            debug!(task = %result.plugin, status = %result.status, "{}", result.message);
        }
        Ok(())
    }

    async fn publish(&mut self) -> Result<()> {
        if self.pending > 0 {
            info!(results = self.pending, alerts = self.alerts, "results published");
        }
        self.pending = 0;
        self.alerts = 0;
        Ok(())
    }
}

/// Results a `JsonlSink` holds while its file cannot be written
pub const MAX_BUFFERED: usize = 10_000;

/// Buffers results and appends them as JSON lines on publish.
///
/// While the file is unwritable the buffer keeps the newest `max_buffered`
/// results. Bytes of a batch that failed halfway are retried from where the
/// write stopped, so no line lands twice.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    buffer: VecDeque<TaskResult>,
    unwritten: Vec<u8>,
    max_buffered: usize,
    dropped: u64,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer: VecDeque::new(),
            unwritten: Vec::new(),
            max_buffered: MAX_BUFFERED,
            dropped: 0,
        }
    }

    pub fn with_max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered.max(1);
        self
    }

    pub fn from_spec(spec: &SinkSpec) -> Result<Self> {
        let path = spec
            .option_str("path")
            .context("jsonl sink requires a 'path' option")?;
        let sink = Self::new(path);
        match spec.options.get("max_buffered") {
            None => Ok(sink),
            Some(value) => {
                let max = value
                    .as_u64()
                    .context("jsonl 'max_buffered' must be a positive number")?;
                Ok(sink.with_max_buffered(usize::try_from(max).unwrap_or(usize::MAX)))
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Results discarded because the buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    async fn write_unwritten(&mut self, file: &mut tokio::fs::File) -> Result<()> {
        while !self.unwritten.is_empty() {
            let written = file
                .write(&self.unwritten)
                .await
                .with_context(|| format!("writing {}", self.path.display()))?;
            if written == 0 {
                anyhow::bail!("writing {}: no bytes accepted", self.path.display());
            }
            self.unwritten.drain(..written);
        }
        Ok(())
    }
}

#[async_trait]
impl ReportSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn notify(&mut self, result: &TaskResult) -> Result<()> {
        if self.buffer.len() >= self.max_buffered {
            self.buffer.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 1000 == 0 {
                warn!(
                    path = %self.path.display(),
                    dropped = self.dropped,
                    max = self.max_buffered,
                    "jsonl buffer full, oldest results dropped"
                );
            }
        }
        self.buffer.push_back(result.clone());
        Ok(())
    }

    async fn publish(&mut self) -> Result<()> {
        if self.buffer.is_empty() && self.unwritten.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        // On failure the buffer is kept and retried at the next publish.
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;

        // The tail of an earlier batch goes first, and alone: a new batch is
        // only serialized once nothing is left over.
        self.write_unwritten(&mut file).await?;
        let results = self.buffer.len();
        let mut lines = Vec::new();
        for result in &self.buffer {
            serde_json::to_writer(&mut lines, result)?;
            lines.push(b'\n');
        }
        self.buffer.clear();
        self.unwritten = lines;
        self.write_unwritten(&mut file).await?;
        file.flush().await?;

        debug!(path = %self.path.display(), results, "results appended");
        Ok(())
    }
}
