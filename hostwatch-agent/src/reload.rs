//! Configuration sources and hot reload
//!
//! The scheduler and collector never read files themselves. They see a
//! `ConfigSource`: a snapshot of the current task list tagged with a
//! generation counter, plus watch channels announcing new generations and
//! publishing thresholds.

use crate::config::{ConfigError, HostwatchConfig, PublishThresholds, TaskSpec};
use crate::state::{new_state, Shared, Shutdown};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub generation: u64,
    pub tasks: Vec<TaskSpec>,
    pub thresholds: PublishThresholds,
}

pub trait ConfigSource: Send + Sync {
    fn snapshot(&self) -> ConfigSnapshot;

    /// Receives the generation number each time the configuration changes.
    fn subscribe(&self) -> watch::Receiver<u64>;

    fn thresholds(&self) -> watch::Receiver<PublishThresholds>;
}

/// Snapshot holder shared by the concrete sources.
struct Published {
    snapshot: Shared<ConfigSnapshot>,
    generation_tx: watch::Sender<u64>,
    thresholds_tx: watch::Sender<PublishThresholds>,
}

impl Published {
    fn new(tasks: Vec<TaskSpec>, thresholds: PublishThresholds) -> Self {
        let snapshot = ConfigSnapshot {
            generation: 1,
            tasks,
            thresholds,
        };
        let (generation_tx, _) = watch::channel(1);
        let (thresholds_tx, _) = watch::channel(thresholds);
        Self {
            snapshot: new_state(snapshot),
            generation_tx,
            thresholds_tx,
        }
    }

    fn replace(&self, tasks: Vec<TaskSpec>, thresholds: PublishThresholds) -> u64 {
        let generation = {
            let mut snapshot = self.snapshot.lock();
            snapshot.generation += 1;
            snapshot.tasks = tasks;
            snapshot.thresholds = thresholds;
            snapshot.generation
        };
        self.thresholds_tx.send_replace(thresholds);
        self.generation_tx.send_replace(generation);
        generation
    }
}

/// In-memory source, replaced programmatically.
pub struct MemoryConfig {
    published: Published,
}

impl MemoryConfig {
    pub fn new(tasks: Vec<TaskSpec>, thresholds: PublishThresholds) -> Self {
        Self {
            published: Published::new(tasks, thresholds),
        }
    }

    /// Installs a new task list and returns its generation.
    pub fn replace(&self, tasks: Vec<TaskSpec>) -> u64 {
        let thresholds = self.published.snapshot.lock().thresholds;
        self.published.replace(tasks, thresholds)
    }

    pub fn set_thresholds(&self, thresholds: PublishThresholds) -> u64 {
        let tasks = self.published.snapshot.lock().tasks.clone();
        self.published.replace(tasks, thresholds)
    }
}

impl ConfigSource for MemoryConfig {
    fn snapshot(&self) -> ConfigSnapshot {
        self.published.snapshot.lock().clone()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.published.generation_tx.subscribe()
    }

    fn thresholds(&self) -> watch::Receiver<PublishThresholds> {
        self.published.thresholds_tx.subscribe()
    }
}

/// YAML files on disk, reloaded when any of their mtimes change.
pub struct FileConfigSource {
    main: PathBuf,
    task_files: Vec<PathBuf>,
    published: Published,
    stamp: Shared<Option<SystemTime>>,
}

impl FileConfigSource {
    /// Loads the files once; a failure here is fatal to startup.
    pub async fn open(main: PathBuf, task_files: Vec<PathBuf>) -> Result<(Self, HostwatchConfig), ConfigError> {
        let config = HostwatchConfig::load(&main, &task_files).await?;
        let stamp = newest_mtime(&main, &task_files).await;
        let source = Self {
            published: Published::new(config.objects.clone(), config.collector.thresholds),
            main,
            task_files,
            stamp: new_state(stamp),
        };
        Ok((source, config))
    }

    /// Reloads when the newest mtime moved. Returns the new generation, if any.
    /// A file that no longer parses keeps the previous generation in place.
    pub async fn poll(&self) -> Result<Option<u64>, ConfigError> {
        let current = newest_mtime(&self.main, &self.task_files).await;
        if current == *self.stamp.lock() {
            return Ok(None);
        }
        let config = HostwatchConfig::load(&self.main, &self.task_files).await?;
        *self.stamp.lock() = current;
        let generation = self
            .published
            .replace(config.objects, config.collector.thresholds);
        Ok(Some(generation))
    }

    pub fn spawn_watcher(self: Arc<Self>, every: Duration, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(path = %self.main.display(), ?every, "config watcher started");
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait() => break,
                }
                match self.poll().await {
                    Ok(Some(generation)) => info!(generation, "configuration reloaded"),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "configuration change ignored"),
                }
            }
            debug!("config watcher stopped");
        })
    }
}

impl ConfigSource for FileConfigSource {
    fn snapshot(&self) -> ConfigSnapshot {
        self.published.snapshot.lock().clone()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.published.generation_tx.subscribe()
    }

    fn thresholds(&self) -> watch::Receiver<PublishThresholds> {
        self.published.thresholds_tx.subscribe()
    }
}

async fn newest_mtime(main: &Path, task_files: &[PathBuf]) -> Option<SystemTime> {
    let mut newest = None;
    for path in std::iter::once(main).chain(task_files.iter().map(PathBuf::as_path)) {
        if let Ok(modified) = tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            newest = newest.max(Some(modified));
        }
    }
    newest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_config_bumps_generation() {
        let config = MemoryConfig::new(vec![TaskSpec::new("a", "dummy")], PublishThresholds::default());
        let mut generations = config.subscribe();
        assert_eq!(config.snapshot().generation, 1);

        let generation = config.replace(vec![TaskSpec::new("b", "dummy")]);
        assert_eq!(generation, 2);
        generations.changed().await.unwrap();
        assert_eq!(*generations.borrow(), 2);

        let snapshot = config.snapshot();
        assert_eq!(snapshot.tasks[0].name, "b");
    }

    #[tokio::test]
    async fn test_memory_config_thresholds_feed() {
        let config = MemoryConfig::new(Vec::new(), PublishThresholds::default());
        let thresholds = config.thresholds();
        config.set_thresholds(PublishThresholds { messages: 5, time: 10 });
        assert_eq!(thresholds.borrow().messages, 5);
        assert_eq!(config.snapshot().thresholds.time, 10);
    }

    #[tokio::test]
    async fn test_file_source_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("config.yaml");
        std::fs::write(&main, "objects:\n  - name: a\n    module: dummy\n").unwrap();

        let (source, config) = FileConfigSource::open(main.clone(), Vec::new()).await.unwrap();
        assert_eq!(config.objects.len(), 1);
        assert_eq!(source.poll().await.unwrap(), None);

        std::fs::write(
            &main,
            "objects:\n  - name: a\n    module: dummy\n  - name: b\n    module: dummy\n",
        )
        .unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&main)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert_eq!(source.poll().await.unwrap(), Some(2));
        assert_eq!(source.snapshot().tasks.len(), 2);
        assert_eq!(source.poll().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_source_keeps_generation_on_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("config.yaml");
        std::fs::write(&main, "objects: []\n").unwrap();
        let (source, _) = FileConfigSource::open(main.clone(), Vec::new()).await.unwrap();

        std::fs::write(&main, "objects: [ {").unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&main)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(source.poll().await.is_err());
        assert_eq!(source.snapshot().generation, 1);
    }
}
