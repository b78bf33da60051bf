//! Result collector
//!
//! Drains the result queue, notifies every report sink of every result and
//! triggers `publish()` on all sinks when either threshold is met:
//! - `failure_count >= thresholds.messages` (non-priority WARNING/FAILED only)
//! - `elapsed since last publish >= thresholds.time`
//!
//! Priority results publish immediately without touching the counters.

pub mod sinks;

pub use sinks::{JsonlSink, LogSink, ReportSink, SinkFactory, SinkRegistry};

use crate::config::PublishThresholds;
use crate::result::TaskResult;
use crate::state::Shutdown;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Producer side of the result queue. Never blocks.
#[derive(Clone, Debug)]
pub struct ResultQueue {
    tx: mpsc::UnboundedSender<TaskResult>,
}

impl ResultQueue {
    /// Returns false when the collector is gone and the result was dropped.
    pub fn push(&self, result: TaskResult) -> bool {
        match self.tx.send(result) {
            Ok(()) => true,
            Err(mpsc::error::SendError(result)) => {
                warn!(task = %result.plugin, "collector stopped, result dropped");
                false
            }
        }
    }
}

pub fn result_queue() -> (ResultQueue, mpsc::UnboundedReceiver<TaskResult>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResultQueue { tx }, rx)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub received: u64,
    pub publishes: u64,
    pub sink_errors: u64,
}

enum Wake {
    Item(TaskResult),
    Idle,
    Stop,
}

pub struct Collector {
    rx: mpsc::UnboundedReceiver<TaskResult>,
    sinks: Vec<Box<dyn ReportSink>>,
    thresholds: watch::Receiver<PublishThresholds>,
    idle: Duration,
    shutdown: Shutdown,
    failure_count: u32,
    last_publish: Instant,
    stats: CollectorStats,
}

impl Collector {
    pub fn new(
        rx: mpsc::UnboundedReceiver<TaskResult>,
        sinks: Vec<Box<dyn ReportSink>>,
        thresholds: watch::Receiver<PublishThresholds>,
        idle: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            rx,
            sinks,
            thresholds,
            idle,
            shutdown,
            failure_count: 0,
            last_publish: Instant::now(),
            stats: CollectorStats::default(),
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    /// Runs until shutdown (or until every producer is gone), then drains what
    /// is left and publishes one last time.
    pub async fn run(mut self) -> CollectorStats {
        let shutdown = self.shutdown.clone();
        info!(sinks = self.sinks.len(), "collector started");
        loop {
            let wake = tokio::select! {
                item = self.rx.recv() => match item {
                    Some(result) => Wake::Item(result),
                    None => Wake::Stop,
                },
                _ = tokio::time::sleep(self.idle) => Wake::Idle,
                _ = shutdown.wait() => Wake::Stop,
            };
            match wake {
                Wake::Item(first) => {
                    self.accept(&first).await;
                    self.drain().await;
                    self.publish_if_due().await;
                }
                Wake::Idle => continue,
                Wake::Stop => break,
            }
        }

        let left = self.drain().await;
        self.publish_all().await;
        info!(drained = left, received = self.stats.received, "collector stopped");
        self.stats
    }

    /// Notifies sinks of everything currently queued, FIFO. Returns the count.
    pub async fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(result) = self.rx.try_recv() {
            self.accept(&result).await;
            count += 1;
        }
        count
    }

    async fn accept(&mut self, result: &TaskResult) {
        self.stats.received += 1;
        debug!(task = %result.plugin, status = %result.status, "result received");
        for sink in self.sinks.iter_mut() {
            let name = sink.name().to_string();
            if !guarded(&name, "notify", sink.notify(result)).await {
                self.stats.sink_errors += 1;
            }
        }
        if result.priority {
            self.publish_all().await;
        } else if result.counts_as_failure() {
            self.failure_count += 1;
        }
    }

    /// Applies the threshold policy; counters reset after a publish.
    pub async fn publish_if_due(&mut self) -> bool {
        let thresholds = *self.thresholds.borrow();
        let due = self.failure_count >= thresholds.messages
            || self.last_publish.elapsed() >= thresholds.time_window();
        if due {
            self.publish_all().await;
            self.failure_count = 0;
            self.last_publish = Instant::now();
        }
        due
    }

    async fn publish_all(&mut self) {
        self.stats.publishes += 1;
        for sink in self.sinks.iter_mut() {
            let name = sink.name().to_string();
            if !guarded(&name, "publish", sink.publish()).await {
                self.stats.sink_errors += 1;
            }
        }
    }
}

// Sink faults, errors and panics alike, stay with the sink.
async fn guarded<F>(sink: &str, action: &str, call: F) -> bool
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(sink, action, error = %format!("{e:#}"), "report sink call failed");
            false
        }
        Err(_) => {
            error!(sink, action, "report sink panicked");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ServerData, Status};
    use crate::result::SchedulerInfo;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Notify(String),
        Publish,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl Recorder {
        fn publishes(&self) -> usize {
            self.events.lock().iter().filter(|e| **e == Event::Publish).count()
        }

        fn notified(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    Event::Notify(name) => Some(name.clone()),
                    Event::Publish => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ReportSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn notify(&mut self, result: &TaskResult) -> anyhow::Result<()> {
            self.events.lock().push(Event::Notify(result.plugin.clone()));
            Ok(())
        }

        async fn publish(&mut self) -> anyhow::Result<()> {
            self.events.lock().push(Event::Publish);
            Ok(())
        }
    }

    struct Broken {
        panic: bool,
    }

    #[async_trait]
    impl ReportSink for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn notify(&mut self, _result: &TaskResult) -> anyhow::Result<()> {
            if self.panic {
                panic!("sink exploded");
            }
            anyhow::bail!("sink unavailable")
        }

        async fn publish(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    fn result(name: &str, status: Status, priority: bool) -> TaskResult {
        TaskResult {
            plugin: name.to_string(),
            module: "dummy".into(),
            group: "*".into(),
            priority,
            status,
            message: String::new(),
            details: ServerData::None,
            hits: 0,
            hits_reached: false,
            produced_at: Utc::now(),
            context: SchedulerInfo::starting(),
        }
    }

    fn collector(
        sinks: Vec<Box<dyn ReportSink>>,
        messages: u32,
        time: u64,
    ) -> (ResultQueue, Collector, Shutdown) {
        let (queue, rx) = result_queue();
        let (_tx, thresholds) = watch::channel(PublishThresholds { messages, time });
        let shutdown = Shutdown::new();
        let collector = Collector::new(rx, sinks, thresholds, Duration::from_secs(5), shutdown.clone());
        (queue, collector, shutdown)
    }

    #[tokio::test]
    async fn test_single_failure_publishes_in_one_drain_cycle() {
        let recorder = Recorder::default();
        let (queue, mut collector, _) = collector(vec![Box::new(recorder.clone())], 1, 60);

        queue.push(result("disk", Status::Failed, false));
        assert_eq!(collector.drain().await, 1);
        assert!(collector.publish_if_due().await);

        assert_eq!(recorder.notified(), vec!["disk"]);
        assert_eq!(recorder.publishes(), 1);
        assert_eq!(collector.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_ok_results_do_not_count() {
        let recorder = Recorder::default();
        let (queue, mut collector, _) = collector(vec![Box::new(recorder.clone())], 2, 3600);

        for name in ["a", "b", "c"] {
            queue.push(result(name, Status::Ok, false));
        }
        queue.push(result("d", Status::Collecting, false));
        collector.drain().await;
        assert!(!collector.publish_if_due().await);
        assert_eq!(collector.failure_count(), 0);

        queue.push(result("e", Status::Warning, false));
        queue.push(result("f", Status::Failed, false));
        collector.drain().await;
        assert_eq!(collector.failure_count(), 2);
        assert!(collector.publish_if_due().await);
        assert_eq!(collector.failure_count(), 0);
        assert_eq!(recorder.notified(), vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[tokio::test]
    async fn test_priority_publishes_without_resetting_counters() {
        let recorder = Recorder::default();
        let (queue, mut collector, _) = collector(vec![Box::new(recorder.clone())], 10, 3600);

        queue.push(result("a", Status::Failed, false));
        queue.push(result("urgent", Status::Failed, true));
        collector.drain().await;

        assert_eq!(recorder.publishes(), 1);
        assert_eq!(collector.failure_count(), 1);
        assert!(!collector.publish_if_due().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_time_triggers_publish() {
        let recorder = Recorder::default();
        let (queue, mut collector, _) = collector(vec![Box::new(recorder.clone())], 100, 60);

        queue.push(result("a", Status::Ok, false));
        collector.drain().await;
        assert!(!collector.publish_if_due().await);

        tokio::time::advance(Duration::from_secs(61)).await;
        queue.push(result("b", Status::Ok, false));
        collector.drain().await;
        assert!(collector.publish_if_due().await);
        assert_eq!(recorder.publishes(), 1);
    }

    #[tokio::test]
    async fn test_faulty_sinks_do_not_block_others() {
        let recorder = Recorder::default();
        let sinks: Vec<Box<dyn ReportSink>> = vec![
            Box::new(Broken { panic: true }),
            Box::new(Broken { panic: false }),
            Box::new(recorder.clone()),
        ];
        let (queue, mut collector, _) = collector(sinks, 1, 60);

        queue.push(result("a", Status::Failed, false));
        collector.drain().await;
        assert!(collector.publish_if_due().await);

        assert_eq!(recorder.notified(), vec!["a"]);
        assert_eq!(recorder.publishes(), 1);
        // two failed notifies, two failed publishes
        assert_eq!(collector.stats().sink_errors, 4);
    }

    #[tokio::test]
    async fn test_run_drains_and_publishes_on_stop() {
        let recorder = Recorder::default();
        let (queue, collector, shutdown) = collector(vec![Box::new(recorder.clone())], 100, 3600);
        let handle = tokio::spawn(collector.run());

        queue.push(result("a", Status::Ok, false));
        queue.push(result("b", Status::Ok, false));
        tokio::task::yield_now().await;
        shutdown.trigger();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(recorder.notified(), vec!["a", "b"]);
        assert!(recorder.publishes() >= 1);
    }

    #[tokio::test]
    async fn test_push_after_collector_dropped() {
        let (queue, collector, _) = collector(Vec::new(), 1, 60);
        drop(collector);
        assert!(!queue.push(result("late", Status::Ok, false)));
    }
}
