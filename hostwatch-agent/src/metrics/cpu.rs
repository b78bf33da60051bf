use super::{samples_for, CpuReading, CpuSource, MemoryReading, RollingWindow, SamplerTask};
use crate::state::{new_state, Shared};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// 1 / 5 / 15 minute averages; `None` until enough samples exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAverages {
    pub one: Option<f64>,
    pub five: Option<f64>,
    pub fifteen: Option<f64>,
}

/// Averages of one logical core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreLoad {
    pub core: usize,
    #[serde(flatten)]
    pub averages: LoadAverages,
}

/// Snapshot handed to checks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadData {
    pub memory: Option<MemoryReading>,
    pub cores: Vec<CoreLoad>,
    pub total: LoadAverages,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy)]
struct Spans {
    one: usize,
    five: usize,
    fifteen: usize,
}

struct CpuWindows {
    cores: Vec<RollingWindow<f64>>,
    memory: RollingWindow<MemoryReading>,
    capacity: usize,
}

impl CpuWindows {
    fn record(&mut self, reading: CpuReading) {
        while self.cores.len() < reading.cores.len() {
            self.cores.push(RollingWindow::new(self.capacity));
        }
        for (window, usage) in self.cores.iter_mut().zip(reading.cores) {
            window.push(usage);
        }
        self.memory.push(reading.memory);
    }
}

/// Samples per-core CPU usage and memory into 15 minute windows.
pub struct CpuSampler {
    windows: Shared<CpuWindows>,
    spans: Spans,
    interval: Duration,
    task: Option<SamplerTask>,
}

impl CpuSampler {
    pub fn new(interval: Duration) -> Self {
        let spans = Spans {
            one: samples_for(Duration::from_secs(60), interval),
            five: samples_for(Duration::from_secs(5 * 60), interval),
            fifteen: samples_for(Duration::from_secs(15 * 60), interval),
        };
        let windows = CpuWindows {
            cores: Vec::new(),
            memory: RollingWindow::new(spans.fifteen),
            capacity: spans.fifteen,
        };
        Self {
            windows: new_state(windows),
            spans,
            interval,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Spawns the sampling loop. A second call while running is a no-op.
    pub fn start<S: CpuSource>(&mut self, mut source: S) {
        if self.task.is_some() {
            return;
        }
        let windows = self.windows.clone();
        self.task = Some(SamplerTask::spawn("cpu", self.interval, move || {
            match source.read_cpu() {
                Ok(reading) => windows.lock().record(reading),
                Err(e) => warn!(error = %e, "CPU sample skipped"),
            }
        }));
    }

    /// Appends one reading directly, bypassing the loop.
    pub fn record(&self, reading: CpuReading) {
        self.windows.lock().record(reading);
    }

    pub fn load_data(&self) -> LoadData {
        let windows = self.windows.lock();
        let spans = self.spans;

        let cores: Vec<CoreLoad> = windows
            .cores
            .iter()
            .enumerate()
            .map(|(core, window)| CoreLoad {
                core,
                averages: LoadAverages {
                    one: window.mean_of_last(spans.one, |v| *v),
                    five: window.mean_of_last(spans.five, |v| *v),
                    fifteen: window.mean_of_last(spans.fifteen, |v| *v),
                },
            })
            .collect();

        let total = LoadAverages {
            one: mean_of_all(cores.iter().map(|c| c.averages.one)),
            five: mean_of_all(cores.iter().map(|c| c.averages.five)),
            fifteen: mean_of_all(cores.iter().map(|c| c.averages.fifteen)),
        };

        LoadData {
            memory: windows.memory.latest().copied(),
            cores,
            total,
            samples: windows.memory.len(),
        }
    }

    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
    }
}

// None unless every core has a value.
fn mean_of_all(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value?;
        count += 1;
    }
    (count > 0).then(|| sum / count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SamplerError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn reading(cores: &[f64]) -> CpuReading {
        CpuReading {
            cores: cores.to_vec(),
            memory: MemoryReading::from_bytes(1000, 400),
        }
    }

    #[test]
    fn test_averages_need_full_windows() {
        let sampler = CpuSampler::new(Duration::from_secs(5));
        for _ in 0..11 {
            sampler.record(reading(&[10.0, 30.0]));
        }
        let load = sampler.load_data();
        assert_eq!(load.samples, 11);
        assert_eq!(load.total.one, None);
        assert_eq!(load.memory.map(|m| m.percent_used), Some(60.0));

        sampler.record(reading(&[10.0, 30.0]));
        let load = sampler.load_data();
        assert_eq!(load.cores[0].averages.one, Some(10.0));
        assert_eq!(load.cores[1].averages.one, Some(30.0));
        assert_eq!(load.total.one, Some(20.0));
        assert_eq!(load.total.five, None);
        assert_eq!(load.total.fifteen, None);
    }

    #[test]
    fn test_fifteen_minute_average_after_180_samples() {
        let sampler = CpuSampler::new(Duration::from_secs(5));
        for i in 0..200 {
            let usage = if i < 20 { 100.0 } else { 50.0 };
            sampler.record(reading(&[usage]));
        }
        let load = sampler.load_data();
        assert_eq!(load.samples, 180);
        assert_eq!(load.total.one, Some(50.0));
        assert_eq!(load.total.five, Some(50.0));
        assert_eq!(load.total.fifteen, Some(50.0));
    }

    #[test]
    fn test_total_missing_when_new_core_appears() {
        let sampler = CpuSampler::new(Duration::from_secs(5));
        for _ in 0..12 {
            sampler.record(reading(&[40.0]));
        }
        sampler.record(reading(&[40.0, 80.0]));
        let load = sampler.load_data();
        assert_eq!(load.cores.len(), 2);
        assert_eq!(load.cores[0].averages.one, Some(40.0));
        assert_eq!(load.cores[1].averages.one, None);
        assert_eq!(load.total.one, None);
    }

    struct FlakySource {
        reads: Arc<AtomicUsize>,
    }

    impl CpuSource for FlakySource {
        fn read_cpu(&mut self) -> Result<CpuReading, SamplerError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 1 {
                return Err(SamplerError::Read("scripted failure".into()));
            }
            Ok(reading(&[25.0]))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_keeps_data_across_read_faults_and_stops() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut sampler = CpuSampler::new(Duration::from_secs(5));
        sampler.start(FlakySource {
            reads: reads.clone(),
        });
        assert!(sampler.is_running());

        tokio::time::sleep(Duration::from_millis(20_500)).await;
        sampler.stop().await;

        // Ticks at 5, 10, 15, 20 seconds; odd reads fail.
        assert_eq!(reads.load(Ordering::SeqCst), 4);
        let samples = sampler.load_data().samples;
        assert_eq!(samples, 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sampler.load_data().samples, samples);
        assert!(!sampler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_a_running_sampler_ends_the_loop() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut sampler = CpuSampler::new(Duration::from_secs(5));
        sampler.start(FlakySource {
            reads: reads.clone(),
        });
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 2);

        drop(sampler);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }
}
