//! Background samplers for host load
//!
//! Provides rolling windows fed at a fixed interval:
//! - CPU usage per core plus memory, averaged over 1 / 5 / 15 minutes
//! - Network throughput per interface plus an aggregated "Total"
//!
//! Counter reads go through the `CpuSource` / `NetSource` traits so a check can
//! be exercised with scripted readings. The sysinfo backed implementations are
//! the production sources.

pub mod cpu;
pub mod network;
pub mod window;

pub use cpu::{CoreLoad, CpuSampler, LoadAverages, LoadData};
pub use network::{InterfaceLoad, NetworkSampler, TOTAL_INTERFACE};
pub use window::RollingWindow;

use crate::state::Shutdown;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{Networks, System};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("counter source unavailable: {0}")]
    Unavailable(String),
    #[error("counter read failed: {0}")]
    Read(String),
}

/// Memory usage at one sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryReading {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub percent_used: f64,
}

impl MemoryReading {
    pub fn from_bytes(total_bytes: u64, available_bytes: u64) -> Self {
        let used = total_bytes.saturating_sub(available_bytes);
        let percent_used = if total_bytes > 0 {
            used as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            total_bytes,
            available_bytes,
            percent_used,
        }
    }
}

/// One CPU sample: usage percentage per logical core, plus memory
#[derive(Debug, Clone, PartialEq)]
pub struct CpuReading {
    pub cores: Vec<f64>,
    pub memory: MemoryReading,
}

/// Cumulative byte counters of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub trait CpuSource: Send + 'static {
    fn read_cpu(&mut self) -> Result<CpuReading, SamplerError>;
}

pub trait NetSource: Send + 'static {
    fn read_counters(&mut self) -> Result<Vec<InterfaceCounters>, SamplerError>;
}

/// CPU and memory through sysinfo
pub struct SysinfoCpu {
    sys: System,
}

impl SysinfoCpu {
    pub fn new() -> Self {
        let mut sys = System::new();
        // Usage is a delta between refreshes, so take the baseline now.
        sys.refresh_cpu();
        sys.refresh_memory();
        Self { sys }
    }
}

impl Default for SysinfoCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSource for SysinfoCpu {
    fn read_cpu(&mut self) -> Result<CpuReading, SamplerError> {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let cores: Vec<f64> = self
            .sys
            .cpus()
            .iter()
            .map(|cpu| f64::from(cpu.cpu_usage()))
            .collect();
        if cores.is_empty() {
            return Err(SamplerError::Unavailable("no CPU reported".into()));
        }

        let memory = MemoryReading::from_bytes(self.sys.total_memory(), self.sys.available_memory());
        Ok(CpuReading { cores, memory })
    }
}

/// Interface byte counters through sysinfo
pub struct SysinfoNet {
    networks: Networks,
}

impl SysinfoNet {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl Default for SysinfoNet {
    fn default() -> Self {
        Self::new()
    }
}

impl NetSource for SysinfoNet {
    fn read_counters(&mut self) -> Result<Vec<InterfaceCounters>, SamplerError> {
        // refresh_list also picks up interfaces that appeared since the last read
        self.networks.refresh_list();
        let counters = self
            .networks
            .iter()
            .map(|(name, data)| InterfaceCounters {
                name: name.clone(),
                rx_bytes: data.total_received(),
                tx_bytes: data.total_transmitted(),
            })
            .collect();
        Ok(counters)
    }
}

/// Number of samples covering `span` at `interval`, at least one.
pub fn samples_for(span: Duration, interval: Duration) -> usize {
    if interval.is_zero() {
        return 1;
    }
    ((span.as_secs_f64() / interval.as_secs_f64()).round() as usize).max(1)
}

/// A spawned sampling loop and the signal that stops it. Dropping it without
/// `stop()` still ends the loop, just without waiting for it.
pub(crate) struct SamplerTask {
    shutdown: Shutdown,
    handle: Option<JoinHandle<()>>,
}

impl SamplerTask {
    /// Runs `tick` every `interval`, first call one interval after start.
    pub(crate) fn spawn<F>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shutdown = Shutdown::new();
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(sampler = name, ?interval, "sampler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick(),
                    _ = stop.wait() => break,
                }
            }
            debug!(sampler = name, "sampler stopped");
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Signals the loop and waits for it, so no sample lands after return.
    pub(crate) async fn stop(mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SamplerTask {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
