use super::{samples_for, InterfaceCounters, NetSource, RollingWindow, SamplerTask};
use crate::state::{new_state, Shared};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Pseudo interface aggregating every real one
pub const TOTAL_INTERFACE: &str = "Total";

/// Throughput of one interface, bytes per second
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceLoad {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_speed: u64,
    pub tx_speed: u64,
    pub avg_rx_speed: f64,
    pub avg_tx_speed: f64,
}

#[derive(Debug, Clone, Copy)]
struct Speed {
    rx: u64,
    tx: u64,
}

struct InterfaceHistory {
    rx_bytes: u64,
    tx_bytes: u64,
    speeds: RollingWindow<Speed>,
}

struct NetState {
    interfaces: BTreeMap<String, InterfaceHistory>,
    capacity: usize,
}

impl NetState {
    // `Total` moves by the sum of per-interface deltas, so an interface that
    // appears with a large lifetime count (or disappears) does not show up as
    // a burst or a hidden drop.
    fn record(&mut self, counters: Vec<InterfaceCounters>, interval: Duration) {
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        let per_second = |bytes: u64| (bytes as f64 / secs).round() as u64;
        let mut total = InterfaceCounters {
            name: TOTAL_INTERFACE.to_string(),
            rx_bytes: 0,
            tx_bytes: 0,
        };
        let (mut rx_delta, mut tx_delta) = (0u64, 0u64);

        for current in counters {
            if current.name == TOTAL_INTERFACE {
                continue;
            }
            total.rx_bytes = total.rx_bytes.saturating_add(current.rx_bytes);
            total.tx_bytes = total.tx_bytes.saturating_add(current.tx_bytes);
            match self.interfaces.get_mut(&current.name) {
                Some(history) => {
                    // Counters that went backwards (interface reset) count as zero traffic.
                    let rx = current.rx_bytes.saturating_sub(history.rx_bytes);
                    let tx = current.tx_bytes.saturating_sub(history.tx_bytes);
                    rx_delta = rx_delta.saturating_add(rx);
                    tx_delta = tx_delta.saturating_add(tx);
                    history.speeds.push(Speed {
                        rx: per_second(rx),
                        tx: per_second(tx),
                    });
                    history.rx_bytes = current.rx_bytes;
                    history.tx_bytes = current.tx_bytes;
                }
                None => self.insert(current),
            }
        }

        match self.interfaces.get_mut(TOTAL_INTERFACE) {
            Some(history) => {
                history.speeds.push(Speed {
                    rx: per_second(rx_delta),
                    tx: per_second(tx_delta),
                });
                history.rx_bytes = total.rx_bytes;
                history.tx_bytes = total.tx_bytes;
            }
            None => self.insert(total),
        }
    }

    fn insert(&mut self, counters: InterfaceCounters) {
        self.interfaces.insert(
            counters.name,
            InterfaceHistory {
                rx_bytes: counters.rx_bytes,
                tx_bytes: counters.tx_bytes,
                speeds: RollingWindow::new(self.capacity),
            },
        );
    }
}

/// Samples interface byte counters and keeps a one minute speed history.
pub struct NetworkSampler {
    state: Shared<NetState>,
    interval: Duration,
    task: Option<SamplerTask>,
}

impl NetworkSampler {
    pub fn new(interval: Duration) -> Self {
        let state = NetState {
            interfaces: BTreeMap::new(),
            capacity: samples_for(Duration::from_secs(60), interval),
        };
        Self {
            state: new_state(state),
            interval,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn start<S: NetSource>(&mut self, mut source: S) {
        if self.task.is_some() {
            return;
        }
        // Baseline so the first tick already yields a delta.
        match source.read_counters() {
            Ok(counters) => self.record(counters),
            Err(e) => warn!(error = %e, "initial network read failed"),
        }
        let state = self.state.clone();
        let interval = self.interval;
        self.task = Some(SamplerTask::spawn("network", interval, move || {
            match source.read_counters() {
                Ok(counters) => state.lock().record(counters, interval),
                Err(e) => warn!(error = %e, "network sample skipped"),
            }
        }));
    }

    /// Appends one set of cumulative counters taken one interval after the previous.
    pub fn record(&self, counters: Vec<InterfaceCounters>) {
        self.state.lock().record(counters, self.interval);
    }

    /// Interfaces with at least one measured delta, sorted by name.
    pub fn load_data(&self) -> Vec<InterfaceLoad> {
        let state = self.state.lock();
        state
            .interfaces
            .iter()
            .filter_map(|(name, history)| {
                let latest = history.speeds.latest()?;
                Some(InterfaceLoad {
                    interface: name.clone(),
                    rx_bytes: history.rx_bytes,
                    tx_bytes: history.tx_bytes,
                    rx_speed: latest.rx,
                    tx_speed: latest.tx,
                    avg_rx_speed: history.speeds.mean(|s| s.rx as f64).unwrap_or_default(),
                    avg_tx_speed: history.speeds.mean(|s| s.tx as f64).unwrap_or_default(),
                })
            })
            .collect()
    }

    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(entries: &[(&str, u64, u64)]) -> Vec<InterfaceCounters> {
        entries
            .iter()
            .map(|(name, rx, tx)| InterfaceCounters {
                name: name.to_string(),
                rx_bytes: *rx,
                tx_bytes: *tx,
            })
            .collect()
    }

    #[test]
    fn test_no_data_before_second_reading() {
        let sampler = NetworkSampler::new(Duration::from_secs(5));
        sampler.record(counters(&[("eth0", 1000, 500)]));
        assert!(sampler.load_data().is_empty());
    }

    #[test]
    fn test_speeds_per_interface_and_total() {
        let sampler = NetworkSampler::new(Duration::from_secs(5));
        sampler.record(counters(&[("eth0", 1000, 500), ("lo", 0, 0)]));
        sampler.record(counters(&[("eth0", 6000, 1500), ("lo", 50, 50)]));

        let data = sampler.load_data();
        assert_eq!(data.len(), 3);

        let eth0 = data.iter().find(|i| i.interface == "eth0").unwrap();
        assert_eq!(eth0.rx_speed, 1000);
        assert_eq!(eth0.tx_speed, 200);
        assert_eq!(eth0.rx_bytes, 6000);

        let total = data.iter().find(|i| i.interface == TOTAL_INTERFACE).unwrap();
        assert_eq!(total.rx_speed, 1010);
        assert_eq!(total.tx_speed, 210);
    }

    #[test]
    fn test_average_covers_one_minute_window() {
        let sampler = NetworkSampler::new(Duration::from_secs(5));
        let mut rx = 0;
        sampler.record(counters(&[("eth0", rx, 0)]));
        // 12 deltas of 500 B/s followed by 12 deltas of 100 B/s
        for step in 0..24 {
            rx += if step < 12 { 2500 } else { 500 };
            sampler.record(counters(&[("eth0", rx, 0)]));
        }
        let eth0 = sampler
            .load_data()
            .into_iter()
            .find(|i| i.interface == "eth0")
            .unwrap();
        assert_eq!(eth0.rx_speed, 100);
        assert_eq!(eth0.avg_rx_speed, 100.0);
    }

    #[test]
    fn test_counter_reset_reads_as_zero() {
        let sampler = NetworkSampler::new(Duration::from_secs(5));
        sampler.record(counters(&[("eth0", 10_000, 10_000)]));
        sampler.record(counters(&[("eth0", 100, 100)]));
        let data = sampler.load_data();
        let eth0 = data.iter().find(|i| i.interface == "eth0").unwrap();
        assert_eq!(eth0.rx_speed, 0);
        assert_eq!(eth0.tx_speed, 0);
    }

    #[test]
    fn test_new_interface_does_not_move_total() {
        let sampler = NetworkSampler::new(Duration::from_secs(5));
        sampler.record(counters(&[("eth0", 1000, 1000)]));
        sampler.record(counters(&[("eth0", 1000, 1000), ("docker0", 50_000_000_000, 0)]));

        let data = sampler.load_data();
        let total = data.iter().find(|i| i.interface == TOTAL_INTERFACE).unwrap();
        assert_eq!(total.rx_speed, 0);
        assert_eq!(total.tx_speed, 0);
        assert_eq!(total.rx_bytes, 50_000_001_000);
        assert!(data.iter().all(|i| i.interface != "docker0"));

        sampler.record(counters(&[("eth0", 1500, 1000), ("docker0", 50_000_002_000, 0)]));
        let data = sampler.load_data();
        let total = data.iter().find(|i| i.interface == TOTAL_INTERFACE).unwrap();
        assert_eq!(total.rx_speed, 500);
    }

    #[test]
    fn test_vanished_interface_keeps_remaining_traffic() {
        let sampler = NetworkSampler::new(Duration::from_secs(5));
        sampler.record(counters(&[("eth0", 1000, 0), ("wg0", 90_000, 0)]));
        sampler.record(counters(&[("eth0", 6000, 0)]));

        let data = sampler.load_data();
        let total = data.iter().find(|i| i.interface == TOTAL_INTERFACE).unwrap();
        assert_eq!(total.rx_speed, 1000);
        assert_eq!(total.rx_bytes, 6000);
    }
}
