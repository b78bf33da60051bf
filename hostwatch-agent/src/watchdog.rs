//! Liveness watchdog
//!
//! The scheduler calls `trigger()` once per tick. If no heartbeat arrives for
//! longer than `timeout` the watchdog enters PANIC and aborts the whole
//! process so a supervisor can restart it.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

// Slack past the deadline so a heartbeat landing exactly on time is not stale.
const STALE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchdogMode {
    Normal,
    Panic,
    Stopped,
}

/// What PANIC does to the process.
pub trait AbortHandler: Send + Sync {
    fn abort(&self, reason: &str);
}

/// Raises SIGABRT on the agent process (plain `abort()` without signals).
pub struct SignalAbort;

impl AbortHandler for SignalAbort {
    fn abort(&self, reason: &str) {
        error!(reason, "watchdog aborting process");
        #[cfg(unix)]
        {
            if let Err(e) = nix::sys::signal::raise(nix::sys::signal::Signal::SIGABRT) {
                error!(error = %e, "SIGABRT failed, aborting directly");
            }
        }
        std::process::abort();
    }
}

struct WatchdogState {
    last_heartbeat: Instant,
    mode: WatchdogMode,
}

pub struct Watchdog {
    timeout: Duration,
    state: Mutex<WatchdogState>,
    wake: Notify,
    abort: Arc<dyn AbortHandler>,
}

impl Watchdog {
    pub fn new(timeout: Duration, abort: Arc<dyn AbortHandler>) -> Self {
        Self {
            timeout,
            state: Mutex::new(WatchdogState {
                last_heartbeat: Instant::now(),
                mode: WatchdogMode::Normal,
            }),
            wake: Notify::new(),
            abort,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn mode(&self) -> WatchdogMode {
        self.state.lock().mode
    }

    /// Heartbeat. One arriving later than `timeout` escalates to PANIC.
    pub fn trigger(&self) -> WatchdogMode {
        let mode = {
            let mut state = self.state.lock();
            if state.mode == WatchdogMode::Normal {
                let now = Instant::now();
                let silence = now.duration_since(state.last_heartbeat);
                if silence > self.timeout {
                    error!(?silence, timeout = ?self.timeout, "heartbeat arrived after the watchdog timeout");
                    state.mode = WatchdogMode::Panic;
                } else {
                    state.last_heartbeat = now;
                }
            }
            state.mode
        };
        self.wake.notify_one();
        mode
    }

    /// Forces PANIC from any component.
    pub fn panic(&self) {
        {
            let mut state = self.state.lock();
            if state.mode != WatchdogMode::Normal {
                return;
            }
            state.mode = WatchdogMode::Panic;
        }
        error!("watchdog panic requested");
        self.wake.notify_one();
    }

    /// Ends the watchdog loop without aborting.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if state.mode == WatchdogMode::Normal {
                state.mode = WatchdogMode::Stopped;
            }
        }
        self.wake.notify_one();
    }

    /// Loop: wait for a heartbeat until the deadline, then check staleness.
    /// Returns the final mode; PANIC runs the abort handler first.
    pub async fn run(self: Arc<Self>) -> WatchdogMode {
        info!(timeout = ?self.timeout, "watchdog started");
        loop {
            let deadline = self.state.lock().last_heartbeat + self.timeout + STALE_GRACE;
            let _ = tokio::time::timeout_at(deadline, self.wake.notified()).await;

            match self.check() {
                WatchdogMode::Normal => debug!("watchdog alive"),
                WatchdogMode::Stopped => {
                    info!("watchdog stopped");
                    return WatchdogMode::Stopped;
                }
                WatchdogMode::Panic => {
                    self.abort
                        .abort(&format!("no scheduler heartbeat within {:?}", self.timeout));
                    return WatchdogMode::Panic;
                }
            }
        }
    }

    fn check(&self) -> WatchdogMode {
        let mut state = self.state.lock();
        if state.mode == WatchdogMode::Normal && state.last_heartbeat.elapsed() > self.timeout {
            error!(timeout = ?self.timeout, "scheduler heartbeat is stale");
            state.mode = WatchdogMode::Panic;
        }
        state.mode
    }
}
