use crate::plugin::{Check, ExecContext, Outcome, ProcessData, ServerData};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sysinfo::{Pid, System};

/// Reports the agent's own process. Runs on the first pass regardless of cron.
pub struct IAmAlive {
    system: System,
    pid: Pid,
}

impl IAmAlive {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    fn sample(&mut self, ctx: &ExecContext) -> Result<ProcessData> {
        if !self.system.refresh_process(self.pid) {
            return Err(anyhow!("process {} not visible", self.pid));
        }
        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| anyhow!("process {} not visible", self.pid))?;
        Ok(ProcessData {
            pid: self.pid.as_u32(),
            name: process.name().to_string(),
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
            started_at: DateTime::<Utc>::from_timestamp(process.start_time() as i64, 0),
            checked_at: Utc::now(),
            tasks: ctx.info.tasks,
        })
    }
}

impl Default for IAmAlive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Check for IAmAlive {
    async fn execute(&mut self, ctx: &ExecContext) -> Result<Outcome> {
        let process = self.sample(ctx)?;
        let message = format!(
            "{} (pid {}) alive, {} tasks, {} passes",
            process.name, process.pid, process.tasks, ctx.info.passes
        );
        Ok(Outcome::ok(message).with_data(ServerData::Process(process)))
    }

    fn run_on_startup(&self) -> bool {
        true
    }
}
