use crate::config::TaskSpec;
use crate::metrics::{CpuSampler, LoadData, SysinfoCpu};
use crate::plugin::{BuildContext, Check, ExecContext, Outcome, ServerData, ServerLoadsData, Status};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

/// Percent limits; reaching one is a breach
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoadThresholds {
    pub memory: f64,
    pub cpu1min: f64,
    pub cpu5min: f64,
    pub cpu15min: f64,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            memory: 80.0,
            cpu1min: 100.0,
            cpu5min: 90.0,
            cpu15min: 80.0,
        }
    }
}

impl LoadThresholds {
    /// Read from a nested `threshold` map when present, else from the attributes themselves.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self> {
        let value = match spec.attributes.get("threshold") {
            Some(nested) => nested.clone(),
            None => Value::Object(spec.attributes.clone()),
        };
        serde_json::from_value(value)
            .with_context(|| format!("invalid serverloads thresholds for task '{}'", spec.name))
    }
}

/// Memory and CPU averages against `LoadThresholds`.
///
/// FAILED on memory or a sustained (5 / 15 minute) CPU breach, WARNING when
/// only the 1 minute average is over, COLLECTING until a minute of samples exists.
pub struct ServerLoads {
    thresholds: LoadThresholds,
    sampler: CpuSampler,
}

impl ServerLoads {
    pub fn from_spec(spec: &TaskSpec, build: &BuildContext) -> Result<Self> {
        let thresholds = LoadThresholds::from_spec(spec)?;
        let mut sampler = CpuSampler::new(build.sample_interval);
        sampler.start(SysinfoCpu::new());
        Ok(Self::with_sampler(thresholds, sampler))
    }

    pub fn with_sampler(thresholds: LoadThresholds, sampler: CpuSampler) -> Self {
        Self { thresholds, sampler }
    }

    pub fn sampler(&self) -> &CpuSampler {
        &self.sampler
    }

    fn evaluate(&self, load: LoadData) -> Outcome {
        let (Some(memory), Some(one)) = (load.memory, load.total.one) else {
            return Outcome::collecting("Collecting");
        };
        let limits = self.thresholds;
        let mut messages = Vec::new();

        let memory_ok = memory.percent_used < limits.memory;
        if !memory_ok {
            messages.push(format!(
                "Memory threshold exceeded: {:.1}% >= {}%",
                memory.percent_used, limits.memory
            ));
        }

        let spike = one >= limits.cpu1min;
        if spike {
            messages.push(format!("CPU: 1 minute threshold exceeded: {one:.1}% >= {}%", limits.cpu1min));
        }
        let mut sustained = false;
        for (label, average, limit) in [
            ("5 minute", load.total.five, limits.cpu5min),
            ("15 minute", load.total.fifteen, limits.cpu15min),
        ] {
            if let Some(average) = average.filter(|a| *a >= limit) {
                messages.push(format!("CPU: {label} threshold exceeded: {average:.1}% >= {limit}%"));
                sustained = true;
            }
        }
        let cpu_ok = !spike && !sustained;

        let status = if !memory_ok || sustained {
            Status::Failed
        } else if spike {
            Status::Warning
        } else {
            messages.push("Server loads normal".to_string());
            Status::Ok
        };

        Outcome::new(status, messages.join("\n")).with_data(ServerData::ServerLoads(ServerLoadsData {
            memory_ok,
            cpu_ok,
            messages,
            load,
        }))
    }
}

#[async_trait]
impl Check for ServerLoads {
    async fn execute(&mut self, _ctx: &ExecContext) -> Result<Outcome> {
        Ok(self.evaluate(self.sampler.load_data()))
    }

    fn reconfigure(&mut self, spec: &TaskSpec) -> Result<()> {
        self.thresholds = LoadThresholds::from_spec(spec)?;
        Ok(())
    }

    async fn stop(&mut self) {
        self.sampler.stop().await;
    }
}
