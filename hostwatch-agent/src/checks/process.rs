use super::{format_size, ByteSize};
use crate::config::TaskSpec;
use crate::plugin::{Check, ExecContext, Outcome, ProcessSummary, ServerData};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, Process, System};
use tracing::debug;

/// A command line given as one string (split on spaces) or as a list
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum CommandLine {
    Line(String),
    Args(Vec<String>),
}

impl CommandLine {
    fn into_args(self) -> Vec<String> {
        match self {
            CommandLine::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            CommandLine::Args(args) => args,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThresholdAttributes {
    #[serde(default)]
    cpu_percent: Option<f32>,
    #[serde(default)]
    memory: Option<ByteSize>,
    #[serde(default)]
    virtual_memory: Option<ByteSize>,
}

/// Upper bounds on the summed usage of every matching process
#[derive(Debug, Clone, Default, PartialEq)]
struct Thresholds {
    cpu_percent: Option<f32>,
    memory: Option<u64>,
    virtual_memory: Option<u64>,
}

impl Thresholds {
    fn from_attributes(attrs: ThresholdAttributes) -> Result<Self> {
        let size = |value: Option<ByteSize>, key: &str| {
            value
                .map(|v| v.to_bytes())
                .transpose()
                .map_err(|e| anyhow!("thresholds.{key}: {e}"))
        };
        Ok(Self {
            cpu_percent: attrs.cpu_percent,
            memory: size(attrs.memory, "memory")?,
            virtual_memory: size(attrs.virtual_memory, "virtual_memory")?,
        })
    }

    /// First exceeded threshold as `(key, limit, actual)`.
    fn exceeded(&self, processes: &[ProcessSummary]) -> Option<(&'static str, String, String)> {
        if let Some(limit) = self.cpu_percent {
            let sum: f32 = processes.iter().map(|p| p.cpu_percent).sum();
            if sum > limit {
                return Some(("cpu_percent", format!("{limit}"), format!("{sum:.1}")));
            }
        }
        if let Some(limit) = self.memory {
            let sum: u64 = processes.iter().map(|p| p.memory_bytes).sum();
            if sum > limit {
                return Some(("memory", format_size(limit), format_size(sum)));
            }
        }
        if let Some(limit) = self.virtual_memory {
            let sum: u64 = processes.iter().map(|p| p.virtual_memory_bytes).sum();
            if sum > limit {
                return Some(("virtual_memory", format_size(limit), format_size(sum)));
            }
        }
        None
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProcessAttributes {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    commandline: Option<CommandLine>,
    #[serde(default)]
    pidfile: Option<PathBuf>,
    #[serde(default)]
    thresholds: Option<ThresholdAttributes>,
}

#[derive(Debug, Clone, PartialEq)]
struct ProcessRules {
    name: String,
    /// Arguments after the program that must match exactly
    commandline: Option<Vec<String>>,
    pidfile: Option<PathBuf>,
    thresholds: Option<Thresholds>,
}

impl ProcessRules {
    fn from_spec(spec: &TaskSpec) -> Result<Self> {
        let attrs: ProcessAttributes = spec
            .attributes_as()
            .with_context(|| format!("invalid checkprocess attributes for task '{}'", spec.name))?;
        let name = attrs
            .name
            .filter(|name| !name.is_empty())
            .with_context(|| format!("checkprocess task '{}' needs a 'name'", spec.name))?;
        Ok(Self {
            name,
            commandline: attrs.commandline.map(CommandLine::into_args),
            pidfile: attrs.pidfile,
            thresholds: attrs.thresholds.map(Thresholds::from_attributes).transpose()?,
        })
    }

    fn matches(&self, process: &ProcessSummary) -> bool {
        if !process.name.contains(&self.name) {
            return false;
        }
        match &self.commandline {
            Some(args) => process.cmdline.get(1..).unwrap_or_default() == args.as_slice(),
            None => true,
        }
    }

    /// Verdict over the processes that matched.
    fn evaluate(&self, processes: Vec<ProcessSummary>) -> Outcome {
        let name = &self.name;
        if processes.is_empty() {
            return Outcome::failed(format!("Process: {name} doesn't exist"));
        }
        let exceeded = self.thresholds.as_ref().and_then(|t| t.exceeded(&processes));
        let outcome = match exceeded {
            Some((key, limit, actual)) => Outcome::failed(format!(
                "Process: {name} active, but exceeds the {key} threshold {limit} with {actual}"
            )),
            None => Outcome::ok(format!("Process: {name} active")),
        };
        outcome.with_data(ServerData::Processes(processes))
    }
}

fn summarize(process: &Process) -> ProcessSummary {
    ProcessSummary {
        pid: process.pid().as_u32(),
        name: process.name().to_string(),
        cmdline: process.cmd().to_vec(),
        exe: process.exe().map(|p| p.display().to_string()),
        cpu_percent: process.cpu_usage(),
        memory_bytes: process.memory(),
        virtual_memory_bytes: process.virtual_memory(),
        started_at: DateTime::<Utc>::from_timestamp(process.start_time() as i64, 0),
    }
}

/// What a pid file pointed at
#[derive(Debug, Clone, PartialEq, Eq)]
enum PidFile {
    Missing,
    Pid(u32),
}

async fn read_pid_file(path: &Path) -> Result<PidFile> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(PidFile::Missing),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let pid = text
        .trim()
        .parse::<u32>()
        .with_context(|| format!("{} does not hold a pid", path.display()))?;
    Ok(PidFile::Pid(pid))
}

/// Processes whose name contains `name`, optionally with an exact argument
/// list, a pid file that must point at a live process, and usage thresholds
/// summed over every match.
pub struct CheckProcess {
    rules: ProcessRules,
    system: System,
}

impl CheckProcess {
    pub fn from_spec(spec: &TaskSpec) -> Result<Self> {
        Ok(Self {
            rules: ProcessRules::from_spec(spec)?,
            system: System::new(),
        })
    }

    /// `Some` when the pid file settles the verdict on its own.
    async fn check_pid_file(&mut self) -> Result<Option<Outcome>> {
        let Some(path) = &self.rules.pidfile else {
            return Ok(None);
        };
        match read_pid_file(path).await? {
            PidFile::Missing => Ok(Some(Outcome::failed(format!(
                "PID filename {} doesn't exist",
                path.display()
            )))),
            PidFile::Pid(pid) if !self.system.refresh_process(Pid::from_u32(pid)) => Ok(Some(
                Outcome::failed(format!("a process with pid {pid} does not exist")),
            )),
            PidFile::Pid(_) => Ok(None),
        }
    }
}

#[async_trait]
impl Check for CheckProcess {
    async fn execute(&mut self, _ctx: &ExecContext) -> Result<Outcome> {
        if let Some(outcome) = self.check_pid_file().await? {
            return Ok(outcome);
        }
        self.system.refresh_processes();
        let matches: Vec<ProcessSummary> = self
            .system
            .processes_by_name(&self.rules.name)
            .map(summarize)
            .filter(|p| self.rules.matches(p))
            .collect();
        debug!(name = %self.rules.name, matches = matches.len(), "processes matched");
        Ok(self.rules.evaluate(matches))
    }

    fn reconfigure(&mut self, spec: &TaskSpec) -> Result<()> {
        self.rules = ProcessRules::from_spec(spec)?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct PidAttributes {
    #[serde(default)]
    filename: Option<PathBuf>,
    #[serde(default)]
    executable: Option<String>,
    #[serde(default)]
    commandline: Option<CommandLine>,
}

#[derive(Debug, Clone, PartialEq)]
struct PidRules {
    filename: Option<PathBuf>,
    executable: Option<String>,
    /// Arguments that must all appear somewhere on the command line
    commandline: Vec<String>,
}

impl PidRules {
    fn from_spec(spec: &TaskSpec) -> Result<Self> {
        let attrs: PidAttributes = spec
            .attributes_as()
            .with_context(|| format!("invalid checkpid attributes for task '{}'", spec.name))?;
        Ok(Self {
            filename: attrs.filename,
            executable: attrs.executable,
            commandline: attrs.commandline.map(CommandLine::into_args).unwrap_or_default(),
        })
    }

    fn evaluate(&self, process: ProcessSummary) -> Outcome {
        let cmdline = process.cmdline.join(" ");
        if let Some(executable) = &self.executable {
            let program = process.cmdline.first().map(String::as_str);
            let exe = process.exe.as_deref();
            if program != Some(executable.as_str()) && exe != Some(executable.as_str()) {
                return Outcome::failed(format!(
                    "process exists, but has invalid executable line: {cmdline}"
                ))
                .with_data(ServerData::Processes(vec![process]));
            }
        }
        if self.commandline.iter().any(|arg| !process.cmdline.contains(arg)) {
            return Outcome::failed(format!("process exists, but has invalid command line: {cmdline}"))
                .with_data(ServerData::Processes(vec![process]));
        }
        let message = if cmdline.is_empty() {
            "process exists".to_string()
        } else {
            format!("process exists: {cmdline}")
        };
        Outcome::ok(message).with_data(ServerData::Processes(vec![process]))
    }
}

/// The process named by a pid file, optionally checked against an expected
/// executable and command line.
pub struct CheckPid {
    rules: PidRules,
    system: System,
}

impl CheckPid {
    pub fn from_spec(spec: &TaskSpec) -> Result<Self> {
        Ok(Self {
            rules: PidRules::from_spec(spec)?,
            system: System::new(),
        })
    }
}

#[async_trait]
impl Check for CheckPid {
    async fn execute(&mut self, _ctx: &ExecContext) -> Result<Outcome> {
        let Some(path) = &self.rules.filename else {
            return Ok(Outcome::failed("Filename not configured"));
        };
        let pid = match read_pid_file(path).await? {
            PidFile::Missing => return Ok(Outcome::failed("Filename doesn't exist")),
            PidFile::Pid(pid) => Pid::from_u32(pid),
        };
        if !self.system.refresh_process(pid) {
            return Ok(Outcome::failed(format!("process {pid} does not exist")));
        }
        let process = self
            .system
            .process(pid)
            .map(summarize)
            .ok_or_else(|| anyhow!("process {pid} vanished while reading it"))?;
        Ok(self.rules.evaluate(process))
    }

    fn reconfigure(&mut self, spec: &TaskSpec) -> Result<()> {
        self.rules = PidRules::from_spec(spec)?;
        Ok(())
    }
}
