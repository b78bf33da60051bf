//! Structured payloads attached to results, one variant per kind of check.

use crate::metrics::{InterfaceLoad, LoadData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ServerData {
    #[default]
    None,
    Process(ProcessData),
    Processes(Vec<ProcessSummary>),
    ServerLoads(ServerLoadsData),
    Network(Vec<InterfaceLoad>),
    File(FileData),
    Filesystem(Vec<FilesystemData>),
    Exception(ExceptionData),
}

impl ServerData {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerData::None => "none",
            ServerData::Process(_) => "process",
            ServerData::Processes(_) => "processes",
            ServerData::ServerLoads(_) => "server_loads",
            ServerData::Network(_) => "network",
            ServerData::File(_) => "file",
            ServerData::Filesystem(_) => "filesystem",
            ServerData::Exception(_) => "exception",
        }
    }
}

/// The agent's own process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessData {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub checked_at: DateTime<Utc>,
    pub tasks: usize,
}

/// A watched process found by `checkprocess` or `checkpid`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
    pub exe: Option<String>,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerLoadsData {
    pub memory_ok: bool,
    pub cpu_ok: bool,
    pub messages: Vec<String>,
    pub load: LoadData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    pub filename: String,
    pub exists: bool,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub size_ok: bool,
    pub expired: bool,
}

/// One configured path and the mount it lives on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemData {
    pub filesystem: String,
    pub mount_point: Option<String>,
    pub total_bytes: Option<u64>,
    pub free_bytes: Option<u64>,
    pub ok: bool,
}

/// Fault raised while executing a check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionData {
    pub exception: String,
    pub stacktrace: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tagged_encoding() {
        let data = ServerData::Exception(ExceptionData {
            exception: "boom".into(),
            stacktrace: vec!["boom".into(), "caused by: disk".into()],
        });
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["kind"], json!("exception"));
        assert_eq!(value["data"]["exception"], json!("boom"));
        assert_eq!(data.kind(), "exception");

        let none = serde_json::to_value(ServerData::None).unwrap();
        assert_eq!(none, json!({ "kind": "none" }));
        let back: ServerData = serde_json::from_value(none).unwrap();
        assert_eq!(back, ServerData::None);
    }
}
