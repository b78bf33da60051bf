//! Built-in checks
//!
//! - `serverloads` - CPU 1/5/15 minute averages and memory against thresholds
//! - `network`     - interface throughput against a share of the link speed
//! - `iamalive`    - the agent's own process, run on startup
//! - `fileexists`  - presence, size bounds and age of a file
//! - `checkprocess` - processes by name, with optional pid file and usage thresholds
//! - `checkpid`    - the process behind a pid file
//! - `filesystem`  - free and total space under the configured paths

pub mod fileexists;
pub mod filesystem;
pub mod iamalive;
pub mod network;
pub mod process;
pub mod serverloads;

pub use fileexists::FileExists;
pub use filesystem::Filesystem;
pub use iamalive::IAmAlive;
pub use network::NetworkLoad;
pub use process::{CheckPid, CheckProcess};
pub use serverloads::ServerLoads;

use crate::plugin::PluginRegistry;
use serde::Deserialize;

/// Registry holding every built-in check.
pub fn builtin_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register("serverloads", |spec, build| Ok(Box::new(ServerLoads::from_spec(spec, build)?)))
        .register("network", |spec, build| Ok(Box::new(NetworkLoad::from_spec(spec, build)?)))
        .register("iamalive", |_, _| Ok(Box::new(IAmAlive::new())))
        .register("fileexists", |spec, _| Ok(Box::new(FileExists::from_spec(spec)?)))
        .register("checkprocess", |spec, _| Ok(Box::new(CheckProcess::from_spec(spec)?)))
        .register("checkpid", |spec, _| Ok(Box::new(CheckPid::from_spec(spec)?)))
        .register("filesystem", |spec, _| Ok(Box::new(Filesystem::from_spec(spec)?)));
    registry
}

/// A byte count given as a number or a shorthand such as `10K`, `1.5G`, `5MiB`.
///
/// `K`/`M`/`G`/`T` are decimal, `Ki`/`Mi`/`Gi`/`Ti` binary; a trailing `B` is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ByteSize {
    Bytes(u64),
    Text(String),
}

impl ByteSize {
    pub fn to_bytes(&self) -> Result<u64, String> {
        match self {
            ByteSize::Bytes(n) => Ok(*n),
            ByteSize::Text(text) => parse_size(text),
        }
    }
}

pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number
        .replace(',', ".")
        .parse()
        .map_err(|e| format!("invalid size '{s}': {e}"))?;

    let unit = unit.trim();
    let unit = unit.strip_suffix('B').unwrap_or(unit);
    let multiplier: f64 = match unit {
        "" => 1.0,
        "K" | "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => return Err(format!("invalid size '{s}': unknown unit '{other}'")),
    };
    Ok((number * multiplier).round() as u64)
}

/// Formats bytes as human-readable size string.
pub fn format_size(bytes: u64) -> String {
    const G: f64 = 1e9;
    const M: f64 = 1e6;
    const K: f64 = 1e3;

    let value = bytes as f64;
    if value >= G {
        format!("{:.1}G", value / G)
    } else if value >= M {
        format!("{:.1}M", value / M)
    } else if value >= K {
        format!("{:.1}K", value / K)
    } else {
        format!("{bytes}B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("10K"), Ok(10_000));
        assert_eq!(parse_size("1.5G"), Ok(1_500_000_000));
        assert_eq!(parse_size("2,5 MB"), Ok(2_500_000));
        assert_eq!(parse_size("4KiB"), Ok(4096));
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("K").is_err());
    }

    #[test]
    fn test_byte_size_from_yaml_values() {
        let number: ByteSize = serde_json::from_value(serde_json::json!(2048)).unwrap();
        let text: ByteSize = serde_json::from_value(serde_json::json!("1M")).unwrap();
        assert_eq!(number.to_bytes(), Ok(2048));
        assert_eq!(text.to_bytes(), Ok(1_000_000));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(999), "999B");
        assert_eq!(format_size(1_500), "1.5K");
        assert_eq!(format_size(2_000_000_000), "2.0G");
    }

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry();
        assert_eq!(
            registry.modules(),
            vec![
                "checkpid",
                "checkprocess",
                "fileexists",
                "filesystem",
                "iamalive",
                "network",
                "serverloads"
            ]
        );
        assert!(registry.contains("sysinvest.monitor.serverloads"));
        assert!(registry.contains("sysinvest.monitor.os.filesystem"));
    }
}
