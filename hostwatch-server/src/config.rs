use hostwatch_agent::config::CollectorSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

pub const CONFIG_ENV: &str = "HOSTWATCH_SERVER_CONFIG";
pub const API_KEY_ENV: &str = "HOSTWATCH_API_KEY";

#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid server config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Expected in `x-api-key` (or `AUTH`); unset leaves ingest open
    pub token: Option<String>,
    /// Seconds without a new event before a host/source pair is reported stale
    pub stale_after: u64,
    pub collector: CollectorSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5001".into(),
            token: None,
            stale_after: 600,
            collector: CollectorSettings::default(),
        }
    }
}

/// Reads `path` (else `HOSTWATCH_SERVER_CONFIG`, else `server.yaml`).
/// A missing file yields the defaults; `HOSTWATCH_API_KEY` overrides the token.
pub async fn load_config(path: Option<&Path>) -> Result<ServerConfig, ServerConfigError> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("server.yaml")),
    };

    let mut config = match fs::read_to_string(&path).await {
        Ok(text) if text.trim().is_empty() => ServerConfig::default(),
        Ok(text) => serde_yaml::from_str(&text).map_err(|source| ServerConfigError::Parse {
            path: path.clone(),
            source,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "no server config, using defaults");
            ServerConfig::default()
        }
        Err(source) => return Err(ServerConfigError::Read { path, source }),
    };

    if let Ok(token) = std::env::var(API_KEY_ENV) {
        if !token.trim().is_empty() {
            config.token = Some(token);
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.yaml"))).await.unwrap();
        assert_eq!(config.listen, "0.0.0.0:5001");
        assert_eq!(config.collector.thresholds.messages, 1);
    }

    #[tokio::test]
    async fn test_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(
            &path,
            "listen: 127.0.0.1:9000\nstale_after: 30\ncollector:\n  thresholds: { messages: 5, time: 120 }\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).await.unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.stale_after, 30);
        assert_eq!(config.collector.thresholds.messages, 5);
        assert_eq!(config.collector.thresholds.time, 120);
    }

    #[tokio::test]
    async fn test_invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(&path, "listen: [unclosed").unwrap();
        assert!(matches!(
            load_config(Some(&path)).await,
            Err(ServerConfigError::Parse { .. })
        ));
    }
}
