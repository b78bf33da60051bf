use super::{format_size, ByteSize};
use crate::config::TaskSpec;
use crate::plugin::{Check, ExecContext, FileData, Outcome, ServerData, Status};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum Expiry {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
struct FileAttributes {
    #[serde(default)]
    filename: Option<PathBuf>,
    #[serde(default)]
    minimal_size: Option<ByteSize>,
    #[serde(default)]
    maximal_size: Option<ByteSize>,
    #[serde(default)]
    expire: Option<Expiry>,
}

#[derive(Debug, Clone, PartialEq)]
struct FileRules {
    filename: Option<PathBuf>,
    minimal_size: Option<u64>,
    maximal_size: Option<u64>,
    expire: Option<Duration>,
}

impl FileRules {
    fn from_spec(spec: &TaskSpec) -> Result<Self> {
        let attrs: FileAttributes = spec
            .attributes_as()
            .with_context(|| format!("invalid fileexists attributes for task '{}'", spec.name))?;
        let size = |value: Option<ByteSize>, key: &str| {
            value
                .map(|v| v.to_bytes())
                .transpose()
                .map_err(|e| anyhow!("{key}: {e}"))
        };
        Ok(Self {
            filename: attrs.filename,
            minimal_size: size(attrs.minimal_size, "minimal_size")?,
            maximal_size: size(attrs.maximal_size, "maximal_size")?,
            expire: attrs.expire.map(parse_expiry).transpose()?,
        })
    }
}

/// `3600`, `"3600"`, `"1h 30m"`, `"2days"`
fn parse_expiry(expiry: Expiry) -> Result<Duration> {
    match expiry {
        Expiry::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Expiry::Text(text) => {
            let text = text.trim();
            if let Ok(secs) = text.parse::<u64>() {
                return Ok(Duration::from_secs(secs));
            }
            humantime::parse_duration(text).with_context(|| format!("expire: invalid duration '{text}'"))
        }
    }
}

/// Presence, size bounds and age of a single file.
pub struct FileExists {
    rules: FileRules,
}

impl FileExists {
    pub fn from_spec(spec: &TaskSpec) -> Result<Self> {
        Ok(Self {
            rules: FileRules::from_spec(spec)?,
        })
    }

    async fn inspect(&self, now: DateTime<Utc>) -> Result<Outcome> {
        let Some(path) = &self.rules.filename else {
            return Ok(Outcome::failed("Filename not configured"));
        };
        let filename = path.display().to_string();
        debug!(file = %filename, "checking file");

        let mut data = FileData {
            filename,
            exists: false,
            size: None,
            modified: None,
            size_ok: true,
            expired: false,
        };

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Outcome::failed("Filename doesn't exist").with_data(ServerData::File(data)));
            }
            Err(e) => return Err(e).with_context(|| format!("stat {}", data.filename)),
        };

        let size = metadata.len();
        let modified: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::from);
        data.exists = true;
        data.size = Some(size);
        data.modified = modified;

        let mut messages = vec!["File exists".to_string()];
        let mut status = Status::Ok;

        match (self.rules.minimal_size, self.rules.maximal_size) {
            (Some(min), Some(max)) if size < min || size > max => {
                data.size_ok = false;
                messages.push(format!(
                    "File size ({}) not between {} and {}",
                    format_size(size),
                    format_size(min),
                    format_size(max)
                ));
            }
            (Some(min), None) if size < min => {
                data.size_ok = false;
                messages.push(format!(
                    "File size too small ({}) must be at least {}",
                    format_size(size),
                    format_size(min)
                ));
            }
            (None, Some(max)) if size > max => {
                data.size_ok = false;
                messages.push(format!(
                    "File size too big ({}) must be less than {}",
                    format_size(size),
                    format_size(max)
                ));
            }
            _ => {}
        }
        if !data.size_ok {
            status = Status::Failed;
        }

        let deadline = self
            .rules
            .expire
            .and_then(|expire| chrono::Duration::from_std(expire).ok())
            .zip(modified)
            .and_then(|(limit, modified)| modified.checked_add_signed(limit));
        if let Some(deadline) = deadline {
            if deadline < now {
                data.expired = true;
                status = Status::Failed;
                messages[0] = format!(
                    "File exists, but is expired, is older than {}",
                    deadline.format("%Y-%m-%d %H:%M:%S")
                );
            } else if data.size_ok {
                messages[0] = "File exists and is valid".to_string();
            }
        }

        Ok(Outcome::new(status, messages.join("\n")).with_data(ServerData::File(data)))
    }
}

#[async_trait]
impl Check for FileExists {
    async fn execute(&mut self, _ctx: &ExecContext) -> Result<Outcome> {
        self.inspect(Utc::now()).await
    }

    fn reconfigure(&mut self, spec: &TaskSpec) -> Result<()> {
        self.rules = FileRules::from_spec(spec)?;
        Ok(())
    }
}
