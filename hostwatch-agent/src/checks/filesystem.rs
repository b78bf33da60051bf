use super::{format_size, ByteSize};
use crate::config::TaskSpec;
use crate::plugin::{Check, ExecContext, FilesystemData, Outcome, ServerData};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
struct FilesystemAttributes {
    filesystem: PathBuf,
    #[serde(default)]
    freespace: Option<ByteSize>,
    #[serde(default)]
    totalspace: Option<ByteSize>,
}

/// `filesystem:` holds one entry or a list of them
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(FilesystemAttributes),
    Many(Vec<FilesystemAttributes>),
}

#[derive(Debug, Default, Deserialize)]
struct Attributes {
    #[serde(default)]
    filesystem: Option<OneOrMany>,
}

#[derive(Debug, Clone, PartialEq)]
struct FilesystemRule {
    path: PathBuf,
    min_free: Option<u64>,
    min_total: Option<u64>,
}

fn rules_from_spec(spec: &TaskSpec) -> Result<Vec<FilesystemRule>> {
    let attrs: Attributes = spec
        .attributes_as()
        .with_context(|| format!("invalid filesystem attributes for task '{}'", spec.name))?;
    let entries = match attrs.filesystem {
        None => Vec::new(),
        Some(OneOrMany::One(entry)) => vec![entry],
        Some(OneOrMany::Many(entries)) => entries,
    };
    entries
        .into_iter()
        .map(|entry| {
            let size = |value: Option<ByteSize>, key: &str| {
                value
                    .map(|v| v.to_bytes())
                    .transpose()
                    .map_err(|e| anyhow!("{}: {key}: {e}", entry.filesystem.display()))
            };
            Ok(FilesystemRule {
                min_free: size(entry.freespace.clone(), "freespace")?,
                min_total: size(entry.totalspace.clone(), "totalspace")?,
                path: entry.filesystem,
            })
        })
        .collect()
}

/// Space on one mounted filesystem
#[derive(Debug, Clone, PartialEq)]
struct MountUsage {
    mount_point: PathBuf,
    total: u64,
    available: u64,
}

fn mounted() -> Vec<MountUsage> {
    Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|disk| MountUsage {
            mount_point: disk.mount_point().to_path_buf(),
            total: disk.total_space(),
            available: disk.available_space(),
        })
        .collect()
}

/// The mount holding `path`: the longest mount point it starts with.
fn mount_of<'a>(path: &Path, mounts: &'a [MountUsage]) -> Option<&'a MountUsage> {
    mounts
        .iter()
        .filter(|m| path.starts_with(&m.mount_point))
        .max_by_key(|m| m.mount_point.components().count())
}

/// Checks one rule; the message is set when the rule is violated.
fn evaluate(rule: &FilesystemRule, exists: bool, mounts: &[MountUsage]) -> (FilesystemData, String) {
    let filesystem = rule.path.display().to_string();
    let mut data = FilesystemData {
        filesystem: filesystem.clone(),
        mount_point: None,
        total_bytes: None,
        free_bytes: None,
        ok: false,
    };
    if !exists {
        return (data, format!("{filesystem} doesn't exist"));
    }
    let Some(mount) = mount_of(&rule.path, mounts) else {
        return (data, format!("{filesystem} is not on a mounted filesystem"));
    };
    data.mount_point = Some(mount.mount_point.display().to_string());
    data.total_bytes = Some(mount.total);
    data.free_bytes = Some(mount.available);

    if let Some(min) = rule.min_free.filter(|min| mount.available < *min) {
        let message = format!(
            "{filesystem} freespace {} too low, should be at least {}",
            format_size(mount.available),
            format_size(min)
        );
        return (data, message);
    }
    if let Some(min) = rule.min_total.filter(|min| mount.total < *min) {
        let message = format!(
            "{filesystem} total disk space {} too low, should be at least {}",
            format_size(mount.total),
            format_size(min)
        );
        return (data, message);
    }
    data.ok = true;
    let message = format!(
        "{filesystem} on {}: {} free of {}",
        mount.mount_point.display(),
        format_size(mount.available),
        format_size(mount.total)
    );
    (data, message)
}

fn summarize(results: Vec<(FilesystemData, String)>) -> Outcome {
    let ok = results.iter().all(|(data, _)| data.ok);
    let (data, lines): (Vec<_>, Vec<_>) = results.into_iter().unzip();
    let outcome = if ok {
        Outcome::ok(format!("Filesystem OK:\n{}", lines.join("\n")))
    } else {
        Outcome::failed(format!("Filesystem NOK:\n{}", lines.join("\n")))
    };
    outcome.with_data(ServerData::Filesystem(data))
}

/// Free and total space of the filesystems holding the configured paths.
pub struct Filesystem {
    rules: Vec<FilesystemRule>,
}

impl Filesystem {
    pub fn from_spec(spec: &TaskSpec) -> Result<Self> {
        Ok(Self {
            rules: rules_from_spec(spec)?,
        })
    }
}

#[async_trait]
impl Check for Filesystem {
    async fn execute(&mut self, _ctx: &ExecContext) -> Result<Outcome> {
        if self.rules.is_empty() {
            return Ok(Outcome::failed("'filesystem' incorrect set or missing"));
        }
        let mounts = tokio::task::spawn_blocking(mounted)
            .await
            .context("listing mounted filesystems")?;
        debug!(mounts = mounts.len(), paths = self.rules.len(), "checking filesystems");

        let mut results = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let exists = tokio::fs::try_exists(&rule.path).await.unwrap_or(false);
            results.push(evaluate(rule, exists, &mounts));
        }
        Ok(summarize(results))
    }

    fn reconfigure(&mut self, spec: &TaskSpec) -> Result<()> {
        self.rules = rules_from_spec(spec)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Status;
    use crate::result::SchedulerInfo;
    use chrono::Local;
    use serde_json::json;

    const G: u64 = 1_000_000_000;

    fn mounts() -> Vec<MountUsage> {
        vec![
            MountUsage {
                mount_point: "/".into(),
                total: 100 * G,
                available: 40 * G,
            },
            MountUsage {
                mount_point: "/var".into(),
                total: 20 * G,
                available: 2 * G,
            },
        ]
    }

    fn rule(path: &str, min_free: Option<u64>, min_total: Option<u64>) -> FilesystemRule {
        FilesystemRule {
            path: path.into(),
            min_free,
            min_total,
        }
    }

    #[test]
    fn test_attribute_shapes() {
        let one = TaskSpec::new("fs", "filesystem")
            .with_attribute("filesystem", json!({ "filesystem": "/", "freespace": "1G" }));
        assert_eq!(rules_from_spec(&one).unwrap(), vec![rule("/", Some(G), None)]);

        let many = TaskSpec::new("fs", "filesystem").with_attribute(
            "filesystem",
            json!([{ "filesystem": "/" }, { "filesystem": "/var", "totalspace": 5_000 }]),
        );
        assert_eq!(
            rules_from_spec(&many).unwrap(),
            vec![rule("/", None, None), rule("/var", None, Some(5_000))]
        );

        let bad = TaskSpec::new("fs", "filesystem")
            .with_attribute("filesystem", json!({ "filesystem": "/", "freespace": "lots" }));
        assert!(rules_from_spec(&bad).is_err());
    }

    #[test]
    fn test_deepest_mount_wins() {
        let mounts = mounts();
        assert_eq!(mount_of(Path::new("/var/log"), &mounts).unwrap().mount_point, PathBuf::from("/var"));
        assert_eq!(mount_of(Path::new("/variable"), &mounts).unwrap().mount_point, PathBuf::from("/"));
    }

    #[test]
    fn test_space_rules() {
        let mounts = mounts();
        let (data, _) = evaluate(&rule("/home", Some(10 * G), Some(50 * G)), true, &mounts);
        assert!(data.ok);
        assert_eq!(data.free_bytes, Some(40 * G));

        let (data, message) = evaluate(&rule("/var/log", Some(10 * G), None), true, &mounts);
        assert!(!data.ok);
        assert_eq!(message, "/var/log freespace 2.0G too low, should be at least 10.0G");

        let (_, message) = evaluate(&rule("/var", None, Some(50 * G)), true, &mounts);
        assert_eq!(message, "/var total disk space 20.0G too low, should be at least 50.0G");

        let (data, message) = evaluate(&rule("/gone", None, None), false, &mounts);
        assert!(!data.ok);
        assert_eq!(message, "/gone doesn't exist");
    }

    #[test]
    fn test_one_failure_fails_the_task() {
        let mounts = mounts();
        let outcome = summarize(vec![
            evaluate(&rule("/", None, None), true, &mounts),
            evaluate(&rule("/var", Some(10 * G), None), true, &mounts),
        ]);
        assert_eq!(outcome.status, Status::Failed);
        assert!(outcome.message.starts_with("Filesystem NOK:\n/ on /"));
        match outcome.data {
            ServerData::Filesystem(entries) => assert_eq!(entries.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_attribute_fails() {
        let mut check = Filesystem::from_spec(&TaskSpec::new("fs", "filesystem")).unwrap();
        let ctx = ExecContext {
            reference_time: Local::now(),
            info: SchedulerInfo::starting(),
        };
        let outcome = check.execute(&ctx).await.unwrap();
        assert_eq!(outcome.status, Status::Failed);
        assert_eq!(outcome.message, "'filesystem' incorrect set or missing");
    }
}
