use super::{format_size, ByteSize};
use crate::config::TaskSpec;
use crate::metrics::{InterfaceLoad, NetworkSampler, SysinfoNet};
use crate::plugin::{BuildContext, Check, ExecContext, Outcome, ServerData, Status};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

/// One watched interface: `media` is the link speed in bytes per second,
/// `threshold` the share of it (percent) that may be used.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InterfaceRule {
    pub interface: String,
    #[serde(default)]
    pub media: Option<ByteSize>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkAttributes {
    #[serde(default)]
    interfaces: Vec<InterfaceRule>,
}

#[derive(Debug, Clone, PartialEq)]
struct Limit {
    interface: String,
    threshold: Option<f64>,
    max_speed: Option<f64>,
}

fn limits_from_spec(spec: &TaskSpec) -> Result<Vec<Limit>> {
    let attrs: NetworkAttributes = spec
        .attributes_as()
        .with_context(|| format!("invalid network attributes for task '{}'", spec.name))?;
    attrs
        .interfaces
        .into_iter()
        .map(|rule| {
            let media = rule
                .media
                .as_ref()
                .map(ByteSize::to_bytes)
                .transpose()
                .map_err(|e| anyhow!("interface '{}': {e}", rule.interface))?;
            let max_speed = match (media, rule.threshold) {
                (Some(media), Some(threshold)) => Some(media as f64 * threshold / 100.0),
                _ => None,
            };
            Ok(Limit {
                interface: rule.interface,
                threshold: rule.threshold,
                max_speed,
            })
        })
        .collect()
}

/// Interface throughput against a share of the link speed.
pub struct NetworkLoad {
    limits: Vec<Limit>,
    sampler: NetworkSampler,
}

impl NetworkLoad {
    pub fn from_spec(spec: &TaskSpec, build: &BuildContext) -> Result<Self> {
        let limits = limits_from_spec(spec)?;
        let mut sampler = NetworkSampler::new(build.sample_interval);
        sampler.start(SysinfoNet::new());
        Ok(Self { limits, sampler })
    }

    pub fn with_sampler(spec: &TaskSpec, sampler: NetworkSampler) -> Result<Self> {
        Ok(Self {
            limits: limits_from_spec(spec)?,
            sampler,
        })
    }

    fn evaluate(&self, loads: Vec<InterfaceLoad>) -> Outcome {
        if loads.is_empty() {
            return Outcome::collecting("Collecting");
        }
        let mut errors = Vec::new();
        let mut lines = Vec::new();
        let mut missing = false;
        let mut exceeded = false;

        for limit in &self.limits {
            let Some(load) = loads.iter().find(|l| l.interface == limit.interface) else {
                errors.push(format!("{} not found", limit.interface));
                missing = true;
                continue;
            };
            if let (Some(max), Some(threshold)) = (limit.max_speed, limit.threshold) {
                if load.rx_speed as f64 > max {
                    exceeded = true;
                    errors.push(format!(
                        "{}: the rx-Speed exceeds the threshold: {}/s >= {threshold}%",
                        limit.interface,
                        format_size(load.rx_speed)
                    ));
                }
                if load.tx_speed as f64 > max {
                    exceeded = true;
                    errors.push(format!(
                        "{}: the tx-Speed exceeds the threshold: {}/s >= {threshold}%",
                        limit.interface,
                        format_size(load.tx_speed)
                    ));
                }
            }
            lines.push(format!(
                "{} Received: {}  Transmitted: {}  Rx-Speed: {}/s  Tx-Speed: {}/s",
                load.interface,
                format_size(load.rx_bytes),
                format_size(load.tx_bytes),
                format_size(load.avg_rx_speed.round() as u64),
                format_size(load.avg_tx_speed.round() as u64),
            ));
        }

        let status = if exceeded {
            Status::Failed
        } else if missing {
            Status::Warning
        } else {
            Status::Ok
        };
        if lines.is_empty() {
            lines.push("Network loads normal".to_string());
        }
        errors.extend(lines);
        Outcome::new(status, errors.join("\n")).with_data(ServerData::Network(loads))
    }
}

#[async_trait]
impl Check for NetworkLoad {
    async fn execute(&mut self, _ctx: &ExecContext) -> Result<Outcome> {
        Ok(self.evaluate(self.sampler.load_data()))
    }

    fn reconfigure(&mut self, spec: &TaskSpec) -> Result<()> {
        self.limits = limits_from_spec(spec)?;
        Ok(())
    }

    async fn stop(&mut self) {
        self.sampler.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InterfaceCounters;
    use crate::result::SchedulerInfo;
    use chrono::Local;
    use serde_json::json;
    use std::time::Duration;

    fn ctx() -> ExecContext {
        ExecContext {
            reference_time: Local::now(),
            info: SchedulerInfo::starting(),
        }
    }

    fn counters(rx: u64, tx: u64) -> Vec<InterfaceCounters> {
        vec![InterfaceCounters {
            name: "eth0".into(),
            rx_bytes: rx,
            tx_bytes: tx,
        }]
    }

    fn spec(interfaces: serde_json::Value) -> TaskSpec {
        TaskSpec::new("net", "network").with_attribute("interfaces", interfaces)
    }

    fn check(spec: &TaskSpec) -> NetworkLoad {
        let sampler = NetworkSampler::new(Duration::from_secs(5));
        sampler.record(counters(0, 0));
        NetworkLoad::with_sampler(spec, sampler).unwrap()
    }

    #[tokio::test]
    async fn test_collecting_before_first_delta() {
        let mut check = check(&spec(json!([])));
        let outcome = check.execute(&ctx()).await.unwrap();
        assert_eq!(outcome.status, Status::Collecting);
    }

    #[tokio::test]
    async fn test_within_threshold() {
        // 10K link at 50% allows 5000 B/s
        let mut check = check(&spec(json!([{ "interface": "eth0", "media": "10K", "threshold": 50 }])));
        check.sampler.record(counters(20_000, 5_000));
        let outcome = check.execute(&ctx()).await.unwrap();
        assert_eq!(outcome.status, Status::Ok);
        assert!(outcome.message.starts_with("eth0 Received: 20.0K"));
        match outcome.data {
            ServerData::Network(loads) => assert_eq!(loads.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rx_over_threshold_fails() {
        let mut check = check(&spec(json!([{ "interface": "eth0", "media": 10_000, "threshold": 50 }])));
        check.sampler.record(counters(30_000, 0));
        let outcome = check.execute(&ctx()).await.unwrap();
        assert_eq!(outcome.status, Status::Failed);
        assert!(outcome.message.contains("rx-Speed exceeds"));
        assert!(!outcome.message.contains("tx-Speed exceeds"));
    }

    #[tokio::test]
    async fn test_missing_interface_warns() {
        let mut check = check(&spec(json!([{ "interface": "wlan9" }])));
        check.sampler.record(counters(10, 10));
        let outcome = check.execute(&ctx()).await.unwrap();
        assert_eq!(outcome.status, Status::Warning);
        assert!(outcome.message.starts_with("wlan9 not found"));
    }

    #[tokio::test]
    async fn test_no_rules_reports_normal() {
        let mut check = check(&spec(json!([])));
        check.sampler.record(counters(10, 10));
        let outcome = check.execute(&ctx()).await.unwrap();
        assert_eq!(outcome.status, Status::Ok);
        assert_eq!(outcome.message, "Network loads normal");
    }

    #[test]
    fn test_bad_media_is_rejected() {
        let bad = spec(json!([{ "interface": "eth0", "media": "fast", "threshold": 50 }]));
        let sampler = NetworkSampler::new(Duration::from_secs(5));
        assert!(NetworkLoad::with_sampler(&bad, sampler).is_err());
    }
}
