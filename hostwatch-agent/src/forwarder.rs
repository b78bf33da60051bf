//! Forwarding results to a remote collector
//!
//! In forwarding mode the scheduler hands each result to a `Forwarder`
//! instead of the local queue. `put()` must return immediately: the HTTP
//! implementation posts from a detached task and only logs failures.

use crate::plugin::{ServerData, Status};
use crate::result::{SchedulerInfo, TaskResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

pub trait Forwarder: Send + Sync {
    fn put(&self, result: &TaskResult);
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid collector url '{0}'")]
    InvalidUrl(String),
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Wire format posted to `/api/agent`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub timestamp: DateTime<Utc>,
    /// Task name
    pub source: String,
    pub hostname: String,
    pub result: Status,
    pub message: String,
    /// Kind of `details`
    pub class_name: String,
    pub details: ServerData,
    pub version: String,
    #[serde(default)]
    pub module: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub priority: bool,
    #[serde(default)]
    pub hits: u32,
    #[serde(default)]
    pub hits_reached: bool,
    #[serde(default)]
    pub context: Option<SchedulerInfo>,
}

fn default_group() -> String {
    "*".to_string()
}

impl AgentRequest {
    pub fn from_result(result: &TaskResult, hostname: &str) -> Self {
        Self {
            timestamp: result.produced_at,
            source: result.plugin.clone(),
            hostname: hostname.to_string(),
            result: result.status,
            message: result.message.clone(),
            class_name: result.details.kind().to_string(),
            details: result.details.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            module: result.module.clone(),
            group: result.group.clone(),
            priority: result.priority,
            hits: result.hits,
            hits_reached: result.hits_reached,
            context: Some(result.context.clone()),
        }
    }

    /// Rebuilds the result on the receiving side.
    pub fn into_result(self) -> TaskResult {
        TaskResult {
            plugin: self.source,
            module: self.module,
            group: self.group,
            priority: self.priority,
            status: self.result,
            message: self.message,
            details: self.details,
            hits: self.hits,
            hits_reached: self.hits_reached,
            produced_at: self.timestamp,
            context: self.context.unwrap_or_else(SchedulerInfo::starting),
        }
    }
}

/// Posts results as JSON with reqwest.
pub struct HttpForwarder {
    client: reqwest::Client,
    url: String,
    hostname: String,
    token: Option<String>,
}

impl HttpForwarder {
    pub fn new(
        url: &str,
        hostname: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ForwardError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ForwardError::InvalidUrl(url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            hostname: hostname.to_string(),
            token,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Forwarder for HttpForwarder {
    fn put(&self, result: &TaskResult) {
        let request = AgentRequest::from_result(result, &self.hostname);
        let mut post = self.client.post(&self.url).json(&request);
        if let Some(token) = &self.token {
            post = post.header(API_KEY_HEADER, token);
        }
        let source = request.source;

        tokio::spawn(async move {
            match post.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(task = %source, "result forwarded");
                }
                Ok(response) => {
                    warn!(task = %source, status = %response.status(), "collector rejected result");
                }
                Err(e) => warn!(task = %source, error = %e, "collector unreachable, result dropped"),
            }
        });
    }
}
