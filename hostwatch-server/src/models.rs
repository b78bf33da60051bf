use chrono::{DateTime, Utc};
use hostwatch_agent::forwarder::AgentRequest;
use hostwatch_agent::plugin::Status;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Latest report of one task on one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEvent {
    pub hostname: String,
    pub source: String,
    pub module: String,
    pub group: String,
    pub status: Status,
    pub message: String,
    pub class_name: String,
    pub hits: u32,
    pub hits_reached: bool,
    pub agent_version: String,
    pub produced_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

impl HostEvent {
    pub fn from_request(request: &AgentRequest, received_at: DateTime<Utc>) -> Self {
        Self {
            hostname: request.hostname.clone(),
            source: request.source.clone(),
            module: request.module.clone(),
            group: request.group.clone(),
            status: request.result,
            message: request.message.clone(),
            class_name: request.class_name.clone(),
            hits: request.hits,
            hits_reached: request.hits_reached,
            agent_version: request.version.clone(),
            produced_at: request.timestamp,
            received_at,
        }
    }

    pub fn key(&self) -> EventKey {
        (self.hostname.clone(), self.source.clone())
    }
}

/// `(hostname, source)`
pub type EventKey = (String, String);
pub type EventsMap = BTreeMap<EventKey, HostEvent>;
