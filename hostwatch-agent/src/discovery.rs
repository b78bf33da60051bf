//! Host identification reported with every forwarded result
//!
//! This module handles:
//! - Hostname (configured override, else the OS hostname)
//! - OS / architecture / process id of the agent

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// System information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostIdentity {
    pub hostname: String,
    pub os: String,
    pub architecture: String,
    pub pid: u32,
}

impl HostIdentity {
    pub fn discover(configured: Option<&str>) -> Self {
        let hostname = match configured.map(str::trim).filter(|h| !h.is_empty()) {
            Some(name) => name.to_string(),
            None => os_hostname(),
        };
        let identity = Self {
            hostname,
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
        };
        info!(
            hostname = %identity.hostname,
            os = %identity.os,
            arch = %identity.architecture,
            "host identified"
        );
        identity
    }
}

fn os_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().to_string(),
        Err(e) => {
            warn!(error = %e, "hostname unavailable");
            "unknown".to_string()
        }
    }
}
