// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Normalised server identity built from an agent's sysinfo snapshot.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity summary for a remote agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub uuid: String,
    pub hostname: String,
    pub datacenter: Option<String>,
    /// Whether the server has completed setup.
    pub setup: bool,
    pub headnode: bool,
}

impl ServerInfo {
    /// Build a summary from a raw sysinfo object.
    ///
    /// Returns `None` when the snapshot carries no `UUID`, since nothing
    /// downstream can correlate an anonymous server.
    pub fn from_sysinfo(sysinfo: &Value) -> Option<Self> {
        let uuid = sysinfo.get("UUID")?.as_str()?.to_owned();
        let hostname = sysinfo.get("Hostname").and_then(Value::as_str).unwrap_or_default().to_owned();
        let datacenter = sysinfo.get("Datacenter Name").and_then(Value::as_str).map(str::to_owned);
        let setup = sysinfo.get("Setup").is_some_and(truthy);
        let headnode =
            sysinfo.get("Boot Parameters").and_then(|bp| bp.get("headnode")).is_some_and(truthy);

        Some(Self { uuid, hostname, datacenter, setup, headnode })
    }
}

/// Agents report flags either as JSON booleans or as the literal string "true".
/// Anything else, numbers and other strings included, reads as false.
fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true",
        _ => false,
    }
}

/// Trim and lowercase a node identifier for comparison.
pub fn normalize_ident(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
