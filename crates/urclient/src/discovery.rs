// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broadcast discovery of live agents.
//!
//! One sysinfo broadcast goes out and every reply resets a sliding
//! inactivity deadline. Without a node list, discovery collects every
//! distinct server until the fleet goes quiet. With one, it ends as soon
//! as every listed uuid or hostname has answered, or reports the ones
//! still missing when the deadline passes.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::UrError;
use crate::inflight::{Inflight, InflightSignal, Signals};
use crate::server::{normalize_ident, ServerInfo};

#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Uuids and/or hostnames to look for. `None` finds everything.
    pub node_list: Option<Vec<String>>,
    pub exclude_headnode: bool,
    /// Inactivity window: discovery ends this long after the last reply.
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum DiscoveryEvent {
    Server(ServerInfo, Value),
    /// The node list named this server by both uuid and hostname.
    Duplicate { uuid: String, hostname: String },
    End(Vec<ServerInfo>),
    Error(UrError),
}

/// Trim, lowercase and dedupe a node list, dropping empty entries.
pub fn normalize_node_list(list: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(list.len());
    for raw in list {
        let ident = normalize_ident(raw);
        if ident.is_empty() || out.contains(&ident) {
            continue;
        }
        out.push(ident);
    }
    out
}

/// A running discovery. Events arrive in order and end with exactly one
/// `End` or `Error`, unless cancelled.
pub struct Discovery {
    inflight: Inflight,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Discovery {
    pub(crate) fn start(conn: &Connection, options: DiscoveryOptions) -> Result<Self, UrError> {
        if options.timeout.is_zero() {
            return Err(UrError::validation("discovery timeout must be greater than 0"));
        }
        let expected = match &options.node_list {
            Some(list) => {
                let normalized = normalize_node_list(list);
                if normalized.is_empty() {
                    return Err(UrError::validation("node list has no usable entries"));
                }
                Some(normalized)
            }
            None => None,
        };

        let (inflight, signals) = conn.send_sysinfo_broadcast().ok_or(UrError::NotReady)?;
        let (tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let run = Run {
            expected,
            found: Vec::new(),
            include_headnode: !options.exclude_headnode,
            timeout: options.timeout,
            events: tx,
        };
        debug!(request_id = inflight.id(), "discovery started");
        let task = tokio::spawn(run.drive(inflight.clone(), signals, cancel.clone()));
        Ok(Self { inflight, events, cancel, task })
    }

    /// Correlation id of the sysinfo broadcast.
    pub fn id(&self) -> &str {
        self.inflight.id()
    }

    pub async fn next(&mut self) -> Option<DiscoveryEvent> {
        self.events.recv().await
    }

    /// Stop now without emitting anything further.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain events to the final result.
    pub async fn collect(mut self) -> Result<Vec<ServerInfo>, UrError> {
        while let Some(event) = self.next().await {
            match event {
                DiscoveryEvent::End(found) => return Ok(found),
                DiscoveryEvent::Error(e) => return Err(e),
                DiscoveryEvent::Server(..) | DiscoveryEvent::Duplicate { .. } => {}
            }
        }
        Err(UrError::Abandoned)
    }
}

impl std::fmt::Debug for Discovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery").field("id", &self.id()).finish()
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.task.is_finished() {
            trace!(request_id = self.inflight.id(), "discovery dropped after end");
        }
    }
}

struct Run {
    expected: Option<Vec<String>>,
    found: Vec<ServerInfo>,
    include_headnode: bool,
    timeout: Duration,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl Run {
    async fn drive(mut self, infl: Inflight, mut signals: Signals, cancel: CancellationToken) {
        infl.start_timeout(self.timeout);
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                signal = signals.recv() => match signal {
                    None => break None,
                    Some(InflightSignal::Server(info, raw)) => {
                        infl.start_timeout(self.timeout);
                        if self.accept(info, raw) {
                            break Some(Ok(std::mem::take(&mut self.found)));
                        }
                    }
                    Some(InflightSignal::Timeout(generation)) => {
                        if infl.is_stale(generation) {
                            trace!(request_id = infl.id(), generation, "stale discovery timer");
                        } else {
                            break Some(self.finish());
                        }
                    }
                    Some(InflightSignal::BrokerError(msg)) => {
                        break Some(Err(UrError::Transport(format!("discovery interrupted: {msg}"))));
                    }
                    Some(InflightSignal::BrokerClosed) => {
                        break Some(Err(UrError::Transport(
                            "discovery interrupted: broker connection closed".into(),
                        )));
                    }
                    Some(other) => trace!(request_id = infl.id(), ?other, "discovery: ignored signal"),
                }
            }
        };

        infl.cancel_timeout();
        infl.complete();
        match outcome {
            None => debug!(request_id = infl.id(), "discovery cancelled"),
            Some(Ok(found)) => {
                debug!(request_id = infl.id(), found = found.len(), "discovery ended");
                self.emit(DiscoveryEvent::End(found));
            }
            Some(Err(e)) => {
                debug!(request_id = infl.id(), "discovery failed: {e}");
                self.emit(DiscoveryEvent::Error(e));
            }
        }
    }

    fn emit(&self, event: DiscoveryEvent) {
        let _ = self.events.send(event);
    }

    /// Record a reply. Returns true once an explicit node list is exhausted.
    fn accept(&mut self, info: ServerInfo, raw: Value) -> bool {
        if info.headnode && !self.include_headnode {
            trace!(uuid = %info.uuid, "skipping headnode");
            return false;
        }

        let Some(expected) = self.expected.as_mut() else {
            let seen = self.found.iter().any(|f| f.hostname == info.hostname || f.uuid == info.uuid);
            if !seen {
                self.emit(DiscoveryEvent::Server(info.clone(), raw));
                self.found.push(info);
            }
            return false;
        };

        let by_uuid = remove_value(expected, &normalize_ident(&info.uuid));
        let by_hostname = remove_value(expected, &normalize_ident(&info.hostname));
        let exhausted = expected.is_empty();
        if by_uuid && by_hostname {
            self.emit(DiscoveryEvent::Duplicate {
                uuid: info.uuid.clone(),
                hostname: info.hostname.clone(),
            });
        }
        if by_uuid || by_hostname {
            self.emit(DiscoveryEvent::Server(info.clone(), raw));
            self.found.push(info);
        }
        exhausted
    }

    fn finish(&mut self) -> Result<Vec<ServerInfo>, UrError> {
        let found = std::mem::take(&mut self.found);
        match self.expected.take() {
            Some(missing) if !missing.is_empty() => Err(UrError::PartialDiscovery { found, missing }),
            _ => Ok(found),
        }
    }
}

fn remove_value(list: &mut Vec<String>, value: &str) -> bool {
    match list.iter().position(|v| v == value) {
        Some(idx) => {
            list.remove(idx);
            true
        }
        None => false,
    }
}

#[cfg(test)]
#[path = "discovery_tests.rs"]
mod tests;
