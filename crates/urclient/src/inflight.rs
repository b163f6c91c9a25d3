// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Correlation table for requests awaiting a reply over the broker.
//!
//! Each [`Inflight`] is owned by whoever registered it; the registry keeps a
//! weak lookup reference so replies, timers and the HTTP side-channel can
//! find it by id. Signals are delivered through a per-inflight mailbox in
//! the order they were emitted, never from inside the emitter's frame.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::http::{FileFetch, FileUpload};
use crate::server::ServerInfo;

/// What a registered inflight was created for. The connection uses this to
/// decide how an `execute-reply` for the id should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightKind {
    Command,
    SysinfoBroadcast,
    Ping,
}

/// Result of a script run on a remote agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    #[serde(default)]
    pub exit_status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Notifications delivered to the owner of an inflight.
#[derive(Debug)]
pub enum InflightSignal {
    CommandReply(CommandReply),
    /// A timer armed by [`Inflight::start_timeout`] fired; carries its generation.
    Timeout(u64),
    PingReply(Value),
    /// A sysinfo reply to a broadcast, normalised plus the raw snapshot.
    Server(ServerInfo, Value),
    /// The broker connection failed.
    BrokerError(String),
    /// The broker closed the connection.
    BrokerClosed,
    HttpGet(FileFetch),
    HttpPut(FileUpload),
}

/// Receiving half of an inflight's mailbox. Yields `None` once the inflight
/// has been completed and all queued signals are drained.
pub type Signals = mpsc::UnboundedReceiver<InflightSignal>;

type Table = Mutex<HashMap<String, Weak<Shared>>>;

/// Lookup table from correlation id to live inflight.
#[derive(Clone, Default)]
pub struct InflightRegistry {
    table: Arc<Table>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and register a new inflight.
    pub fn register(&self, kind: InflightKind, payload: Value) -> (Inflight, Signals) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.table.lock();
        let id = loop {
            let candidate = new_id();
            if !table.contains_key(&candidate) {
                break candidate;
            }
        };

        let shared = Arc::new(Shared {
            id: id.clone(),
            kind,
            payload,
            complete: AtomicBool::new(false),
            timer: Mutex::new(TimerSlot { generation: 0, handle: None }),
            tx: Mutex::new(Some(tx)),
            table: Arc::downgrade(&self.table),
        });
        table.insert(id, Arc::downgrade(&shared));
        (Inflight { shared }, rx)
    }

    /// Find a live inflight. Unknown and already-completed ids are
    /// indistinguishable.
    pub fn lookup(&self, id: &str) -> Option<Inflight> {
        let weak = self.table.lock().get(id).cloned()?;
        let shared = weak.upgrade()?;
        if shared.complete.load(Ordering::Acquire) {
            return None;
        }
        Some(Inflight { shared })
    }

    /// Deliver a signal to every live inflight. Returns how many received it.
    pub fn broadcast(&self, make: impl Fn() -> InflightSignal) -> usize {
        let live: Vec<Inflight> = {
            let table = self.table.lock();
            table.values().filter_map(Weak::upgrade).map(|shared| Inflight { shared }).collect()
        };
        live.iter().filter(|infl| infl.emit(make())).count()
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a registered request. Cloning shares the same inflight.
#[derive(Clone)]
pub struct Inflight {
    shared: Arc<Shared>,
}

struct Shared {
    id: String,
    kind: InflightKind,
    payload: Value,
    complete: AtomicBool,
    timer: Mutex<TimerSlot>,
    tx: Mutex<Option<mpsc::UnboundedSender<InflightSignal>>>,
    table: Weak<Table>,
}

struct TimerSlot {
    generation: u64,
    handle: Option<AbortHandle>,
}

impl Inflight {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn kind(&self) -> InflightKind {
        self.shared.kind
    }

    pub fn payload(&self) -> &Value {
        &self.shared.payload
    }

    /// Queue a signal for the owner. Returns false once completed or when
    /// the owner has stopped listening.
    pub fn emit(&self, signal: InflightSignal) -> bool {
        match &*self.shared.tx.lock() {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    /// Arm (or re-arm) the timeout. Any previously armed timer is replaced
    /// and its pending `Timeout` becomes stale. Returns the new generation.
    pub fn start_timeout(&self, after: Duration) -> u64 {
        let mut slot = self.shared.timer.lock();
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;
        if self.is_complete() {
            return generation;
        }

        let weak = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(shared) = weak.upgrade() {
                Inflight { shared }.emit(InflightSignal::Timeout(generation));
            }
        });
        slot.handle = Some(task.abort_handle());
        generation
    }

    /// Disarm the timeout. A `Timeout` already queued becomes stale.
    pub fn cancel_timeout(&self) {
        let mut slot = self.shared.timer.lock();
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        slot.generation += 1;
    }

    /// Whether a `Timeout(generation)` predates the current timer.
    pub fn is_stale(&self, generation: u64) -> bool {
        let slot = self.shared.timer.lock();
        slot.handle.is_none() || slot.generation != generation
    }

    pub fn is_complete(&self) -> bool {
        self.shared.complete.load(Ordering::Acquire)
    }

    /// Remove from the registry, cancel the timer and close the mailbox.
    /// Calling this more than once is a no-op.
    pub fn complete(&self) {
        if self.shared.complete.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_timeout();
        if let Some(table) = self.shared.table.upgrade() {
            let mut table = table.lock();
            let ours = table
                .get(&self.shared.id)
                .is_some_and(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(&self.shared)));
            if ours {
                table.remove(&self.shared.id);
            }
        }
        self.shared.tx.lock().take();
    }
}

impl fmt::Debug for Inflight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inflight")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().handle.take() {
            handle.abort();
        }
        // Owner went away without completing; drop the dangling lookup entry.
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock();
            if table.get(&self.id).is_some_and(|w| w.strong_count() == 0) {
                table.remove(&self.id);
            }
        }
    }
}

/// 64 random bits as a fixed-width hex token.
pub(crate) fn new_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
#[path = "inflight_tests.rs"]
mod tests;
