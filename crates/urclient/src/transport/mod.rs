// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker boundary: the operations the connection manager needs from a
//! topic-routed publish/subscribe broker, and the NATS adapter.

pub mod nats;

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;

/// Buffer between a link's reader tasks and the connection driver.
pub const EVENT_BUFFER: usize = 1024;

/// A message delivered to our queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

/// Connection-level notifications from a link.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Delivery(Delivery),
    /// Proof of life from the broker, independent of traffic.
    Heartbeat,
    Error(String),
    Closed,
}

/// A freshly handshaken broker connection.
pub struct Connected {
    pub link: Box<dyn Link>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Factory for broker connections. One call per connect attempt.
pub trait Transport: Send + Sync + 'static {
    fn connect<'a>(&'a self, config: &'a BrokerConfig) -> BoxFuture<'a, anyhow::Result<Connected>>;
}

/// Operations on an established broker connection.
///
/// Patterns use the topic grammar: `.`-separated segments, `*` matches one
/// segment and `#` matches zero or more.
pub trait Link: Send + Sync {
    fn open_exchange<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Declare an exclusive, auto-deleted queue.
    fn declare_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    fn bind<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        pattern: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Start delivering messages for `queue` as [`TransportEvent::Delivery`].
    fn subscribe<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Match a routing key against a topic binding pattern.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn walk(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| walk(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && walk(rest, &key[1..]),
            Some((seg, rest)) => key.first() == Some(seg) && walk(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    walk(&pattern, &key)
}
