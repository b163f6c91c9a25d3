// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS adapter for the broker boundary.
//!
//! NATS routes on subjects directly, so the topic exchange is implicit and
//! each binding becomes a core subscription. Pattern `*` carries over as-is
//! and a trailing `#` becomes `>`. Reconnects are owned by the connection
//! manager, so a disconnect is reported as [`TransportEvent::Closed`] and
//! the client is dropped rather than left to retry on its own.

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Connected, Delivery, Link, Transport, TransportEvent, EVENT_BUFFER};
use crate::config::BrokerConfig;

/// Connects to a NATS server at `nats://<host>:<port>`.
#[derive(Debug, Default, Clone)]
pub struct NatsTransport;

impl Transport for NatsTransport {
    fn connect<'a>(&'a self, config: &'a BrokerConfig) -> BoxFuture<'a, anyhow::Result<Connected>> {
        Box::pin(async move {
            let (tx, events) = mpsc::channel(EVENT_BUFFER);

            let cb_tx = tx.clone();
            let opts = async_nats::ConnectOptions::with_user_and_password(
                config.login.clone(),
                config.password.clone(),
            )
            .name(&config.consumer)
            .ping_interval(config.heartbeat())
            .connection_timeout(config.connect_timeout())
            .event_callback(move |event| {
                let tx = cb_tx.clone();
                async move {
                    let mapped = match event {
                        async_nats::Event::Disconnected => Some(TransportEvent::Closed),
                        async_nats::Event::ServerError(e) => {
                            Some(TransportEvent::Error(format!("server error: {e}")))
                        }
                        async_nats::Event::ClientError(e) => {
                            Some(TransportEvent::Error(format!("client error: {e}")))
                        }
                        other => {
                            trace!("nats event: {other}");
                            None
                        }
                    };
                    if let Some(ev) = mapped {
                        let _ = tx.send(ev).await;
                    }
                }
            });

            let url = format!("nats://{}:{}", config.host, config.port);
            debug!(%url, consumer = %config.consumer, "connecting to broker");
            let client = opts.connect(url).await?;

            let link = NatsLink {
                client,
                tx,
                patterns: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
                flush_timeout: config.connect_timeout(),
            };
            link.spawn_probe(config.heartbeat());
            Ok(Connected { link: Box::new(link), events })
        })
    }
}

struct NatsLink {
    client: async_nats::Client,
    tx: mpsc::Sender<TransportEvent>,
    patterns: Mutex<Vec<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    flush_timeout: std::time::Duration,
}

impl NatsLink {
    /// Core NATS has no heartbeat frame visible to the client, so report
    /// one per interval while the connection reports itself connected.
    fn spawn_probe(&self, every: std::time::Duration) {
        let client = self.client.clone();
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if client.connection_state() == async_nats::connection::State::Connected
                            && tx.send(TransportEvent::Heartbeat).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }
}

impl Link for NatsLink {
    fn open_exchange<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            trace!(exchange = name, "nats: exchange is implicit");
            Ok(())
        })
    }

    fn declare_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            trace!(queue = name, "nats: queue is implicit");
            Ok(())
        })
    }

    fn bind<'a>(
        &'a self,
        _queue: &'a str,
        _exchange: &'a str,
        pattern: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let subject = to_subject(pattern)?;
            self.patterns.lock().push(subject);
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let subjects = self.patterns.lock().clone();
            for subject in subjects {
                let mut sub = self.client.subscribe(subject.clone()).await?;
                debug!(queue, %subject, "nats: subscribed");
                let tx = self.tx.clone();
                let shutdown = self.shutdown.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            msg = sub.next() => {
                                let Some(msg) = msg else { break };
                                let delivery = Delivery {
                                    routing_key: msg.subject.as_str().to_owned(),
                                    // Core NATS headers carry nothing the agents set.
                                    headers: HashMap::new(),
                                    payload: msg.payload,
                                };
                                if tx.send(TransportEvent::Delivery(delivery)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
                self.tasks.lock().push(handle);
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        _exchange: &'a str,
        routing_key: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.client.publish(routing_key.to_owned(), payload).await?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shutdown.cancel();
            // A reconnecting client never answers the flush.
            if self.client.connection_state() == async_nats::connection::State::Connected {
                match tokio::time::timeout(self.flush_timeout, self.client.flush()).await {
                    Ok(Err(e)) => warn!("nats: flush on close failed: {e}"),
                    Err(_) => warn!("nats: flush on close timed out"),
                    Ok(Ok(())) => {}
                }
            }
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
        })
    }
}

impl Drop for NatsLink {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Translate a topic binding pattern into a NATS subject.
pub fn to_subject(pattern: &str) -> anyhow::Result<String> {
    let segments: Vec<&str> = pattern.split('.').collect();
    let last = segments.len().saturating_sub(1);
    let mut out = Vec::with_capacity(segments.len());
    for (i, seg) in segments.iter().enumerate() {
        match *seg {
            "#" if i == last => out.push(">"),
            "#" => anyhow::bail!("'#' is only supported as the final segment: {pattern}"),
            "" => anyhow::bail!("empty segment in pattern: {pattern}"),
            s => out.push(s),
        }
    }
    Ok(out.join("."))
}

#[cfg(test)]
mod tests {
    use super::to_subject;

    #[yare::parameterized(
        literal  = { "ur.startup.abc", "ur.startup.abc" },
        star     = { "ur.execute-reply.*.*", "ur.execute-reply.*.*" },
        trailing = { "ur.#", "ur.>" },
    )]
    fn translates(pattern: &str, expected: &str) -> anyhow::Result<()> {
        assert_eq!(to_subject(pattern)?, expected);
        Ok(())
    }

    #[test]
    fn rejects_inner_hash_and_empty_segments() {
        crate::assert_err_contains!(to_subject("ur.#.reply"), "final segment");
        crate::assert_err_contains!(to_subject("ur..x"), "empty segment");
    }
}
