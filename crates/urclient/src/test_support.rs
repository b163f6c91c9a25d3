// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: an in-memory broker, scripted agents and
//! assertion helpers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::inflight::CommandReply;
use crate::transport::{
    topic_matches, Connected, Delivery, Link, Transport, TransportEvent, EVENT_BUFFER,
};

/// A message published through the in-memory broker.
#[derive(Debug, Clone)]
pub struct Published {
    pub routing_key: String,
    /// Decoded JSON body, `Null` when the body was not JSON.
    pub payload: Value,
}

/// Topic-routing broker living entirely in the test process.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    links: Mutex<Vec<Arc<LinkState>>>,
    published: Mutex<Vec<Published>>,
    publish_tx: broadcast::Sender<Published>,
    fail_connects: AtomicU32,
    connects: AtomicU32,
    stall_connects: AtomicBool,
    hang_closes: AtomicBool,
    heartbeats: AtomicBool,
}

struct LinkState {
    tx: mpsc::Sender<TransportEvent>,
    queue: Mutex<Option<String>>,
    patterns: Mutex<Vec<String>>,
    subscribed: AtomicBool,
    closed: CancellationToken,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (publish_tx, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(BrokerState {
                links: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                publish_tx,
                fail_connects: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                stall_connects: AtomicBool::new(false),
                hang_closes: AtomicBool::new(false),
                heartbeats: AtomicBool::new(true),
            }),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Make connect attempts hang until they are timed out.
    pub fn stall_connects(&self, stall: bool) {
        self.state.stall_connects.store(stall, Ordering::SeqCst);
    }

    /// Make `Link::close` detach the link and then never return.
    pub fn hang_closes(&self, hang: bool) {
        self.state.hang_closes.store(hang, Ordering::SeqCst);
    }

    /// Stop or resume heartbeats on every link.
    pub fn set_heartbeats(&self, on: bool) {
        self.state.heartbeats.store(on, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of live, subscribed links.
    pub fn live_links(&self) -> usize {
        self.state
            .links
            .lock()
            .iter()
            .filter(|l| l.subscribed.load(Ordering::SeqCst) && !l.closed.is_cancelled())
            .count()
    }

    /// Binding patterns of every live link.
    pub fn bindings(&self) -> Vec<String> {
        self.state.links.lock().iter().flat_map(|l| l.patterns.lock().clone()).collect()
    }

    /// Queue names of every live link.
    pub fn queues(&self) -> Vec<String> {
        self.state.links.lock().iter().filter_map(|l| l.queue.lock().clone()).collect()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.published.lock().clone()
    }

    pub fn subscribe_published(&self) -> broadcast::Receiver<Published> {
        self.state.publish_tx.subscribe()
    }

    /// Wait for the first publish whose routing key starts with `prefix`,
    /// including ones that already happened.
    pub async fn wait_published(&self, prefix: &str, within: Duration) -> anyhow::Result<Published> {
        let mut rx = self.subscribe_published();
        if let Some(p) = self.published().into_iter().find(|p| p.routing_key.starts_with(prefix)) {
            return Ok(p);
        }
        tokio::time::timeout(within, async {
            loop {
                match rx.recv().await {
                    Ok(p) if p.routing_key.starts_with(prefix) => return Ok(p),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        anyhow::bail!("broker dropped while waiting for {prefix}")
                    }
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("no publish matching {prefix} within {within:?}"))?
    }

    /// Route a JSON message to every subscribed link whose bindings match.
    pub fn deliver(&self, routing_key: &str, payload: &Value) -> usize {
        let bytes = Bytes::from(serde_json::to_vec(payload).unwrap_or_default());
        self.state.route(routing_key, bytes)
    }

    /// Route raw bytes, for malformed-payload tests.
    pub fn deliver_raw(&self, routing_key: &str, payload: &'static [u8]) -> usize {
        self.state.route(routing_key, Bytes::from_static(payload))
    }

    /// Drop every link as if the broker went away.
    pub fn sever(&self) {
        for link in self.state.links.lock().drain(..) {
            link.closed.cancel();
            let _ = link.tx.try_send(TransportEvent::Closed);
        }
    }

    /// Report a transport error on every link and drop them.
    pub fn fail_links(&self, message: &str) {
        for link in self.state.links.lock().drain(..) {
            link.closed.cancel();
            let _ = link.tx.try_send(TransportEvent::Error(message.to_owned()));
        }
    }
}

impl BrokerState {
    fn route(&self, routing_key: &str, payload: Bytes) -> usize {
        let links: Vec<Arc<LinkState>> = self.links.lock().clone();
        let mut delivered = 0;
        for link in links {
            if !link.subscribed.load(Ordering::SeqCst) || link.closed.is_cancelled() {
                continue;
            }
            if !link.patterns.lock().iter().any(|p| topic_matches(p, routing_key)) {
                continue;
            }
            let delivery = Delivery {
                routing_key: routing_key.to_owned(),
                headers: Default::default(),
                payload: payload.clone(),
            };
            if link.tx.try_send(TransportEvent::Delivery(delivery)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

impl Transport for MemoryBroker {
    fn connect<'a>(&'a self, config: &'a BrokerConfig) -> BoxFuture<'a, anyhow::Result<Connected>> {
        Box::pin(async move {
            let state = &self.state;
            state.connects.fetch_add(1, Ordering::SeqCst);
            if state.stall_connects.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if state.fail_connects.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                anyhow::bail!("connection refused");
            }

            let (tx, events) = mpsc::channel(EVENT_BUFFER);
            let link = Arc::new(LinkState {
                tx,
                queue: Mutex::new(None),
                patterns: Mutex::new(Vec::new()),
                subscribed: AtomicBool::new(false),
                closed: CancellationToken::new(),
            });

            let beat = Arc::clone(&link);
            let broker = Arc::clone(state);
            let every = config.heartbeat();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = beat.closed.cancelled() => break,
                        _ = tokio::time::sleep(every) => {
                            if broker.heartbeats.load(Ordering::SeqCst)
                                && beat.tx.send(TransportEvent::Heartbeat).await.is_err()
                            {
                                break;
                            }
                        }
                    }
                }
            });

            state.links.lock().push(Arc::clone(&link));
            Ok(Connected { link: Box::new(MemoryLink { broker: Arc::clone(state), link }), events })
        })
    }
}

struct MemoryLink {
    broker: Arc<BrokerState>,
    link: Arc<LinkState>,
}

impl Link for MemoryLink {
    fn open_exchange<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn declare_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            *self.link.queue.lock() = Some(name.to_owned());
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
            self.link.patterns.lock().push(pattern.to_owned());
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, _queue: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.link.subscribed.store(true, Ordering::SeqCst);
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
            anyhow::ensure!(!self.link.closed.is_cancelled(), "link closed");
            let published = Published {
                routing_key: routing_key.to_owned(),
                payload: serde_json::from_slice(&payload).unwrap_or(Value::Null),
            };
            self.broker.published.lock().push(published.clone());
            let _ = self.broker.publish_tx.send(published);
            self.broker.route(routing_key, payload);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.link.closed.cancel();
            self.broker.links.lock().retain(|l| !Arc::ptr_eq(l, &self.link));
            if self.broker.hang_closes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
        })
    }
}

/// A command as seen by a fake agent.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub server_uuid: String,
    pub request_id: String,
    pub script: String,
    pub args: Vec<String>,
    pub message: Value,
}

type ExecHandler = Arc<dyn Fn(AgentCommand) -> BoxFuture<'static, Option<CommandReply>> + Send + Sync>;

/// A scripted remote agent answering broadcasts, pings and commands.
#[derive(Clone)]
pub struct FakeAgent {
    pub uuid: String,
    pub hostname: String,
    pub headnode: bool,
    answer_pings: bool,
    answer_broadcasts: bool,
    delay: Duration,
    exec: ExecHandler,
}

impl FakeAgent {
    /// An agent that answers everything; commands exit 0 echoing their args.
    pub fn new(uuid: &str, hostname: &str) -> Self {
        Self {
            uuid: uuid.to_owned(),
            hostname: hostname.to_owned(),
            headnode: false,
            answer_pings: true,
            answer_broadcasts: true,
            delay: Duration::ZERO,
            exec: Arc::new(|cmd: AgentCommand| -> BoxFuture<'static, Option<CommandReply>> {
                Box::pin(async move {
                    Some(CommandReply { exit_status: 0, stdout: cmd.args.join(" "), stderr: String::new() })
                })
            }),
        }
    }

    pub fn headnode(mut self) -> Self {
        self.headnode = true;
        self
    }

    /// Ignore pings.
    pub fn deaf_to_pings(mut self) -> Self {
        self.answer_pings = false;
        self
    }

    /// Ignore sysinfo broadcasts.
    pub fn deaf_to_broadcasts(mut self) -> Self {
        self.answer_broadcasts = false;
        self
    }

    /// Wait this long before every answer.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer commands with `handler`; `None` means never reply.
    pub fn on_exec<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(AgentCommand) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<CommandReply>> + Send + 'static,
    {
        self.exec = Arc::new(move |cmd: AgentCommand| -> BoxFuture<'static, Option<CommandReply>> {
            Box::pin(handler(cmd))
        });
        self
    }

    pub fn sysinfo(&self) -> Value {
        json!({
            "UUID": self.uuid,
            "Hostname": self.hostname,
            "Datacenter Name": "test-1",
            "Setup": "true",
            "Boot Parameters": { "headnode": self.headnode },
        })
    }

    /// Publish an unsolicited startup announcement.
    pub fn announce(&self, broker: &MemoryBroker) -> usize {
        broker.deliver(&format!("ur.startup.{}", self.uuid), &self.sysinfo())
    }

    /// Start answering. The agent is listening when this returns.
    pub fn spawn(self, broker: &MemoryBroker) -> JoinHandle<()> {
        let mut rx = broker.subscribe_published();
        let broker = broker.clone();
        let agent = Arc::new(self);
        tokio::spawn(async move {
            loop {
                let published = match rx.recv().await {
                    Ok(p) => p,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let agent = Arc::clone(&agent);
                let broker = broker.clone();
                tokio::spawn(async move { agent.answer(&broker, published).await });
            }
        })
    }

    async fn answer(&self, broker: &MemoryBroker, published: Published) {
        let key: Vec<&str> = published.routing_key.split('.').collect();
        match key.as_slice() {
            ["ur", "broadcast", "sysinfo", id] if self.answer_broadcasts => {
                tokio::time::sleep(self.delay).await;
                broker.deliver(&format!("ur.execute-reply.{}.{id}", self.uuid), &self.sysinfo());
            }
            ["ur", "ping", uuid] if *uuid == self.uuid && self.answer_pings => {
                let client_id = published.payload["client_id"].as_str().unwrap_or_default();
                let body = json!({ "req_id": published.payload["req_id"], "timestamp": 1 });
                tokio::time::sleep(self.delay).await;
                broker.deliver(&format!("ur.ack{client_id}.{}", self.uuid), &body);
            }
            ["ur", "execute", uuid, id] if *uuid == self.uuid => {
                let cmd = AgentCommand {
                    server_uuid: self.uuid.clone(),
                    request_id: (*id).to_owned(),
                    script: published.payload["script"].as_str().unwrap_or_default().to_owned(),
                    args: published.payload["args"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
                        .unwrap_or_default(),
                    message: published.payload.clone(),
                };
                tokio::time::sleep(self.delay).await;
                if let Some(reply) = (self.exec)(cmd).await {
                    let body = serde_json::to_value(reply).unwrap_or(Value::Null);
                    broker.deliver(&format!("ur.execute-reply.{}.{id}", self.uuid), &body);
                }
            }
            _ => {}
        }
    }
}

/// Extension trait to convert any `Display` error into `anyhow::Error`.
pub trait AnyhowExt<T> {
    fn anyhow(self) -> anyhow::Result<T>;
}

impl<T, E: std::fmt::Display> AnyhowExt<T> for Result<T, E> {
    fn anyhow(self) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// Await `fut`, failing the test instead of hanging past `within`.
pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> anyhow::Result<T> {
    tokio::time::timeout(limit, fut).await.map_err(|_| anyhow::anyhow!("timed out after {limit:?}"))
}

/// Assert that a `Result` is an `Err` whose message contains `substr`.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
