// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broker connection lifecycle and reply demultiplexing.
//!
//! One driver task owns the link. It connects through the backoff
//! scheduler, binds our reply queue, watches for heartbeats, publishes
//! queued outbound messages and routes deliveries to inflights. Failures
//! are broadcast to every live inflight from the driver task, never from
//! inside the transport's own callbacks.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::{Backoff, INITIAL_BACKOFF, MAX_BACKOFF};
use crate::config::BrokerConfig;
use crate::error::UrError;
use crate::inflight::{
    new_id, CommandReply, Inflight, InflightKind, InflightRegistry, InflightSignal, Signals,
};
use crate::server::ServerInfo;
use crate::transport::{Connected, Delivery, Link, Transport, TransportEvent};

/// Topic exchange every agent publishes to.
pub const EXCHANGE: &str = "amq.topic";

/// Lifecycle history kept for diagnostics.
pub const HISTORY_LEN: usize = 32;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Unready,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Unready => "unready",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle transition.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub at: Instant,
    pub state: ConnectionState,
    pub note: String,
}

/// Connection-wide notifications.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Emitted once per transition into [`ConnectionState::Ready`].
    Ready,
    /// Every accepted `ur.*` delivery, before routing.
    Snoop(Delivery),
    /// An agent announced itself via `startup` or `sysinfo`.
    Server(ServerInfo, Value),
    Error(String),
    Closed,
}

/// Identity attached to every command so agents can log who ran it.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub user: String,
    pub hostname: String,
    pub pid: u32,
    pub ips: Vec<String>,
}

#[derive(Serialize)]
struct CommandMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    script: &'a str,
    args: Vec<String>,
    env: &'a HashMap<String, String>,
    client_info: &'static ClientInfo,
}

struct Outbound {
    routing_key: String,
    payload: Bytes,
}

/// Handle to the broker connection. Cloning shares the same driver.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    config: BrokerConfig,
    registry: InflightRegistry,
    ping_id: String,
    state: watch::Sender<ConnectionState>,
    history: Mutex<VecDeque<HistoryEntry>>,
    queue_name: Mutex<Option<String>>,
    events: broadcast::Sender<ConnectionEvent>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: CancellationToken,
}

enum Failure {
    Error(String),
    Closed,
}

enum Outcome {
    Shutdown,
    Failed(Failure),
}

impl Connection {
    /// Validate `config` and start connecting in the background.
    pub fn new(
        config: BrokerConfig,
        registry: InflightRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, UrError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            registry,
            ping_id: new_id(),
            state,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
            queue_name: Mutex::new(None),
            events,
            outbound,
            shutdown: CancellationToken::new(),
        });
        inner.record(ConnectionState::Disconnected, "created");
        tokio::spawn(drive(Arc::clone(&inner), transport, outbound_rx));
        Ok(Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether the link is re-established after a failure.
    pub fn reconnects(&self) -> bool {
        self.inner.config.reconnect
    }

    /// Wait until the connection is ready. Fails once it is closed, or
    /// stopped for good after a failure without reconnect.
    pub async fn wait_ready(&self) -> Result<(), UrError> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Closed => return Err(UrError::Transport("connection closed".into())),
                ConnectionState::Unready if !self.inner.config.reconnect => {
                    return Err(UrError::Transport("connection failed".into()));
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(UrError::Transport("connection closed".into()));
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The most recent lifecycle transitions, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// Token this connection's ping acks are addressed to.
    pub fn ping_id(&self) -> &str {
        &self.inner.ping_id
    }

    /// Name of the current reply queue, if one has been declared.
    pub fn queue_name(&self) -> Option<String> {
        self.inner.queue_name.lock().clone()
    }

    pub fn registry(&self) -> &InflightRegistry {
        &self.inner.registry
    }

    /// Stop the driver and drop the link. Safe to call in any state.
    pub fn close(&self) {
        if self.state() != ConnectionState::Closed {
            self.inner.record(ConnectionState::Closed, "closed by caller");
        }
        self.inner.shutdown.cancel();
    }

    /// Ask every agent for its sysinfo. Replies arrive as
    /// [`InflightSignal::Server`] on the returned inflight.
    pub fn send_sysinfo_broadcast(&self) -> Option<(Inflight, Signals)> {
        if !self.is_ready() {
            return None;
        }
        let (infl, signals) = self.inner.registry.register(InflightKind::SysinfoBroadcast, json!({}));
        debug!(request_id = infl.id(), "send sysinfo broadcast");
        self.publish(&infl, format!("ur.broadcast.sysinfo.{}", infl.id()), &json!({}))?;
        Some((infl, signals))
    }

    pub fn send_ping(&self, server_uuid: &str) -> Option<(Inflight, Signals)> {
        if !self.is_ready() {
            return None;
        }
        let (infl, signals) =
            self.inner.registry.register(InflightKind::Ping, json!({ "server_uuid": server_uuid }));
        let body = json!({ "req_id": infl.id(), "client_id": self.inner.ping_id });
        debug!(request_id = infl.id(), server_uuid, "send ping");
        self.publish(&infl, format!("ur.ping.{server_uuid}"), &body)?;
        Some((infl, signals))
    }

    /// Run `script` on one agent. `%%ID%%` in `args` becomes the new
    /// correlation id.
    pub fn send_command(
        &self,
        server_uuid: &str,
        script: &str,
        args: &[String],
        env: &HashMap<String, String>,
        payload: Value,
    ) -> Option<(Inflight, Signals)> {
        if !self.is_ready() {
            return None;
        }
        let (infl, signals) = self.inner.registry.register(InflightKind::Command, payload);
        let message = CommandMessage {
            kind: "script",
            script,
            args: args.iter().map(|a| a.replace("%%ID%%", infl.id())).collect(),
            env,
            client_info: client_info(),
        };
        debug!(request_id = infl.id(), server_uuid, "send command");
        self.publish(&infl, format!("ur.execute.{server_uuid}.{}", infl.id()), &message)?;
        Some((infl, signals))
    }

    fn publish(&self, infl: &Inflight, routing_key: String, body: &impl Serialize) -> Option<()> {
        let payload = match serde_json::to_vec(body) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!("failed to encode {routing_key}: {e}");
                infl.complete();
                return None;
            }
        };
        if self.inner.outbound.send(Outbound { routing_key, payload }).is_err() {
            infl.complete();
            return None;
        }
        Some(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("ping_id", &self.inner.ping_id)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn record(&self, state: ConnectionState, note: impl Into<String>) {
        let note = note.into();
        debug!(%state, %note, "connection state");
        {
            let mut history = self.history.lock();
            if history.len() == HISTORY_LEN {
                history.pop_front();
            }
            history.push_back(HistoryEntry { at: Instant::now(), state, note });
        }
        self.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn fail(&self, failure: Failure) {
        match failure {
            Failure::Error(msg) => {
                warn!("broker connection error: {msg}");
                self.record(ConnectionState::Unready, msg.clone());
                self.emit(ConnectionEvent::Error(msg.clone()));
                self.registry.broadcast(|| InflightSignal::BrokerError(msg.clone()));
            }
            Failure::Closed => {
                warn!("broker connection closed");
                self.record(ConnectionState::Unready, "closed by broker");
                self.emit(ConnectionEvent::Closed);
                self.registry.broadcast(|| InflightSignal::BrokerClosed);
            }
        }
    }

    fn bindings(&self) -> Vec<String> {
        if self.config.promiscuous {
            return vec!["ur.#".to_owned()];
        }
        vec![
            "ur.execute-reply.*.*".to_owned(),
            "ur.startup.*".to_owned(),
            "ur.sysinfo.*".to_owned(),
            format!("ur.ack{}.*", self.ping_id),
        ]
    }

    async fn establish(&self, transport: &dyn Transport) -> anyhow::Result<Connected> {
        let connected = transport.connect(&self.config).await?;
        let link = &connected.link;
        link.open_exchange(EXCHANGE).await?;
        let queue = format!("{}.{}", self.config.consumer, uuid::Uuid::new_v4());
        link.declare_queue(&queue).await?;
        for pattern in self.bindings() {
            debug!(%queue, %pattern, "bind queue");
            link.bind(&queue, EXCHANGE, &pattern).await?;
        }
        link.subscribe(&queue).await?;
        *self.queue_name.lock() = Some(queue);
        Ok(connected)
    }

    async fn serve(
        &self,
        link: &dyn Link,
        events: &mut mpsc::Receiver<TransportEvent>,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Outcome {
        let watchdog_after = self.config.watchdog();
        let watchdog = tokio::time::sleep(watchdog_after);
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Outcome::Shutdown,
                _ = &mut watchdog => {
                    return Outcome::Failed(Failure::Error(format!(
                        "no heartbeat from broker in {}ms",
                        watchdog_after.as_millis()
                    )));
                }
                event = events.recv() => match event {
                    None | Some(TransportEvent::Closed) => return Outcome::Failed(Failure::Closed),
                    Some(TransportEvent::Error(msg)) => return Outcome::Failed(Failure::Error(msg)),
                    Some(TransportEvent::Heartbeat) => {
                        watchdog.as_mut().reset(tokio::time::Instant::now() + watchdog_after);
                    }
                    Some(TransportEvent::Delivery(delivery)) => {
                        watchdog.as_mut().reset(tokio::time::Instant::now() + watchdog_after);
                        self.on_delivery(delivery);
                    }
                },
                msg = outbound.recv() => {
                    let Some(msg) = msg else { return Outcome::Shutdown };
                    trace!(routing_key = %msg.routing_key, "publish");
                    if let Err(e) = link.publish(EXCHANGE, &msg.routing_key, msg.payload).await {
                        return Outcome::Failed(Failure::Error(format!("publish failed: {e:#}")));
                    }
                }
            }
        }
    }

    fn on_delivery(&self, delivery: Delivery) {
        let key: Vec<&str> = delivery.routing_key.split('.').collect();
        if key.first() != Some(&"ur") {
            trace!(routing_key = %delivery.routing_key, "ignoring non-ur delivery");
            return;
        }
        self.emit(ConnectionEvent::Snoop(delivery.clone()));

        let payload: Value = match serde_json::from_slice(&delivery.payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(routing_key = %delivery.routing_key, "malformed payload: {e}");
                return;
            }
        };

        match key.get(1).copied() {
            Some("execute-reply") if key.len() == 4 => self.on_execute_reply(key[3], payload),
            Some("startup" | "sysinfo") if key.len() == 3 => match ServerInfo::from_sysinfo(&payload) {
                Some(info) => {
                    debug!(uuid = %info.uuid, hostname = %info.hostname, "server announced");
                    self.emit(ConnectionEvent::Server(info, payload));
                }
                None => debug!(routing_key = %delivery.routing_key, "sysinfo without UUID"),
            },
            Some(kind)
                if key.len() == 3 && kind.strip_prefix("ack") == Some(self.ping_id.as_str()) =>
            {
                self.on_ping_ack(key[2], payload)
            }
            _ => debug!(routing_key = %delivery.routing_key, "unknown delivery"),
        }
    }

    fn on_execute_reply(&self, request_id: &str, payload: Value) {
        let Some(infl) = self.registry.lookup(request_id) else {
            trace!(request_id, "execute-reply: unknown correlation");
            return;
        };
        match infl.kind() {
            InflightKind::SysinfoBroadcast => match ServerInfo::from_sysinfo(&payload) {
                Some(info) => {
                    debug!(uuid = %info.uuid, hostname = %info.hostname, "sysinfo response");
                    infl.emit(InflightSignal::Server(info, payload));
                }
                None => debug!(request_id, "sysinfo response without UUID"),
            },
            InflightKind::Command => match serde_json::from_value::<CommandReply>(payload) {
                Ok(reply) => {
                    infl.emit(InflightSignal::CommandReply(reply));
                }
                Err(e) => debug!(request_id, "malformed command reply: {e}"),
            },
            InflightKind::Ping => trace!(request_id, "execute-reply for a ping"),
        }
    }

    fn on_ping_ack(&self, server_uuid: &str, payload: Value) {
        let Some(request_id) = payload.get("req_id").and_then(Value::as_str) else {
            debug!(server_uuid, "ping ack without req_id");
            return;
        };
        let Some(infl) = self.registry.lookup(request_id) else {
            trace!(request_id, "ping ack: unknown correlation");
            return;
        };
        let target = infl.payload().get("server_uuid").and_then(Value::as_str);
        if infl.kind() != InflightKind::Ping || target != Some(server_uuid) {
            debug!(request_id, server_uuid, "ping ack from unexpected server");
            return;
        }
        infl.emit(InflightSignal::PingReply(payload));
    }
}

async fn drive(
    inner: Arc<Inner>,
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);

    loop {
        let delay = backoff.next_delay();
        trace!(attempt = backoff.attempt(), ?delay, "connect scheduled");
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        inner.record(ConnectionState::Connecting, format!("attempt {}", backoff.attempt()));
        let timeout = inner.config.connect_timeout();
        let attempt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            r = tokio::time::timeout(timeout, inner.establish(transport.as_ref())) => r,
        };

        let shutdown = match attempt {
            Err(_) => {
                inner.fail(Failure::Error(format!("connect timeout after {}ms", timeout.as_millis())));
                false
            }
            Ok(Err(e)) => {
                inner.fail(Failure::Error(format!("connect failed: {e:#}")));
                false
            }
            Ok(Ok(Connected { link, mut events })) => {
                backoff.reset();
                info!(queue = ?inner.queue_name.lock().as_deref(), "broker connection ready");
                inner.record(ConnectionState::Ready, "subscribed");
                inner.emit(ConnectionEvent::Ready);

                let outcome = inner.serve(link.as_ref(), &mut events, &mut outbound).await;
                *inner.queue_name.lock() = None;
                let shutdown = match outcome {
                    Outcome::Shutdown => true,
                    Outcome::Failed(failure) => {
                        inner.fail(failure);
                        false
                    }
                };
                // Waiters have been told; teardown must not hold up the backoff.
                if tokio::time::timeout(timeout, link.close()).await.is_err() {
                    warn!("link close did not finish after {}ms", timeout.as_millis());
                }
                shutdown
            }
        };

        // Publishes queued for the dead link are not replayed.
        let mut dropped = 0usize;
        while outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded queued publishes");
        }

        if shutdown || inner.shutdown.is_cancelled() {
            break;
        }
        if !inner.config.reconnect {
            info!("reconnect disabled, connection stays down");
            return;
        }
    }

    if *inner.state.borrow() != ConnectionState::Closed {
        inner.record(ConnectionState::Closed, "driver stopped");
    }
    inner.emit(ConnectionEvent::Closed);
    inner.registry.broadcast(|| InflightSignal::BrokerClosed);
}

/// Caller identity, computed on first use and cached for the process.
pub fn client_info() -> &'static ClientInfo {
    static INFO: OnceLock<ClientInfo> = OnceLock::new();
    INFO.get_or_init(|| ClientInfo {
        user: std::env::var("USER").or_else(|_| std::env::var("LOGNAME")).unwrap_or_default(),
        hostname: nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default(),
        pid: std::process::id(),
        ips: interface_addresses(),
    })
}

/// Non-loopback addresses of every local interface.
fn interface_addresses() -> Vec<String> {
    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!("getifaddrs failed: {e}");
            return Vec::new();
        }
    };
    let mut out: Vec<String> = Vec::new();
    for ifa in addrs {
        let Some(addr) = ifa.address else { continue };
        let ip = if let Some(v4) = addr.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = addr.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            continue;
        };
        if ip.is_loopback() {
            continue;
        }
        let ip = ip.to_string();
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
