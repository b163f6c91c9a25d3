// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The public client: run commands, move files, ping and discover agents.

use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::discovery::{Discovery, DiscoveryOptions};
use crate::error::UrError;
use crate::http::FileServer;
use crate::inflight::{CommandReply, Inflight, InflightRegistry, InflightSignal, Signals};
use crate::runqueue::{Action, ActionDispatch, ActionOutput};
use crate::transfer::{self, Direction};
use crate::transport::nats::NatsTransport;
use crate::transport::Transport;

/// An operation in flight: its correlation handle plus the eventual result.
///
/// The operation makes progress whether or not the result is awaited.
/// Completing the inflight from outside abandons it.
pub struct Pending<T> {
    inflight: Inflight,
    result: BoxFuture<'static, Result<T, UrError>>,
}

impl<T: Send + 'static> Pending<T> {
    pub(crate) fn spawn(inflight: Inflight, fut: impl Future<Output = Result<T, UrError>> + Send + 'static) -> Self {
        let task = tokio::spawn(fut);
        Self {
            inflight,
            result: Box::pin(async move { task.await.unwrap_or(Err(UrError::Abandoned)) }),
        }
    }

    pub fn inflight(&self) -> &Inflight {
        &self.inflight
    }

    pub fn id(&self) -> &str {
        self.inflight.id()
    }

    pub async fn wait(self) -> Result<T, UrError> {
        self.result.await
    }

    pub fn map<U: Send + 'static>(self, f: impl FnOnce(T) -> U + Send + 'static) -> Pending<U> {
        let result = self.result;
        Pending { inflight: self.inflight, result: Box::pin(async move { result.await.map(f) }) }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").field("inflight", &self.inflight).finish_non_exhaustive()
    }
}

impl<T: Send + 'static> IntoFuture for Pending<T> {
    type Output = Result<T, UrError>;
    type IntoFuture = BoxFuture<'static, Result<T, UrError>>;

    fn into_future(self) -> Self::IntoFuture {
        self.result
    }
}

/// Run `script` on one agent.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub server_uuid: String,
    pub script: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
}

/// Push a local file into a directory on one agent.
#[derive(Debug, Clone)]
pub struct SendFileRequest {
    pub server_uuid: String,
    pub src_file: PathBuf,
    pub dst_dir: PathBuf,
    pub clobber: bool,
    pub timeout: Duration,
}

/// Pull a file from one agent into `dst_dir/<server_uuid>`.
#[derive(Debug, Clone)]
pub struct RecvFileRequest {
    pub server_uuid: String,
    pub src_file: PathBuf,
    pub dst_dir: PathBuf,
    pub timeout: Duration,
}

/// Per-operation settings shared by the operation drivers.
#[derive(Clone)]
pub(crate) struct OpContext {
    conn: Connection,
    pub(crate) server_uuid: String,
    pub(crate) timeout: Duration,
}

impl OpContext {
    /// Whether a broker failure ends the operation. With reconnect on, an
    /// operation outlives the link and is bounded by its own timeout.
    pub(crate) fn broker_fatal(&self) -> bool {
        !self.conn.reconnects() || self.conn.state() == ConnectionState::Closed
    }

    pub(crate) fn timed_out(&self, message: impl Into<String>) -> UrError {
        UrError::timeout(Some(&self.server_uuid), message)
    }

    pub(crate) fn transfer_error(&self, message: impl Into<String>) -> UrError {
        UrError::Transfer { server_uuid: self.server_uuid.clone(), message: message.into() }
    }
}

/// Client for a fleet of agents behind a broker.
pub struct UrClient {
    conn: Connection,
    registry: InflightRegistry,
    http: Option<FileServer>,
}

impl UrClient {
    /// Validate `config`, start the side-channel and begin connecting.
    pub async fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, UrError> {
        config.validate()?;
        let registry = InflightRegistry::new();
        let http = match (config.enable_http, config.bind_ip) {
            (true, Some(ip)) => Some(
                FileServer::bind(ip, registry.clone())
                    .await
                    .map_err(|e| UrError::Transport(format!("could not init http: {e:#}")))?,
            ),
            _ => None,
        };
        let conn = Connection::new(config.broker, registry.clone(), transport)?;
        Ok(Self { conn, registry, http })
    }

    /// Connect through NATS.
    pub async fn connect(config: ClientConfig) -> Result<Self, UrError> {
        Self::new(config, Arc::new(NatsTransport)).await
    }

    pub fn is_ready(&self) -> bool {
        self.conn.is_ready()
    }

    pub async fn wait_ready(&self) -> Result<(), UrError> {
        self.conn.wait_ready().await
    }

    /// Connection-wide notifications: readiness, snooped traffic and
    /// unsolicited agent announcements.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.conn.subscribe()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[doc(hidden)]
    pub fn registry(&self) -> &InflightRegistry {
        &self.registry
    }

    /// Address of the file side-channel, if enabled.
    pub fn http_addr(&self) -> Option<std::net::SocketAddr> {
        self.http.as_ref().map(FileServer::addr)
    }

    pub fn close(&self) {
        self.conn.close();
        if let Some(http) = &self.http {
            http.shutdown();
        }
    }

    fn context(&self, server_uuid: &str, timeout: Duration) -> OpContext {
        OpContext { conn: self.conn.clone(), server_uuid: server_uuid.to_owned(), timeout }
    }

    fn file_url(&self) -> Result<String, UrError> {
        self.http.as_ref().map(FileServer::file_url_template).ok_or(UrError::HttpDisabled)
    }

    pub fn exec(&self, req: ExecRequest) -> Result<Pending<CommandReply>, UrError> {
        require("server_uuid", &req.server_uuid)?;
        require("script", &req.script)?;
        require_timeout(req.timeout)?;
        let (infl, signals) = self
            .conn
            .send_command(&req.server_uuid, &req.script, &req.args, &req.env, json!({ "server_uuid": req.server_uuid }))
            .ok_or(UrError::NotReady)?;
        let ctx = self.context(&req.server_uuid, req.timeout);
        Ok(Pending::spawn(infl.clone(), run_exec(ctx, infl, signals)))
    }

    pub fn send_file(&self, req: SendFileRequest) -> Result<Pending<()>, UrError> {
        require("server_uuid", &req.server_uuid)?;
        require_path("src_file", &req.src_file)?;
        require_path("dst_dir", &req.dst_dir)?;
        require_timeout(req.timeout)?;
        let url = self.file_url()?;
        let destination = transfer::send_destination(&req.src_file, &req.dst_dir);
        let args = transfer::send_args(&url, &destination, req.clobber);
        let (infl, signals) = self
            .conn
            .send_command(
                &req.server_uuid,
                transfer::SEND_SCRIPT,
                &args,
                &HashMap::new(),
                json!({ "server_uuid": req.server_uuid, "src_file": req.src_file.display().to_string() }),
            )
            .ok_or(UrError::NotReady)?;
        let ctx = self.context(&req.server_uuid, req.timeout);
        let direction = Direction::Send { source: req.src_file };
        Ok(Pending::spawn(infl.clone(), transfer::run(ctx, infl, signals, direction)))
    }

    /// Returns the local path the file was written to.
    pub fn recv_file(&self, req: RecvFileRequest) -> Result<Pending<PathBuf>, UrError> {
        require("server_uuid", &req.server_uuid)?;
        require_path("src_file", &req.src_file)?;
        require_path("dst_dir", &req.dst_dir)?;
        require_timeout(req.timeout)?;
        let url = self.file_url()?;
        let args = transfer::recv_args(&url, &req.src_file);
        let (infl, signals) = self
            .conn
            .send_command(
                &req.server_uuid,
                transfer::RECV_SCRIPT,
                &args,
                &HashMap::new(),
                json!({ "server_uuid": req.server_uuid, "src_file": req.src_file.display().to_string() }),
            )
            .ok_or(UrError::NotReady)?;
        let ctx = self.context(&req.server_uuid, req.timeout);
        let destination = transfer::recv_destination(&req.dst_dir, &req.server_uuid);
        let direction = Direction::Recv { destination: destination.clone() };
        let fut = transfer::run(ctx, infl.clone(), signals, direction);
        Ok(Pending::spawn(infl, async move { fut.await.map(|()| destination) }))
    }

    /// Resolves to the agent's ack body.
    pub fn ping(&self, server_uuid: &str, timeout: Duration) -> Result<Pending<Value>, UrError> {
        require("server_uuid", server_uuid)?;
        require_timeout(timeout)?;
        let (infl, signals) = self.conn.send_ping(server_uuid).ok_or(UrError::NotReady)?;
        let ctx = self.context(server_uuid, timeout);
        Ok(Pending::spawn(infl.clone(), run_ping(ctx, infl, signals)))
    }

    pub fn discover(&self, options: DiscoveryOptions) -> Result<Discovery, UrError> {
        Discovery::start(&self.conn, options)
    }
}

impl std::fmt::Debug for UrClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrClient")
            .field("state", &self.conn.state())
            .field("http", &self.http_addr())
            .finish()
    }
}

impl Drop for UrClient {
    fn drop(&mut self) {
        self.conn.close();
    }
}

impl ActionDispatch for UrClient {
    fn dispatch(
        &self,
        server_uuid: &str,
        action: &Action,
        timeout: Duration,
    ) -> Result<Pending<ActionOutput>, UrError> {
        let server_uuid = server_uuid.to_owned();
        match action {
            Action::Exec { script, env, args } => Ok(self
                .exec(ExecRequest {
                    server_uuid,
                    script: script.clone(),
                    args: args.clone(),
                    env: env.clone(),
                    timeout,
                })?
                .map(ActionOutput::Exec)),
            Action::SendFile { src_file, dst_dir, clobber } => Ok(self
                .send_file(SendFileRequest {
                    server_uuid,
                    src_file: src_file.clone(),
                    dst_dir: dst_dir.clone(),
                    clobber: *clobber,
                    timeout,
                })?
                .map(|()| ActionOutput::SendFile)),
            Action::RecvFile { src_file, dst_dir } => Ok(self
                .recv_file(RecvFileRequest {
                    server_uuid,
                    src_file: src_file.clone(),
                    dst_dir: dst_dir.clone(),
                    timeout,
                })?
                .map(ActionOutput::RecvFile)),
        }
    }
}

fn require(name: &str, value: &str) -> Result<(), UrError> {
    if value.trim().is_empty() {
        return Err(UrError::validation(format!("{name} must not be empty")));
    }
    Ok(())
}

fn require_path(name: &str, value: &Path) -> Result<(), UrError> {
    if value.as_os_str().is_empty() {
        return Err(UrError::validation(format!("{name} must not be empty")));
    }
    Ok(())
}

fn require_timeout(timeout: Duration) -> Result<(), UrError> {
    if timeout.is_zero() {
        return Err(UrError::validation("timeout must be greater than 0"));
    }
    Ok(())
}

async fn run_exec(ctx: OpContext, infl: Inflight, mut signals: Signals) -> Result<CommandReply, UrError> {
    infl.start_timeout(ctx.timeout);
    let result = loop {
        match signals.recv().await {
            None => break Err(UrError::Abandoned),
            Some(InflightSignal::CommandReply(reply)) => break Ok(reply),
            Some(InflightSignal::Timeout(generation)) if !infl.is_stale(generation) => {
                break Err(ctx.timed_out(format!("timeout for host {}", ctx.server_uuid)));
            }
            Some(InflightSignal::BrokerError(msg)) if ctx.broker_fatal() => {
                break Err(UrError::Transport(msg));
            }
            Some(InflightSignal::BrokerClosed) if ctx.broker_fatal() => {
                break Err(UrError::Transport("broker connection closed".into()));
            }
            Some(other) => trace!(request_id = infl.id(), ?other, "exec: ignored signal"),
        }
    };
    infl.complete();
    debug!(request_id = infl.id(), server_uuid = %ctx.server_uuid, ok = result.is_ok(), "exec finished");
    result
}

async fn run_ping(ctx: OpContext, infl: Inflight, mut signals: Signals) -> Result<Value, UrError> {
    infl.start_timeout(ctx.timeout);
    let result = loop {
        match signals.recv().await {
            None => break Err(UrError::Abandoned),
            Some(InflightSignal::PingReply(ack)) => break Ok(ack),
            Some(InflightSignal::Timeout(generation)) if !infl.is_stale(generation) => {
                break Err(ctx.timed_out("ping timeout"));
            }
            Some(InflightSignal::BrokerError(msg)) if ctx.broker_fatal() => {
                break Err(UrError::Transport(msg));
            }
            Some(InflightSignal::BrokerClosed) if ctx.broker_fatal() => {
                break Err(UrError::Transport("broker connection closed".into()));
            }
            Some(other) => trace!(request_id = infl.id(), ?other, "ping: ignored signal"),
        }
    };
    infl.complete();
    result
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
