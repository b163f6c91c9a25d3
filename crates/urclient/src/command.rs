// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command-line front end. Every subcommand prints one JSON object per line
//! on stdout and returns a process exit code.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::{ExecRequest, RecvFileRequest, SendFileRequest, UrClient};
use crate::config::ClientConfig;
use crate::discovery::{DiscoveryEvent, DiscoveryOptions};
use crate::error::UrError;
use crate::runqueue::{Action, ActionOutput, QueueEvent, QueueServer, RunQueue, RunQueueOptions};
use crate::server::ServerInfo;

/// Run commands and move files across a fleet of agents.
#[derive(Debug, Parser)]
#[command(name = "urclient", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub client: ClientConfig,

    /// Log format (json or text).
    #[arg(long, env = "UR_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "UR_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// How long to wait for the broker before giving up, in milliseconds.
    #[arg(long, env = "UR_READY_TIMEOUT_MS", default_value_t = 30_000)]
    pub ready_timeout_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the agents answering a sysinfo broadcast.
    Discover(DiscoverArgs),
    /// Run a script on one agent.
    Exec(ExecArgs),
    /// Check that one agent is answering.
    Ping(PingArgs),
    /// Copy a local file into a directory on one agent.
    SendFile(SendFileArgs),
    /// Copy a file from one agent into a local directory.
    RecvFile(RecvFileArgs),
    /// Run one action on many agents.
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct TargetArgs {
    /// Uuids or hostnames to target (comma-separated, repeatable). Omit to
    /// target every agent that answers.
    #[arg(long = "node", short = 'n', value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Leave out headnodes.
    #[arg(long)]
    pub exclude_headnode: bool,

    /// Discovery ends this long after the last reply, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub discovery_timeout_ms: u64,
}

impl TargetArgs {
    fn options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            node_list: (!self.nodes.is_empty()).then(|| self.nodes.clone()),
            exclude_headnode: self.exclude_headnode,
            timeout: Duration::from_millis(self.discovery_timeout_ms),
        }
    }
}

#[derive(Debug, Args)]
pub struct DiscoverArgs {
    #[command(flatten)]
    pub targets: TargetArgs,
}

#[derive(Debug, Args)]
pub struct ScriptArgs {
    /// Script text to run.
    #[arg(long, conflicts_with = "script_file", required_unless_present = "script_file")]
    pub script: Option<String>,

    /// Read the script from this file.
    #[arg(long)]
    pub script_file: Option<PathBuf>,

    /// Environment for the script, as KEY=VALUE (repeatable).
    #[arg(long = "env", short = 'e', value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Arguments passed to the script. `%%ID%%` becomes the request id.
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl ScriptArgs {
    async fn script(&self) -> anyhow::Result<String> {
        match (&self.script, &self.script_file) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(path)) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| anyhow::anyhow!("could not read {}: {e}", path.display())),
            (None, None) => anyhow::bail!("one of --script or --script-file is required"),
        }
    }

    fn env(&self) -> HashMap<String, String> {
        self.env.iter().cloned().collect()
    }
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    pub server_uuid: String,

    #[command(flatten)]
    pub script: ScriptArgs,

    /// Milliseconds to wait for the reply.
    #[arg(long, default_value_t = 60_000)]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct PingArgs {
    pub server_uuid: String,

    /// Milliseconds to wait for the ack.
    #[arg(long, default_value_t = 5_000)]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct SendFileArgs {
    pub server_uuid: String,
    pub src_file: PathBuf,
    pub dst_dir: PathBuf,

    /// Overwrite the destination if it exists.
    #[arg(long)]
    pub clobber: bool,

    #[arg(long, default_value_t = 60_000)]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct RecvFileArgs {
    pub server_uuid: String,
    pub src_file: PathBuf,
    pub dst_dir: PathBuf,

    #[arg(long, default_value_t = 60_000)]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub targets: TargetArgs,

    /// Most agents working at once; 0 means no limit.
    #[arg(long, short = 'c', default_value_t = 50)]
    pub concurrency: usize,

    /// Per-agent timeout in milliseconds.
    #[arg(long, default_value_t = 60_000)]
    pub timeout_ms: u64,

    #[command(subcommand)]
    pub action: RunAction,
}

#[derive(Debug, Subcommand)]
pub enum RunAction {
    /// Run a script everywhere.
    Exec(ScriptArgs),
    /// Copy a local file to every agent.
    SendFile {
        src_file: PathBuf,
        dst_dir: PathBuf,
        #[arg(long)]
        clobber: bool,
    },
    /// Copy a file from every agent into `dst_dir/<uuid>`.
    RecvFile { src_file: PathBuf, dst_dir: PathBuf },
}

impl RunAction {
    async fn action(&self) -> anyhow::Result<Action> {
        Ok(match self {
            Self::Exec(script) => Action::Exec {
                script: script.script().await?,
                env: script.env(),
                args: script.args.clone(),
            },
            Self::SendFile { src_file, dst_dir, clobber } => Action::SendFile {
                src_file: src_file.clone(),
                dst_dir: dst_dir.clone(),
                clobber: *clobber,
            },
            Self::RecvFile { src_file, dst_dir } => {
                Action::RecvFile { src_file: src_file.clone(), dst_dir: dst_dir.clone() }
            }
        })
    }
}

/// Parse `KEY=VALUE`.
pub fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

/// JSON form of an error, as printed by every subcommand.
pub fn error_json(err: &UrError) -> Value {
    let mut out = json!({ "code": err.code(), "message": err.to_string() });
    match err {
        UrError::PartialDiscovery { found, missing } => {
            out["found"] = json!(found.iter().map(|s| &s.uuid).collect::<Vec<_>>());
            out["missing"] = json!(missing);
        }
        UrError::Remote { server_uuid, stderr, .. } => {
            out["server_uuid"] = json!(server_uuid);
            if let Some(stderr) = stderr {
                out["stderr"] = json!(stderr);
            }
        }
        UrError::Timeout { server_uuid: Some(uuid), .. } | UrError::Transfer { server_uuid: uuid, .. } => {
            out["server_uuid"] = json!(uuid);
        }
        _ => {}
    }
    out
}

fn emit(line: Value) {
    println!("{line}");
}

fn emit_error(err: &UrError) -> i32 {
    emit(json!({ "event": "error", "error": error_json(err) }));
    match err {
        UrError::Validation(_) => 2,
        _ => 1,
    }
}

/// Connect, run the chosen subcommand and close. Returns the exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let client = UrClient::connect(cli.client).await?;
    let ready = Duration::from_millis(cli.ready_timeout_ms);
    match tokio::time::timeout(ready, client.wait_ready()).await {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("broker not ready after {ready:?}"),
    }
    info!("broker ready");

    let client = Arc::new(client);
    let code = match cli.command {
        Command::Discover(args) => discover(&client, &args.targets).await,
        Command::Exec(args) => exec(&client, args).await?,
        Command::Ping(args) => ping(&client, args).await,
        Command::SendFile(args) => send_file(&client, args).await,
        Command::RecvFile(args) => recv_file(&client, args).await,
        Command::Run(args) => run_queue(&client, args).await?,
    };
    client.close();
    Ok(code)
}

async fn discover(client: &UrClient, targets: &TargetArgs) -> i32 {
    let mut discovery = match client.discover(targets.options()) {
        Ok(d) => d,
        Err(e) => return emit_error(&e),
    };
    while let Some(event) = discovery.next().await {
        match event {
            DiscoveryEvent::Server(info, _) => emit(json!({ "event": "server", "server": info })),
            DiscoveryEvent::Duplicate { uuid, hostname } => {
                warn!(uuid, hostname, "node named twice");
            }
            DiscoveryEvent::End(found) => {
                emit(json!({ "event": "end", "found": found.len() }));
                return 0;
            }
            DiscoveryEvent::Error(e) => return emit_error(&e),
        }
    }
    1
}

async fn exec(client: &UrClient, args: ExecArgs) -> anyhow::Result<i32> {
    let req = ExecRequest {
        server_uuid: args.server_uuid.clone(),
        script: args.script.script().await?,
        args: args.script.args.clone(),
        env: args.script.env(),
        timeout: Duration::from_millis(args.timeout_ms),
    };
    let pending = match client.exec(req) {
        Ok(p) => p,
        Err(e) => return Ok(emit_error(&e)),
    };
    Ok(match pending.await {
        Ok(reply) => {
            emit(json!({ "event": "reply", "server_uuid": args.server_uuid, "result": reply }));
            if reply.exit_status == 0 {
                0
            } else {
                1
            }
        }
        Err(e) => emit_error(&e),
    })
}

async fn ping(client: &UrClient, args: PingArgs) -> i32 {
    let pending = match client.ping(&args.server_uuid, Duration::from_millis(args.timeout_ms)) {
        Ok(p) => p,
        Err(e) => return emit_error(&e),
    };
    match pending.await {
        Ok(ack) => {
            emit(json!({ "event": "pong", "server_uuid": args.server_uuid, "ack": ack }));
            0
        }
        Err(e) => emit_error(&e),
    }
}

async fn send_file(client: &UrClient, args: SendFileArgs) -> i32 {
    let req = SendFileRequest {
        server_uuid: args.server_uuid.clone(),
        src_file: args.src_file,
        dst_dir: args.dst_dir,
        clobber: args.clobber,
        timeout: Duration::from_millis(args.timeout_ms),
    };
    match client.send_file(req) {
        Ok(pending) => match pending.await {
            Ok(()) => {
                emit(json!({ "event": "sent", "server_uuid": args.server_uuid }));
                0
            }
            Err(e) => emit_error(&e),
        },
        Err(e) => emit_error(&e),
    }
}

async fn recv_file(client: &UrClient, args: RecvFileArgs) -> i32 {
    let req = RecvFileRequest {
        server_uuid: args.server_uuid.clone(),
        src_file: args.src_file,
        dst_dir: args.dst_dir,
        timeout: Duration::from_millis(args.timeout_ms),
    };
    match client.recv_file(req) {
        Ok(pending) => match pending.await {
            Ok(path) => {
                emit(json!({
                    "event": "received",
                    "server_uuid": args.server_uuid,
                    "path": path.display().to_string(),
                }));
                0
            }
            Err(e) => emit_error(&e),
        },
        Err(e) => emit_error(&e),
    }
}

async fn run_queue(client: &Arc<UrClient>, args: RunArgs) -> anyhow::Result<i32> {
    let action = args.action.action().await?;
    let servers: Vec<ServerInfo> = match client.discover(args.targets.options()) {
        Ok(discovery) => match discovery.collect().await {
            Ok(found) => found,
            Err(e) => return Ok(emit_error(&e)),
        },
        Err(e) => return Ok(emit_error(&e)),
    };
    info!(servers = servers.len(), action = action.name(), "dispatching");

    let options = RunQueueOptions {
        action,
        concurrency: args.concurrency,
        timeout: Duration::from_millis(args.timeout_ms),
    };
    let (queue, mut events) = match RunQueue::new(Arc::clone(client) as Arc<dyn crate::runqueue::ActionDispatch>, options) {
        Ok(q) => q,
        Err(e) => return Ok(emit_error(&e)),
    };
    for server in &servers {
        queue.add_server(QueueServer::from(server))?;
    }
    queue.start();
    queue.close();

    let mut failures = 0usize;
    let mut interrupts = 0u32;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(QueueEvent::Dispatch(server)) => {
                    info!(uuid = %server.uuid, hostname = %server.hostname, "dispatch");
                }
                Some(QueueEvent::Success(server, output)) => {
                    if let ActionOutput::Exec(reply) = &output {
                        if reply.exit_status != 0 {
                            failures += 1;
                        }
                    }
                    emit(json!({
                        "event": "success",
                        "uuid": server.uuid,
                        "hostname": server.hostname,
                        "result": output_json(&output),
                    }));
                }
                Some(QueueEvent::Failure(server, e)) => {
                    failures += 1;
                    emit(json!({
                        "event": "failure",
                        "uuid": server.uuid,
                        "hostname": server.hostname,
                        "error": error_json(&e),
                    }));
                }
                Some(QueueEvent::End) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                // First interrupt stops new work; the second gives up on the rest.
                interrupts += 1;
                if interrupts == 1 {
                    warn!("interrupted; cancelling pending work");
                    queue.cancel();
                } else {
                    warn!("interrupted again; aborting");
                    queue.abort();
                }
            }
        }
    }

    emit(json!({ "event": "end", "servers": servers.len(), "failures": failures }));
    Ok(if failures == 0 { 0 } else { 1 })
}

fn output_json(output: &ActionOutput) -> Value {
    match output {
        ActionOutput::Exec(reply) => json!(reply),
        ActionOutput::SendFile => Value::Null,
        ActionOutput::RecvFile(path) => json!({ "path": path.display().to_string() }),
    }
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
