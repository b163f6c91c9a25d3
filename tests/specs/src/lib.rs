// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end fleet tests.
//!
//! Runs a real [`UrClient`] (side-channel included) against the in-memory
//! broker, with agents that fetch and upload files over HTTP the way the
//! transfer scripts do with curl. Also locates the compiled binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Once;
use std::time::Duration;

use urclient::inflight::CommandReply;
use urclient::test_support::{within, AgentCommand, FakeAgent, MemoryBroker};
use urclient::transfer::{EXIT_EXISTS, EXIT_NOT_DIR, EXIT_NOT_FOUND, EXIT_TRANSFER, RECV_SCRIPT, SEND_SCRIPT};
use urclient::{ClientConfig, UrClient};

pub const TIMEOUT: Duration = Duration::from_secs(10);

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times; only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `urclient` binary.
pub fn urclient_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("urclient")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Run the binary to completion with `args`, capturing its output.
pub async fn run_binary(args: &[&str]) -> anyhow::Result<Output> {
    let binary = urclient_binary();
    anyhow::ensure!(binary.exists(), "urclient binary not found at {}", binary.display());
    let args: Vec<String> = args.iter().map(|s| (*s).to_owned()).collect();
    let output = tokio::task::spawn_blocking(move || {
        Command::new(&binary)
            .args(&args)
            .env_remove("UR_BIND_IP")
            .stdin(Stdio::null())
            .output()
    })
    .await??;
    Ok(output)
}

/// A ready client, its broker and a scratch directory pair.
pub struct Fleet {
    pub broker: MemoryBroker,
    pub client: UrClient,
    /// Stands in for the operator's machine.
    pub local: PathBuf,
    /// Stands in for the agents' filesystems.
    pub remote: PathBuf,
    _dir: tempfile::TempDir,
}

impl Fleet {
    pub async fn start() -> anyhow::Result<Self> {
        ensure_crypto();
        let broker = MemoryBroker::new();
        let client = UrClient::new(ClientConfig::test(), broker.transport()).await?;
        within(TIMEOUT, client.wait_ready()).await??;

        let dir = tempfile::tempdir()?;
        let local = dir.path().join("local");
        let remote = dir.path().join("remote");
        std::fs::create_dir(&local)?;
        std::fs::create_dir(&remote)?;
        Ok(Self { broker, client, local, remote, _dir: dir })
    }
}

/// An agent that runs transfer scripts with a real HTTP client and echoes
/// the arguments of anything else.
pub fn curl_agent(uuid: &str, hostname: &str) -> FakeAgent {
    FakeAgent::new(uuid, hostname).on_exec(|cmd| async move { curl(cmd).await })
}

fn exit(code: i32, stderr: String) -> Option<CommandReply> {
    Some(CommandReply { exit_status: code, stdout: String::new(), stderr })
}

/// What `SEND_SCRIPT` and `RECV_SCRIPT` do, with reqwest as curl.
async fn curl(cmd: AgentCommand) -> Option<CommandReply> {
    ensure_crypto();
    if cmd.script == SEND_SCRIPT {
        let [url, dest, clobber] = cmd.args.as_slice() else {
            return exit(1, "usage".into());
        };
        let dest = PathBuf::from(dest);
        if clobber != "clobber" && dest.is_file() {
            return exit(EXIT_EXISTS, String::new());
        }
        if !dest.parent().is_some_and(Path::is_dir) {
            return exit(EXIT_NOT_DIR, String::new());
        }
        match fetch(url, &dest).await {
            Ok(()) => exit(0, String::new()),
            Err(e) => exit(EXIT_TRANSFER, format!("curl: (22) {e:#}\n")),
        }
    } else if cmd.script == RECV_SCRIPT {
        let [url, src] = cmd.args.as_slice() else {
            return exit(1, "usage".into());
        };
        let Ok(contents) = tokio::fs::read(src).await else {
            return exit(EXIT_NOT_FOUND, String::new());
        };
        match upload(url, contents).await {
            Ok(()) => exit(0, String::new()),
            Err(e) => exit(EXIT_TRANSFER, format!("curl: (22) {e:#}\n")),
        }
    } else {
        Some(CommandReply { exit_status: 0, stdout: cmd.args.join(" "), stderr: String::new() })
    }
}

async fn fetch(url: &str, dest: &Path) -> anyhow::Result<()> {
    let bytes = reqwest::get(url).await?.error_for_status()?.bytes().await?;
    // Same temp-then-rename dance as the script.
    let tmp = dest.with_extension("oneachnode.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, dest).await?;
    Ok(())
}

async fn upload(url: &str, contents: Vec<u8>) -> anyhow::Result<()> {
    reqwest::Client::new().put(url).body(contents).send().await?.error_for_status()?;
    Ok(())
}
