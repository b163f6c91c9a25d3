// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Smoke tests against the compiled `urclient` binary.

use urclient_specs::{free_port, run_binary};

#[tokio::test]
async fn help_lists_the_subcommands() -> anyhow::Result<()> {
    let output = run_binary(&["--help"]).await?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["discover", "exec", "ping", "send-file", "recv-file", "run"] {
        assert!(stdout.contains(sub), "missing {sub} in:\n{stdout}");
    }
    Ok(())
}

#[tokio::test]
async fn http_without_bind_ip_is_a_usage_error() -> anyhow::Result<()> {
    let output = run_binary(&["ping", "u1"]).await?;
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("bind_ip is required"));
    Ok(())
}

#[tokio::test]
async fn unreachable_broker_gives_up_after_the_ready_timeout() -> anyhow::Result<()> {
    let port = free_port()?.to_string();
    let output = run_binary(&[
        "--broker-port",
        &port,
        "--bind-ip",
        "127.0.0.1",
        "--ready-timeout-ms",
        "300",
        "ping",
        "u1",
    ])
    .await?;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("broker not ready"));
    Ok(())
}
