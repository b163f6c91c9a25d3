// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end fleet tests: a real client and file side-channel against the
//! in-memory broker and agents that move bytes over HTTP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use urclient::discovery::{DiscoveryEvent, DiscoveryOptions};
use urclient::runqueue::{Action, ActionOutput, QueueEvent, QueueServer, RunQueue, RunQueueOptions};
use urclient::test_support::{within, FakeAgent};
use urclient::{RecvFileRequest, SendFileRequest, UrError};
use urclient_specs::{curl_agent, Fleet, TIMEOUT};

fn explicit(nodes: &[&str], timeout: Duration) -> DiscoveryOptions {
    DiscoveryOptions {
        node_list: Some(nodes.iter().map(|n| (*n).to_owned()).collect()),
        exclude_headnode: false,
        timeout,
    }
}

// -- Discovery ------------------------------------------------------------------

#[tokio::test]
async fn discovery_of_a_listed_fleet() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    for n in 0..5 {
        FakeAgent::new(&format!("u{n}"), &format!("cn{n}")).spawn(&fleet.broker);
    }

    let started = Instant::now();
    let discovery = fleet.client.discover(explicit(&["cn0", "U3", " cn4 "], Duration::from_secs(30)))?;
    let found = within(TIMEOUT, discovery.collect()).await??;
    let mut uuids: Vec<String> = found.into_iter().map(|s| s.uuid).collect();
    uuids.sort();
    assert_eq!(uuids, vec!["u0", "u3", "u4"]);
    assert!(started.elapsed() < Duration::from_secs(30));
    Ok(())
}

#[tokio::test]
async fn discovery_lists_exactly_the_missing_nodes() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    FakeAgent::new("u1", "cn1").spawn(&fleet.broker);
    FakeAgent::new("u2", "cn2").deaf_to_broadcasts().spawn(&fleet.broker);

    let discovery = fleet.client.discover(explicit(&["cn1", "cn2", "u9"], Duration::from_millis(300)))?;
    let err = match within(TIMEOUT, discovery.collect()).await? {
        Ok(found) => anyhow::bail!("partial fleet reported complete: {found:?}"),
        Err(e) => e,
    };
    let UrError::PartialDiscovery { found, mut missing } = err else {
        anyhow::bail!("expected a partial discovery");
    };
    missing.sort();
    assert_eq!(missing, vec!["cn2", "u9"]);
    assert_eq!(found.len(), 1);
    Ok(())
}

#[tokio::test]
async fn discovery_flags_a_node_named_twice() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    FakeAgent::new("u1", "cn1").spawn(&fleet.broker);

    let mut discovery = fleet.client.discover(explicit(&["u1", "cn1"], Duration::from_secs(30)))?;
    let mut duplicates = 0;
    loop {
        match within(TIMEOUT, discovery.next()).await? {
            Some(DiscoveryEvent::Duplicate { uuid, .. }) => {
                assert_eq!(uuid, "u1");
                duplicates += 1;
            }
            Some(DiscoveryEvent::Server(..)) => {}
            Some(DiscoveryEvent::End(found)) => {
                assert_eq!(found.len(), 1);
                break;
            }
            Some(DiscoveryEvent::Error(e)) => anyhow::bail!("discovery failed: {e}"),
            None => anyhow::bail!("discovery ended without End"),
        }
    }
    assert_eq!(duplicates, 1);
    Ok(())
}

// -- File transfer ----------------------------------------------------------------

#[tokio::test]
async fn send_file_over_http() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    curl_agent("u1", "cn1").spawn(&fleet.broker);
    let src = fleet.local.join("payload.bin");
    let contents: Vec<u8> = (0..1_000_000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(&src, &contents)?;

    let req = SendFileRequest {
        server_uuid: "u1".into(),
        src_file: src,
        dst_dir: fleet.remote.clone(),
        clobber: false,
        timeout: Duration::from_secs(5),
    };
    within(TIMEOUT, fleet.client.send_file(req)?.wait()).await??;
    assert_eq!(std::fs::read(fleet.remote.join("payload.bin"))?, contents);
    Ok(())
}

#[tokio::test]
async fn send_file_refuses_to_clobber() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    curl_agent("u1", "cn1").spawn(&fleet.broker);
    let src = fleet.local.join("motd");
    std::fs::write(&src, "replacement")?;
    let dest = fleet.remote.join("motd");
    std::fs::write(&dest, "original")?;

    let req = SendFileRequest {
        server_uuid: "u1".into(),
        src_file: src,
        dst_dir: fleet.remote.clone(),
        clobber: false,
        timeout: Duration::from_secs(5),
    };
    let Err(err) = within(TIMEOUT, fleet.client.send_file(req)?.wait()).await? else {
        anyhow::bail!("existing destination was overwritten");
    };
    assert_eq!(err.code(), "EEXIST");
    assert_eq!(std::fs::read_to_string(&dest)?, "original");
    let leftovers = std::fs::read_dir(&fleet.remote)?.count();
    assert_eq!(leftovers, 1);
    Ok(())
}

#[tokio::test]
async fn recv_file_over_http() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    curl_agent("u1", "cn1").spawn(&fleet.broker);
    let src = fleet.remote.join("syslog");
    std::fs::write(&src, "line one\nline two\n")?;

    let req = RecvFileRequest {
        server_uuid: "u1".into(),
        src_file: src,
        dst_dir: fleet.local.clone(),
        timeout: Duration::from_secs(5),
    };
    let path = within(TIMEOUT, fleet.client.recv_file(req)?.wait()).await??;
    assert_eq!(path, fleet.local.join("u1"));
    assert_eq!(std::fs::read_to_string(path)?, "line one\nline two\n");
    Ok(())
}

#[tokio::test]
async fn stray_side_channel_requests_are_404() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    urclient_specs::ensure_crypto();
    let addr = fleet.client.http_addr().ok_or_else(|| anyhow::anyhow!("http disabled"))?;

    let resp = reqwest::get(format!("http://{addr}/file/0123456789abcdef")).await?;
    assert_eq!(resp.status().as_u16(), 404);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    Ok(())
}

// -- Ping ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_of_a_nonexistent_server_times_out() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    let started = Instant::now();
    let Err(err) = within(TIMEOUT, fleet.client.ping("no-such-server", Duration::from_millis(400))?.wait()).await?
    else {
        anyhow::bail!("ghost answered");
    };
    assert_eq!(err.code(), "ETIMEDOUT");
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(fleet.client.is_ready());
    Ok(())
}

// -- Run queue ------------------------------------------------------------------------

#[tokio::test]
async fn fan_out_to_a_discovered_fleet() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    for n in 0..20 {
        curl_agent(&format!("u{n}"), &format!("cn{n}"))
            .delay(Duration::from_millis(20))
            .spawn(&fleet.broker);
    }
    FakeAgent::new("hn", "headnode").headnode().spawn(&fleet.broker);

    let discovery = fleet.client.discover(DiscoveryOptions {
        node_list: None,
        exclude_headnode: true,
        timeout: Duration::from_millis(300),
    })?;
    let servers = within(TIMEOUT, discovery.collect()).await??;
    assert_eq!(servers.len(), 20);

    let client = Arc::new(fleet.client);
    let options = RunQueueOptions {
        action: Action::Exec { script: "hostname".into(), env: HashMap::new(), args: vec!["ok".into()] },
        concurrency: 4,
        timeout: Duration::from_secs(5),
    };
    let (queue, mut events) = RunQueue::new(client.clone(), options)?;
    for server in &servers {
        queue.add_server(QueueServer::from(server))?;
    }
    queue.start();
    queue.close();

    let (mut successes, mut max_outstanding) = (0, 0);
    loop {
        max_outstanding = max_outstanding.max(queue.count_outstanding());
        match within(TIMEOUT, events.recv()).await? {
            Some(QueueEvent::Success(_, ActionOutput::Exec(reply))) => {
                assert_eq!(reply.stdout, "ok");
                successes += 1;
            }
            Some(QueueEvent::Dispatch(_)) => {}
            Some(QueueEvent::End) => break,
            other => anyhow::bail!("unexpected {other:?}"),
        }
    }
    assert_eq!(successes, 20);
    assert!(max_outstanding <= 4, "{max_outstanding}");
    assert_eq!(queue.count_dispatched(), 20);
    Ok(())
}

#[tokio::test]
async fn fan_out_send_file_reports_each_server() -> anyhow::Result<()> {
    let fleet = Fleet::start().await?;
    curl_agent("u1", "cn1").spawn(&fleet.broker);
    curl_agent("u2", "cn2").spawn(&fleet.broker);
    let src = fleet.local.join("motd");
    std::fs::write(&src, "hello fleet")?;
    // u1 and u2 share the remote directory here, so the second write would
    // clobber; one of them must fail with EEXIST.
    let client = Arc::new(fleet.client);
    let options = RunQueueOptions {
        action: Action::SendFile { src_file: src, dst_dir: fleet.remote.clone(), clobber: false },
        concurrency: 1,
        timeout: Duration::from_secs(5),
    };
    let (queue, mut events) = RunQueue::new(client.clone(), options)?;
    queue.add_server(QueueServer { uuid: "u1".into(), hostname: "cn1".into() })?;
    queue.add_server(QueueServer { uuid: "u2".into(), hostname: "cn2".into() })?;
    queue.start();
    queue.close();

    let mut outcomes = Vec::new();
    loop {
        match within(TIMEOUT, events.recv()).await? {
            Some(QueueEvent::Success(server, ActionOutput::SendFile)) => outcomes.push((server.uuid, "ok")),
            Some(QueueEvent::Failure(server, e)) => {
                assert_eq!(e.code(), "EEXIST");
                outcomes.push((server.uuid, "exists"));
            }
            Some(QueueEvent::Dispatch(_)) => {}
            Some(QueueEvent::End) => break,
            other => anyhow::bail!("unexpected {other:?}"),
        }
    }
    assert_eq!(outcomes, vec![("u1".to_owned(), "ok"), ("u2".to_owned(), "exists")]);
    assert_eq!(std::fs::read_to_string(fleet.remote.join("motd"))?, "hello fleet");
    Ok(())
}
