// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use yare::parameterized;

use super::{normalize_node_list, Discovery, DiscoveryEvent, DiscoveryOptions};
use crate::config::BrokerConfig;
use crate::connection::Connection;
use crate::error::UrError;
use crate::inflight::InflightRegistry;
use crate::test_support::{within, FakeAgent, MemoryBroker};

const WAIT: Duration = Duration::from_secs(3);
const QUIET: Duration = Duration::from_millis(150);

async fn ready(broker: &MemoryBroker) -> anyhow::Result<Connection> {
    let conn = Connection::new(BrokerConfig::test(), InflightRegistry::new(), broker.transport())?;
    within(WAIT, conn.wait_ready()).await??;
    Ok(conn)
}

fn options(node_list: Option<&[&str]>, timeout: Duration) -> DiscoveryOptions {
    DiscoveryOptions {
        node_list: node_list.map(|l| l.iter().map(|s| (*s).to_owned()).collect()),
        exclude_headnode: false,
        timeout,
    }
}

async fn drain(mut discovery: Discovery) -> anyhow::Result<Vec<DiscoveryEvent>> {
    let mut events = Vec::new();
    within(WAIT, async {
        while let Some(event) = discovery.next().await {
            let last = matches!(event, DiscoveryEvent::End(_) | DiscoveryEvent::Error(_));
            events.push(event);
            if last {
                break;
            }
        }
    })
    .await?;
    Ok(events)
}

fn uuids(found: &[crate::server::ServerInfo]) -> Vec<String> {
    let mut out: Vec<String> = found.iter().map(|s| s.uuid.clone()).collect();
    out.sort();
    out
}

#[parameterized(
    trims_and_lowercases = { &["  CN1 ", "cn2"], &["cn1", "cn2"] },
    drops_empty = { &["", "  ", "cn1"], &["cn1"] },
    dedupes = { &["cn1", "CN1", "cn1 "], &["cn1"] },
    all_blank = { &[" "], &[] },
)]
fn node_list_normalization(input: &[&str], expected: &[&str]) {
    let input: Vec<String> = input.iter().map(|s| (*s).to_owned()).collect();
    assert_eq!(normalize_node_list(&input), expected);
}

#[tokio::test]
async fn blank_node_list_is_rejected() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    crate::assert_err_contains!(Discovery::start(&conn, options(Some(&["", " "]), QUIET)), "no usable entries");
    crate::assert_err_contains!(Discovery::start(&conn, options(None, Duration::ZERO)), "greater than 0");
    Ok(())
}

#[tokio::test]
async fn discovery_requires_a_ready_connection() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    broker.stall_connects(true);
    let conn = Connection::new(BrokerConfig::test(), InflightRegistry::new(), broker.transport())?;
    let Err(err) = Discovery::start(&conn, options(None, QUIET)) else {
        anyhow::bail!("discovery started on an unready connection");
    };
    assert!(matches!(err, UrError::NotReady), "{err}");
    Ok(())
}

#[tokio::test]
async fn open_discovery_collects_until_quiet() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    FakeAgent::new("u1", "cn1").spawn(&broker);
    FakeAgent::new("u2", "cn2").spawn(&broker);
    FakeAgent::new("u3", "hn").headnode().spawn(&broker);

    let found = Discovery::start(&conn, options(None, QUIET))?.collect().await?;
    assert_eq!(uuids(&found), vec!["u1", "u2", "u3"]);
    assert!(conn.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn headnodes_can_be_excluded() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    FakeAgent::new("u1", "cn1").spawn(&broker);
    FakeAgent::new("u3", "hn").headnode().spawn(&broker);

    let mut opts = options(None, QUIET);
    opts.exclude_headnode = true;
    let found = Discovery::start(&conn, opts)?.collect().await?;
    assert_eq!(uuids(&found), vec!["u1"]);
    Ok(())
}

#[tokio::test]
async fn open_discovery_dedupes_by_hostname() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    FakeAgent::new("u1", "cn1").spawn(&broker);
    FakeAgent::new("u1-reimaged", "cn1").spawn(&broker);

    let events = drain(Discovery::start(&conn, options(None, QUIET))?).await?;
    let servers = events.iter().filter(|e| matches!(e, DiscoveryEvent::Server(..))).count();
    assert_eq!(servers, 1);
    let Some(DiscoveryEvent::End(found)) = events.last() else {
        anyhow::bail!("expected End, got {:?}", events.last());
    };
    assert_eq!(found.len(), 1);
    Ok(())
}

#[tokio::test]
async fn explicit_list_ends_as_soon_as_satisfied() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    FakeAgent::new("u1", "cn1").spawn(&broker);
    FakeAgent::new("u2", "cn2").spawn(&broker);
    FakeAgent::new("u3", "cn3").spawn(&broker);

    // The window is far longer than WAIT, so finishing at all proves the early end.
    let discovery = Discovery::start(&conn, options(Some(&["U1", "cn2"]), Duration::from_secs(60)))?;
    let found = within(WAIT, discovery.collect()).await??;
    assert_eq!(uuids(&found), vec!["u1", "u2"]);
    Ok(())
}

#[tokio::test]
async fn explicit_list_reports_missing_nodes() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    FakeAgent::new("u1", "cn1").spawn(&broker);

    let err = match Discovery::start(&conn, options(Some(&["cn1", "ghost"]), QUIET))?.collect().await {
        Ok(found) => anyhow::bail!("expected partial discovery, found {found:?}"),
        Err(e) => e,
    };
    assert_eq!(err.code(), "EMISSING");
    let UrError::PartialDiscovery { found, missing } = err else {
        anyhow::bail!("wrong error variant");
    };
    assert_eq!(uuids(&found), vec!["u1"]);
    assert_eq!(missing, vec!["ghost"]);
    Ok(())
}

#[tokio::test]
async fn naming_a_server_twice_reports_a_duplicate() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    FakeAgent::new("u1", "cn1").spawn(&broker);
    FakeAgent::new("u2", "cn2").spawn(&broker);

    let events = drain(Discovery::start(&conn, options(Some(&["u1", "cn1", "u2"]), Duration::from_secs(60)))?).await?;
    let duplicates: Vec<(&str, &str)> = events
        .iter()
        .filter_map(|e| match e {
            DiscoveryEvent::Duplicate { uuid, hostname } => Some((uuid.as_str(), hostname.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(duplicates, vec![("u1", "cn1")]);
    let Some(DiscoveryEvent::End(found)) = events.last() else {
        anyhow::bail!("expected End, got {:?}", events.last());
    };
    assert_eq!(uuids(found), vec!["u1", "u2"]);
    Ok(())
}

#[tokio::test]
async fn every_reply_extends_the_window() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    let mut discovery = Discovery::start(&conn, options(None, Duration::from_millis(300)))?;
    let id = discovery.id().to_owned();

    // Trickle replies in at intervals shorter than the window but longer in total.
    for (uuid, host) in [("u1", "cn1"), ("u2", "cn2"), ("u3", "cn3")] {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let agent = FakeAgent::new(uuid, host);
        broker.deliver(&format!("ur.execute-reply.{uuid}.{id}"), &agent.sysinfo());
    }

    let mut found = Vec::new();
    while let Some(event) = within(WAIT, discovery.next()).await? {
        match event {
            DiscoveryEvent::End(all) => {
                found = all;
                break;
            }
            DiscoveryEvent::Error(e) => anyhow::bail!("discovery failed: {e}"),
            _ => {}
        }
    }
    assert_eq!(uuids(&found), vec!["u1", "u2", "u3"]);
    Ok(())
}

#[tokio::test]
async fn broker_loss_interrupts_discovery() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    let discovery = Discovery::start(&conn, options(None, Duration::from_secs(60)))?;
    broker.sever();

    let Err(err) = within(WAIT, discovery.collect()).await? else {
        anyhow::bail!("discovery survived a severed broker");
    };
    assert!(err.to_string().starts_with("discovery interrupted"), "{err}");
    assert_eq!(err.code(), "ETRANSPORT");
    Ok(())
}

#[tokio::test]
async fn cancelled_discovery_goes_silent() -> anyhow::Result<()> {
    let broker = MemoryBroker::new();
    let conn = ready(&broker).await?;
    FakeAgent::new("u1", "cn1").delay(Duration::from_millis(100)).spawn(&broker);

    let mut discovery = Discovery::start(&conn, options(None, Duration::from_secs(60)))?;
    discovery.cancel();
    assert!(within(WAIT, discovery.next()).await?.is_none());
    assert!(conn.registry().is_empty());
    Ok(())
}
