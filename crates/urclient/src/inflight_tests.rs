// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use serde_json::json;

use super::*;

fn command(registry: &InflightRegistry) -> (Inflight, Signals) {
    registry.register(InflightKind::Command, json!({ "server_uuid": "abc" }))
}

#[test]
fn ids_are_fixed_width_hex() {
    let registry = InflightRegistry::new();
    let (infl, _rx) = command(&registry);
    assert_eq!(infl.id().len(), 16);
    assert!(infl.id().chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn ids_are_unique_among_live_entries() {
    let registry = InflightRegistry::new();
    let held: Vec<_> = (0..512).map(|_| command(&registry)).collect();
    let mut ids: Vec<&str> = held.iter().map(|(i, _)| i.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 512);
    assert_eq!(registry.len(), 512);
}

#[test]
fn lookup_returns_same_handle_until_complete() -> anyhow::Result<()> {
    let registry = InflightRegistry::new();
    let (infl, _rx) = command(&registry);

    let found = registry.lookup(infl.id()).ok_or_else(|| anyhow::anyhow!("missing"))?;
    assert_eq!(found.id(), infl.id());
    assert_eq!(found.payload()["server_uuid"], "abc");

    infl.complete();
    assert!(registry.lookup(infl.id()).is_none());
    assert!(registry.lookup("0000000000000000").is_none());
    Ok(())
}

#[test]
fn complete_twice_is_a_noop() {
    let registry = InflightRegistry::new();
    let (a, _ra) = command(&registry);
    let (b, _rb) = command(&registry);

    a.complete();
    a.complete();
    assert!(a.is_complete());
    assert_eq!(registry.len(), 1);
    assert!(registry.lookup(b.id()).is_some());
}

#[tokio::test]
async fn complete_closes_mailbox_after_queued_signals() {
    let registry = InflightRegistry::new();
    let (infl, mut rx) = command(&registry);

    assert!(infl.emit(InflightSignal::BrokerClosed));
    infl.complete();
    assert!(!infl.emit(InflightSignal::BrokerClosed));

    assert!(matches!(rx.recv().await, Some(InflightSignal::BrokerClosed)));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn broadcast_reaches_every_live_entry() {
    let registry = InflightRegistry::new();
    let (_a, mut ra) = command(&registry);
    let (_b, mut rb) = command(&registry);
    let (c, _rc) = command(&registry);
    c.complete();

    let n = registry.broadcast(|| InflightSignal::BrokerError("link down".to_owned()));
    assert_eq!(n, 2);
    assert!(matches!(ra.recv().await, Some(InflightSignal::BrokerError(ref e)) if e == "link down"));
    assert!(matches!(rb.recv().await, Some(InflightSignal::BrokerError(_))));
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_with_current_generation() -> anyhow::Result<()> {
    let registry = InflightRegistry::new();
    let (infl, mut rx) = command(&registry);

    let generation = infl.start_timeout(Duration::from_millis(500));
    match rx.recv().await {
        Some(InflightSignal::Timeout(g)) => {
            assert_eq!(g, generation);
            assert!(!infl.is_stale(g));
        }
        other => anyhow::bail!("expected timeout, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restarting_timeout_makes_previous_stale() -> anyhow::Result<()> {
    let registry = InflightRegistry::new();
    let (infl, mut rx) = command(&registry);

    let first = infl.start_timeout(Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = infl.start_timeout(Duration::from_millis(100));
    assert!(infl.is_stale(first));

    match rx.recv().await {
        Some(InflightSignal::Timeout(g)) => assert_eq!(g, second),
        other => anyhow::bail!("expected timeout, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn cancel_timeout_suppresses_signal() {
    let registry = InflightRegistry::new();
    let (infl, mut rx) = command(&registry);

    let generation = infl.start_timeout(Duration::from_millis(100));
    infl.cancel_timeout();
    assert!(infl.is_stale(generation));

    let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
    assert!(got.is_err(), "no signal expected after cancel");
}

#[test]
fn dropping_owner_removes_lookup_entry() {
    let registry = InflightRegistry::new();
    let (infl, rx) = command(&registry);
    let id = infl.id().to_owned();
    drop(infl);
    drop(rx);
    assert!(registry.lookup(&id).is_none());
    assert!(registry.is_empty());
}
