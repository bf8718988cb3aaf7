//! Shard lifecycle scenarios against a mock gateway

use integration_tests::{test_config, GatewayConn, MockGateway};
use quill_gateway::protocol::{GatewayMessage, OpCode};
use quill_gateway::{Cluster, Event, SHARD_STARTUP_COMPLETE, STARTUP_COMPLETE};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

async fn recv_event(events: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(15), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

/// Read frames until the shard's handshake message (IDENTIFY or RESUME),
/// skipping heartbeats
async fn expect_handshake(conn: &mut GatewayConn) -> GatewayMessage {
    loop {
        let message = conn.recv().await.expect("connection ended mid-handshake");
        match message.op {
            OpCode::Identify | OpCode::Resume => return message,
            OpCode::Heartbeat => continue,
            op => panic!("unexpected op {op} during handshake"),
        }
    }
}

#[tokio::test]
async fn test_startup_then_resume_without_reidentify() {
    let mut gateway = MockGateway::start().await;
    let config = test_config(&gateway.url, vec![0], 1);
    let (cluster, mut events) = Cluster::start(config).await.unwrap();

    let mut conn = gateway.next_conn().await;
    conn.hello(45_000).await;

    let identify = expect_handshake(&mut conn).await;
    assert_eq!(identify.op, OpCode::Identify);
    let d = identify.d.unwrap();
    assert_eq!(d["token"], "Bot test-token");
    assert_eq!(d["shard"], json!([0, 1]));

    conn.ready(1, "sess-1", &[]).await;
    assert_eq!(recv_event(&mut events).await.name, "READY");
    assert_eq!(recv_event(&mut events).await.name, SHARD_STARTUP_COMPLETE);
    assert_eq!(recv_event(&mut events).await.name, STARTUP_COMPLETE);

    conn.dispatch("MESSAGE_CREATE", 42, json!({ "id": "m1" })).await;
    let event = recv_event(&mut events).await;
    assert_eq!(event.name, "MESSAGE_CREATE");
    assert_eq!(event.seq, Some(42));

    // Abnormal drop: the shard must come back and RESUME, not IDENTIFY
    drop(conn);
    let mut conn = gateway.next_conn().await;
    conn.hello(45_000).await;

    let resume = expect_handshake(&mut conn).await;
    assert_eq!(resume.op, OpCode::Resume);
    let d = resume.d.unwrap();
    assert_eq!(d["session_id"], "sess-1");
    assert_eq!(d["seq"], 42);

    // Replay the missed events, then the resumed marker
    conn.dispatch("MESSAGE_UPDATE", 43, json!({})).await;
    conn.resumed(44).await;
    assert_eq!(recv_event(&mut events).await.name, "MESSAGE_UPDATE");
    assert_eq!(recv_event(&mut events).await.name, "RESUMED");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_session_not_resumable_reidentifies() {
    let mut gateway = MockGateway::start().await;
    let config = test_config(&gateway.url, vec![0], 1);
    let (cluster, mut events) = Cluster::start(config).await.unwrap();

    let mut conn = gateway.next_conn().await;
    conn.hello(45_000).await;
    let first = expect_handshake(&mut conn).await;
    assert_eq!(first.op, OpCode::Identify);

    let asked_at = Instant::now();
    conn.invalid_session(false).await;

    // The shard pauses 1-5s, then identifies again under a fresh ticket
    let second = expect_handshake(&mut conn).await;
    assert_eq!(second.op, OpCode::Identify);
    assert!(Instant::now() - asked_at >= Duration::from_secs(1));

    conn.ready(1, "sess-2", &[]).await;
    assert_eq!(recv_event(&mut events).await.name, "READY");
    assert_eq!(recv_event(&mut events).await.name, SHARD_STARTUP_COMPLETE);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_identifies_are_serialized_across_shards() {
    let mut gateway = MockGateway::start().await;
    let config = test_config(&gateway.url, vec![0, 1], 2);
    let (cluster, mut events) = Cluster::start(config).await.unwrap();

    let mut conn0 = gateway.next_conn().await;
    conn0.hello(45_000).await;
    let id0 = expect_handshake(&mut conn0).await;
    assert_eq!(id0.d.unwrap()["shard"], json!([0, 2]));
    let shard0_identified = Instant::now();

    // While shard 0 is identifying, shard 1 must not even be dequeued
    let early = tokio::time::timeout(Duration::from_millis(1200), gateway.next_conn());
    assert!(early.await.is_err(), "shard 1 connected during shard 0's identify");

    conn0.ready(1, "s0", &[]).await;

    let mut conn1 = gateway.next_conn().await;
    conn1.hello(45_000).await;
    let id1 = expect_handshake(&mut conn1).await;
    assert_eq!(id1.d.unwrap()["shard"], json!([1, 2]));
    // The gate enforces the minimum gap between the two identifies
    assert!(Instant::now() - shard0_identified >= Duration::from_millis(500));

    conn1.ready(1, "s1", &[]).await;

    let mut names = Vec::new();
    for _ in 0..5 {
        names.push(recv_event(&mut events).await.name);
    }
    assert_eq!(
        names,
        vec![
            "READY",
            SHARD_STARTUP_COMPLETE,
            "READY",
            SHARD_STARTUP_COMPLETE,
            STARTUP_COMPLETE
        ]
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_missed_heartbeat_ack_reconnects_resumable() {
    let mut gateway = MockGateway::start().await;
    let config = test_config(&gateway.url, vec![0], 1);
    let (cluster, _events) = Cluster::start(config).await.unwrap();

    let mut conn = gateway.next_conn().await;
    conn.hello(300).await;
    let identify = expect_handshake(&mut conn).await;
    assert_eq!(identify.op, OpCode::Identify);
    conn.ready(1, "sess-hb", &[]).await;

    // Ack the first beat, then advance the sequence
    conn.expect_op(OpCode::Heartbeat).await;
    conn.heartbeat_ack().await;
    conn.dispatch("MESSAGE_CREATE", 7, json!({})).await;

    // Beats carry the last dispatch sequence
    let beat = conn.expect_op(OpCode::Heartbeat).await;
    assert_eq!(beat.d, Some(json!(7)));

    // Leave it unacknowledged: the shard treats the link as dead
    conn.expect_end().await;

    // The session survives the dead link
    let mut conn = gateway.next_conn().await;
    conn.hello(45_000).await;
    let resume = expect_handshake(&mut conn).await;
    assert_eq!(resume.op, OpCode::Resume);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_zero_heartbeat_interval_rejected() {
    let mut gateway = MockGateway::start().await;
    let config = test_config(&gateway.url, vec![0], 1);
    let (cluster, _events) = Cluster::start(config).await.unwrap();

    let mut conn = gateway.next_conn().await;
    conn.hello(0).await;
    conn.expect_end().await;

    // The shard reconnects after backoff and gets a sane HELLO
    let mut conn = gateway.next_conn().await;
    conn.hello(45_000).await;
    let identify = expect_handshake(&mut conn).await;
    assert_eq!(identify.op, OpCode::Identify);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_startup_suppresses_snapshot_guild_creates() {
    let mut gateway = MockGateway::start().await;
    let config = test_config(&gateway.url, vec![0], 1);
    let (cluster, mut events) = Cluster::start(config).await.unwrap();

    let mut conn = gateway.next_conn().await;
    conn.hello(45_000).await;
    expect_handshake(&mut conn).await;
    conn.ready(1, "sess-g", &["g1", "g2"]).await;
    assert_eq!(recv_event(&mut events).await.name, "READY");

    // Ordinary traffic during the window is suppressed
    conn.dispatch("MESSAGE_CREATE", 2, json!({})).await;
    // Snapshot guilds drain silently; completion fires on the last one
    conn.dispatch("GUILD_CREATE", 3, json!({ "id": "g1" })).await;
    conn.dispatch("GUILD_CREATE", 4, json!({ "id": "g2" })).await;

    assert_eq!(recv_event(&mut events).await.name, SHARD_STARTUP_COMPLETE);
    assert_eq!(recv_event(&mut events).await.name, STARTUP_COMPLETE);

    // After the window, traffic flows again
    conn.dispatch("MESSAGE_CREATE", 5, json!({})).await;
    let event = recv_event(&mut events).await;
    assert_eq!(event.name, "MESSAGE_CREATE");
    assert_eq!(event.seq, Some(5));

    cluster.shutdown().await;
}
