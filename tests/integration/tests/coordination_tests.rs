//! Cross-process coordination scenarios: broker-backed identify locks and
//! rate-limit fallback

use integration_tests::{test_config, MockGateway};
use quill_broker::{BrokerClient, BrokerServer};
use quill_common::GlobalBucketConfig;
use quill_gateway::protocol::OpCode;
use quill_gateway::{Cluster, IdentifyLock, RemoteGate};
use quill_rest::{CoordinatedLimiter, Method, RateLimitCache, RateLimiter, Route};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_identify_holds_the_broker_lock_until_ready() {
    let cache = Arc::new(RateLimitCache::new(GlobalBucketConfig::default()));
    let server = BrokerServer::bind("127.0.0.1:0", cache).await.unwrap();
    let addr = server.local_addr().to_string();

    let mut gateway = MockGateway::start().await;
    let config = test_config(&gateway.url, vec![0], 1);
    let rest = Arc::new(
        quill_rest::RestClient::new("test-token", config.rest.clone()).unwrap(),
    );
    let locks = vec![RemoteGate {
        lock: Arc::new(BrokerClient::new(addr.clone())),
        allow_fallback: false,
    }];
    let (cluster, mut events) = Cluster::start_with(config, rest, locks).await.unwrap();

    let mut conn = gateway.next_conn().await;
    conn.hello(45_000).await;
    let identify = conn.expect_op(OpCode::Identify).await;
    assert_eq!(identify.op, OpCode::Identify);

    // While the shard is identifying, a competing process is refused
    let competitor = BrokerClient::new(addr);
    let refused = competitor.acquire(Duration::from_secs(30)).await.unwrap();
    assert!(refused.is_none(), "lock was free during an identify");

    conn.ready(1, "sess-lock", &[]).await;
    // Wait until the cluster reports the shard up, then the lock must free
    loop {
        let event = tokio::time::timeout(Duration::from_secs(15), events.recv())
            .await
            .expect("timed out")
            .expect("stream ended");
        if event.name == quill_gateway::SHARD_STARTUP_COMPLETE {
            break;
        }
    }

    let mut granted = None;
    for _ in 0..50 {
        granted = competitor.acquire(Duration::from_secs(30)).await.unwrap();
        if granted.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let lease = granted.expect("lock never freed after READY");
    competitor.release(&lease.token).await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_fallback_degrades_to_local() {
    // Nothing listens here: every broker call fails
    let dead_broker = Arc::new(BrokerClient::new("127.0.0.1:1"));
    let local = Arc::new(RateLimitCache::new(GlobalBucketConfig::default()));
    let limiter = CoordinatedLimiter::new(dead_broker.clone(), local.clone(), true);

    let route = Route::new(Method::Post, "channels/1/messages");
    let wait = limiter.authorize(&route).await.unwrap();
    assert_eq!(wait, Duration::ZERO);

    // Without fallback the RPC failure surfaces
    let strict = CoordinatedLimiter::new(dead_broker, local, false);
    assert!(strict.authorize(&route).await.is_err());
}
