//! Broker client
//!
//! One TCP connection to the broker, shared by the REST limiter seam and
//! the identify-lock seam. Calls are serialized on the connection;
//! transport failures drop it so the next call redials.

use crate::frame::{read_frame, write_frame};
use crate::protocol::{BrokerRequest, BrokerResponse, Call, Reply};
use async_trait::async_trait;
use quill_common::{ClientError, ClientResult};
use quill_gateway::{IdentifyLock, RemoteLease};
use quill_rest::{RateLimitHeaders, RateLimiter, Route};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Client half of the broker protocol
///
/// Implements both [`RateLimiter`] and [`IdentifyLock`], so one broker
/// connection can back a REST client and an identify gate at once.
pub struct BrokerClient {
    addr: String,
    connection: Mutex<Option<BufStream<TcpStream>>>,
    next_id: AtomicU64,
}

impl BrokerClient {
    /// Create a client; the connection is dialed lazily on first use
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Issue one call and wait for its reply
    pub async fn call(&self, call: Call) -> ClientResult<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = BrokerRequest { id, call };

        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| ClientError::Rpc(format!("broker connect failed: {e}")))?;
            *connection = Some(BufStream::new(stream));
        }
        let stream = connection.as_mut().expect("connected above");

        let result = Self::exchange(stream, &request).await;
        match result {
            Ok(response) => {
                if response.id != id {
                    *connection = None;
                    return Err(ClientError::Rpc(format!(
                        "broker answered call {} with id {}",
                        id, response.id
                    )));
                }
                response.result.map_err(ClientError::Rpc)
            }
            Err(err) => {
                // A broken connection redials on the next call
                *connection = None;
                Err(ClientError::Rpc(err.to_string()))
            }
        }
    }

    async fn exchange(
        stream: &mut BufStream<TcpStream>,
        request: &BrokerRequest,
    ) -> ClientResult<BrokerResponse> {
        write_frame(stream, request).await?;
        read_frame(stream)
            .await?
            .ok_or_else(|| ClientError::Rpc("broker closed the connection".into()))
    }
}

#[async_trait]
impl RateLimiter for BrokerClient {
    async fn authorize(&self, route: &Route) -> ClientResult<Duration> {
        let reply = self
            .call(Call::RateLimitAuthorize {
                method: route.method.as_str().to_string(),
                path: route.path.clone(),
            })
            .await?;
        match reply {
            Reply::Authorize { reset_after_ms } => Ok(Duration::from_millis(reset_after_ms)),
            other => Err(ClientError::Rpc(format!("unexpected reply {other:?}"))),
        }
    }

    async fn update(&self, route: &Route, headers: &RateLimitHeaders) -> ClientResult<()> {
        let reply = self
            .call(Call::RateLimitUpdate {
                method: route.method.as_str().to_string(),
                path: route.path.clone(),
                global: headers.global,
                bucket: headers.bucket.clone(),
                limit: headers.limit,
                remaining: headers.remaining,
                reset_after_ms: headers.reset_after.map(|d| d.as_millis() as u64),
            })
            .await?;
        match reply {
            Reply::Unit => Ok(()),
            other => Err(ClientError::Rpc(format!("unexpected reply {other:?}"))),
        }
    }
}

#[async_trait]
impl IdentifyLock for BrokerClient {
    async fn acquire(&self, duration: Duration) -> ClientResult<Option<RemoteLease>> {
        let reply = self
            .call(Call::LockAcquire {
                duration_ms: duration.as_millis() as u64,
            })
            .await?;
        match reply {
            Reply::Lock {
                granted: true,
                token: Some(token),
                ..
            } => Ok(Some(RemoteLease {
                token,
                duration_ms: duration.as_millis() as u64,
            })),
            Reply::Lock { .. } => Ok(None),
            other => Err(ClientError::Rpc(format!("unexpected reply {other:?}"))),
        }
    }

    async fn renew(&self, token: &str, duration: Duration) -> ClientResult<bool> {
        let reply = self
            .call(Call::LockRenew {
                token: token.to_string(),
                duration_ms: duration.as_millis() as u64,
            })
            .await?;
        match reply {
            Reply::Lock { granted, .. } => Ok(granted),
            other => Err(ClientError::Rpc(format!("unexpected reply {other:?}"))),
        }
    }

    async fn release(&self, token: &str) -> ClientResult<()> {
        let reply = self
            .call(Call::LockRelease {
                token: token.to_string(),
            })
            .await?;
        match reply {
            Reply::Unit => Ok(()),
            other => Err(ClientError::Rpc(format!("unexpected reply {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::BrokerServer;
    use quill_common::GlobalBucketConfig;
    use quill_rest::{Method, RateLimitCache};
    use std::sync::Arc;

    async fn broker() -> (BrokerServer, BrokerClient, Arc<RateLimitCache>) {
        let cache = Arc::new(RateLimitCache::new(GlobalBucketConfig::default()));
        let server = BrokerServer::bind("127.0.0.1:0", cache.clone())
            .await
            .unwrap();
        let client = BrokerClient::new(server.local_addr().to_string());
        (server, client, cache)
    }

    #[tokio::test]
    async fn test_authorize_and_update_share_the_server_cache() {
        let (_server, client, _cache) = broker().await;
        let route = Route::new(Method::Post, "channels/1/messages");

        let wait = client.authorize(&route).await.unwrap();
        assert_eq!(wait, Duration::ZERO);

        client
            .update(
                &route,
                &RateLimitHeaders {
                    bucket: Some("b".to_string()),
                    limit: Some(5),
                    remaining: Some(0),
                    reset_after: Some(Duration::from_secs(30)),
                    global: false,
                },
            )
            .await
            .unwrap();

        let wait = client.authorize(&route).await.unwrap();
        assert!(wait > Duration::from_secs(25));
    }

    #[tokio::test]
    async fn test_lock_cycle() {
        let (_server, client, _cache) = broker().await;
        let other = BrokerClient::new(client.addr.clone());

        let lease = client
            .acquire(Duration::from_secs(30))
            .await
            .unwrap()
            .expect("granted");

        // A competing process is refused while the lease is live
        assert!(other.acquire(Duration::from_secs(30)).await.unwrap().is_none());

        assert!(client.renew(&lease.token, Duration::from_secs(30)).await.unwrap());
        client.release(&lease.token).await.unwrap();

        assert!(other.acquire(Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_reclaimed_by_competitor() {
        let (_server, client, _cache) = broker().await;
        let other = BrokerClient::new(client.addr.clone());

        client
            .acquire(Duration::from_millis(50))
            .await
            .unwrap()
            .expect("granted");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(other.acquire(Duration::from_secs(30)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_rpc_error() {
        let client = BrokerClient::new("127.0.0.1:1");
        let route = Route::new(Method::Get, "gateway/bot");
        let result = RateLimiter::authorize(&client, &route).await;
        assert!(matches!(result, Err(ClientError::Rpc(_))));
    }

    #[tokio::test]
    async fn test_client_redials_after_failure() {
        // Reserve a port, then release it so the first call finds nobody
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = BrokerClient::new(addr.to_string());
        let route = Route::new(Method::Get, "guilds/1");
        assert!(client.authorize(&route).await.is_err());

        // The broker comes up; the next call dials fresh and succeeds
        let cache = Arc::new(RateLimitCache::new(GlobalBucketConfig::default()));
        let _server = BrokerServer::bind(&addr.to_string(), cache).await.unwrap();
        let wait = client.authorize(&route).await.unwrap();
        assert_eq!(wait, Duration::ZERO);
    }
}
