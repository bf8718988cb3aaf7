//! Broker server
//!
//! Listens for bot processes and serves both contracts out of one shared
//! rate-limit cache and one identify-lock registry.

use crate::frame::{read_frame, write_frame};
use crate::lock::LockRegistry;
use crate::protocol::{BrokerRequest, BrokerResponse, Call, Reply};
use quill_common::{ClientError, ClientResult};
use quill_rest::{Method, RateLimitHeaders, Route};
use quill_rest::RateLimitCache;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A running broker server
pub struct BrokerServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl BrokerServer {
    /// Bind and start serving
    pub async fn bind(addr: &str, cache: Arc<RateLimitCache>) -> ClientResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(ClientError::transport)?;
        let local_addr = listener.local_addr().map_err(ClientError::transport)?;
        let locks = Arc::new(LockRegistry::new());
        tracing::info!(%local_addr, "broker listening");

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(error = %err, "broker accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer, "broker connection opened");
                let cache = cache.clone();
                let locks = locks.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, cache, locks).await {
                        tracing::debug!(%peer, error = %err, "broker connection ended");
                    }
                });
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    /// The bound address, useful when binding to port zero
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting; open connections end with their peers
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    cache: Arc<RateLimitCache>,
    locks: Arc<LockRegistry>,
) -> ClientResult<()> {
    let mut stream = BufStream::new(stream);
    while let Some(request) = read_frame::<_, BrokerRequest>(&mut stream).await? {
        let result = handle_call(request.call, &cache, &locks).await;
        if let Err(err) = &result {
            tracing::warn!(error = %err, "broker call failed");
        }
        let response = BrokerResponse {
            id: request.id,
            result: result.map_err(|e| e.to_string()),
        };
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}

async fn handle_call(
    call: Call,
    cache: &RateLimitCache,
    locks: &LockRegistry,
) -> ClientResult<Reply> {
    match call {
        Call::RateLimitAuthorize { method, path } => {
            let route = parse_route(&method, path)?;
            let wait = cache.authorize(&route).await?;
            Ok(Reply::Authorize {
                reset_after_ms: wait.as_millis() as u64,
            })
        }

        Call::RateLimitUpdate {
            method,
            path,
            global,
            bucket,
            limit,
            remaining,
            reset_after_ms,
        } => {
            let route = parse_route(&method, path)?;
            let headers = RateLimitHeaders {
                bucket,
                limit,
                remaining,
                reset_after: reset_after_ms.map(Duration::from_millis),
                global,
            };
            cache.update(&route, &headers).await?;
            Ok(Reply::Unit)
        }

        Call::LockAcquire { duration_ms } => {
            let lease = locks.acquire(Duration::from_millis(duration_ms)).await;
            Ok(lease_reply(lease))
        }

        Call::LockRenew { token, duration_ms } => {
            let lease = locks.renew(&token, Duration::from_millis(duration_ms)).await;
            Ok(lease_reply(lease))
        }

        Call::LockRelease { token } => {
            locks.release(&token).await;
            Ok(Reply::Unit)
        }
    }
}

fn lease_reply(lease: Option<crate::lock::Lease>) -> Reply {
    match lease {
        Some(lease) => Reply::Lock {
            granted: true,
            token: Some(lease.token),
            expires_at_ms: Some(lease.expires_at_ms),
        },
        None => Reply::Lock {
            granted: false,
            token: None,
            expires_at_ms: None,
        },
    }
}

fn parse_route(method: &str, path: String) -> ClientResult<Route> {
    let method = Method::parse(method)
        .ok_or_else(|| ClientError::Protocol(format!("unknown method {method}")))?;
    Ok(Route::new(method, path))
}
