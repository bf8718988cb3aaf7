//! Identify lock registry
//!
//! Server-side single-holder lock with expiring leases. A lease that
//! lapses without release is simply reclaimable; the defaulting holder's
//! renew and release become no-ops.

use rand::Rng;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Holder {
    token: String,
    expires_at: Instant,
}

/// A granted lease as the registry reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub token: String,
    /// Unix epoch milliseconds, for the wire contract
    pub expires_at_ms: u64,
}

/// Single-holder lock with lease expiry
#[derive(Debug, Default)]
pub struct LockRegistry {
    holder: Mutex<Option<Holder>>,
}

impl LockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock; `None` while a live lease is held
    pub async fn acquire(&self, duration: Duration) -> Option<Lease> {
        let mut holder = self.holder.lock().await;
        let now = Instant::now();
        if let Some(current) = holder.as_ref() {
            if current.expires_at > now {
                return None;
            }
            tracing::debug!("reclaiming an expired identify lease");
        }

        let token = new_token();
        *holder = Some(Holder {
            token: token.clone(),
            expires_at: now + duration,
        });
        Some(Lease {
            token,
            expires_at_ms: epoch_ms_after(duration),
        })
    }

    /// Extend a held lease; false when the caller no longer holds it
    pub async fn renew(&self, token: &str, duration: Duration) -> Option<Lease> {
        let mut holder = self.holder.lock().await;
        let now = Instant::now();
        match holder.as_mut() {
            Some(current) if current.token == token && current.expires_at > now => {
                current.expires_at = now + duration;
                Some(Lease {
                    token: token.to_string(),
                    expires_at_ms: epoch_ms_after(duration),
                })
            }
            _ => None,
        }
    }

    /// Release a held lease; a stranger's token is ignored
    pub async fn release(&self, token: &str) {
        let mut holder = self.holder.lock().await;
        if holder.as_ref().map(|h| h.token.as_str()) == Some(token) {
            *holder = None;
        }
    }
}

fn new_token() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

fn epoch_ms_after(duration: Duration) -> u64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    (now + duration).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_holder() {
        let registry = LockRegistry::new();
        let lease = registry.acquire(Duration::from_secs(30)).await.unwrap();
        assert!(registry.acquire(Duration::from_secs(30)).await.is_none());

        registry.release(&lease.token).await;
        assert!(registry.acquire(Duration::from_secs(30)).await.is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let registry = LockRegistry::new();
        let _lease = registry.acquire(Duration::from_millis(50)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.acquire(Duration::from_secs(30)).await.is_some());
    }

    #[tokio::test]
    async fn test_renew_extends_only_for_holder() {
        let registry = LockRegistry::new();
        let lease = registry.acquire(Duration::from_secs(30)).await.unwrap();

        assert!(registry
            .renew(&lease.token, Duration::from_secs(30))
            .await
            .is_some());
        assert!(registry
            .renew("someone-else", Duration::from_secs(30))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_release_ignores_strangers() {
        let registry = LockRegistry::new();
        let lease = registry.acquire(Duration::from_secs(30)).await.unwrap();

        registry.release("someone-else").await;
        // Still held
        assert!(registry.acquire(Duration::from_secs(30)).await.is_none());

        registry.release(&lease.token).await;
        assert!(registry.acquire(Duration::from_secs(30)).await.is_some());
    }

    #[test]
    fn test_tokens_are_distinct() {
        assert_ne!(new_token(), new_token());
        assert_eq!(new_token().len(), 32);
    }
}
