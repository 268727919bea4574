//! Distributed mutex
//!
//! Named, TTL-guarded mutual exclusion. A holder that crashes is reclaimed
//! when its TTL lapses, so every protected operation must stay safe to
//! retry. Release-target locks (`target:{key}`) and reconcile-scope locks
//! (`reconcile:{scope}`) live in disjoint key spaces.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Proof of lock ownership; required to release.
#[derive(Debug, Clone)]
pub struct LockToken {
    pub key: String,
    pub token: Uuid,
}

/// TTL-bounded named lock service
#[async_trait]
pub trait LockService: Send + Sync {
    /// Attempt one atomic acquire. `None` means the lock is held by someone
    /// else; callers that cannot skip should use [`acquire_blocking`].
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Release a held lock. A token whose TTL already lapsed is simply gone;
    /// releasing it is a no-op, not an error.
    async fn release(&self, token: &LockToken) -> Result<()>;
}

/// Poll `try_acquire` until it succeeds or `wait` is exhausted.
///
/// Queue workers block here; idempotency-probe callers use `try_acquire`
/// directly and skip when the lock is busy.
pub async fn acquire_blocking(
    locks: &dyn LockService,
    key: &str,
    ttl: Duration,
    wait: Duration,
) -> Result<LockToken> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if let Some(token) = locks.try_acquire(key, ttl).await? {
            return Ok(token);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::LockBusy(key.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

// =============================================================================
// Postgres implementation
// =============================================================================

/// Lock service over a Postgres table.
///
/// Acquire is a single atomic upsert that only steals rows whose TTL has
/// lapsed; release is fenced by the token so an expired-and-reacquired lock
/// is never released by its previous holder.
pub struct PgLockService {
    pool: PgPool,
}

impl PgLockService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockService for PgLockService {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = Uuid::new_v4();

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO locks (key, token, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
            WHERE locks.expires_at < now()
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(token)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|_| LockToken {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        sqlx::query("DELETE FROM locks WHERE key = $1 AND token = $2")
            .bind(&token.key)
            .bind(token.token)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Process-local lock service with the same TTL semantics.
///
/// Used by tests and embedded single-process runs.
#[derive(Default)]
pub struct MemoryLockService {
    held: tokio::sync::Mutex<std::collections::HashMap<String, (Uuid, std::time::Instant)>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let mut held = self.held.lock().await;
        let now = std::time::Instant::now();

        if let Some((_, expires_at)) = held.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4();
        held.insert(key.to_string(), (token, now + ttl));
        Ok(Some(LockToken {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        let mut held = self.held.lock().await;
        if let Some((owner, _)) = held.get(&token.key) {
            if *owner == token.token {
                held.remove(&token.key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_blocks_until_release() {
        let locks = std::sync::Arc::new(MemoryLockService::new());
        let ttl = Duration::from_secs(30);

        let token = locks.try_acquire("target:a", ttl).await.unwrap().unwrap();
        assert!(locks.try_acquire("target:a", ttl).await.unwrap().is_none());

        // A second caller waits on the lock and proceeds once the first
        // holder releases.
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                acquire_blocking(locks.as_ref(), "target:a", ttl, Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        locks.release(&token).await.unwrap();

        let second = contender.await.unwrap().unwrap();
        assert_eq!(second.key, "target:a");
        locks.release(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_bounded_wait_fails_with_lock_busy() {
        let locks = MemoryLockService::new();
        let ttl = Duration::from_secs(30);

        let _held = locks.try_acquire("target:b", ttl).await.unwrap().unwrap();

        let err = acquire_blocking(&locks, "target:b", ttl, Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LockBusy(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let locks = MemoryLockService::new();

        let stale = locks
            .try_acquire("target:c", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // TTL lapsed: a new holder takes over and the stale token can no
        // longer release the lock out from under it.
        let fresh = locks
            .try_acquire("target:c", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        locks.release(&stale).await.unwrap();
        assert!(
            locks
                .try_acquire("target:c", Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
        locks.release(&fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_contend() {
        let locks = MemoryLockService::new();
        let ttl = Duration::from_secs(30);

        let a = locks.try_acquire("target:x", ttl).await.unwrap();
        let b = locks.try_acquire("reconcile:x", ttl).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
