//! Database-backed install lease.

use crate::error::{InstallError, InstallResult};
use packyard_metadata::MetadataStore;
use packyard_metadata::ledger;
use packyard_metadata::repos::LockAcquisition;
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use uuid::Uuid;

/// A held lease. Dropping it does not release the lock; call
/// [`InstallLock::release`].
#[derive(Debug, Clone)]
pub struct LockLease {
    pub lock_key: String,
    pub holder: String,
    pub acquired_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    started: Instant,
}

impl LockLease {
    /// Time since the lease was taken, on the monotonic clock.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Re-read the lease row on an open transaction and fail unless this
    /// holder still owns a live lease.
    pub async fn fence(&self, conn: &mut SqliteConnection) -> InstallResult<()> {
        let now = OffsetDateTime::now_utc();
        match ledger::get_lock(conn, &self.lock_key).await? {
            Some(row) if row.is_held_by(&self.holder, now) => Ok(()),
            Some(row) => Err(InstallError::LeaseLost(format!(
                "lock {} is now held by {} (expires {:?})",
                self.lock_key,
                row.lock_holder.as_deref().unwrap_or("nobody"),
                row.lock_expires_at
            ))),
            None => Err(InstallError::LeaseLost(format!(
                "lock {} was released",
                self.lock_key
            ))),
        }
    }
}

/// Acquires and releases leases in the metadata store.
#[derive(Clone)]
pub struct InstallLock {
    store: Arc<dyn MetadataStore>,
    ttl: Duration,
}

impl InstallLock {
    pub fn new(store: Arc<dyn MetadataStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the lease for `lock_key` with a fresh holder token.
    ///
    /// Fails with `LockContention` while another holder's lease is live or
    /// another process keeps the store write-locked; an expired lease is
    /// superseded.
    pub async fn acquire(&self, lock_key: &str) -> InstallResult<LockLease> {
        let holder = Uuid::new_v4().to_string();
        let now = OffsetDateTime::now_utc();
        let expires_at = now + self.ttl;

        match self
            .store
            .try_acquire_lock(lock_key, &holder, now, expires_at)
            .await?
        {
            LockAcquisition::Acquired { superseded } => {
                if let Some(previous) = superseded {
                    tracing::warn!(
                        lock_key = %lock_key,
                        previous_holder = %previous,
                        "Reclaimed expired install lock"
                    );
                }
                tracing::debug!(lock_key = %lock_key, holder = %holder, "Acquired install lock");
                Ok(LockLease {
                    lock_key: lock_key.to_string(),
                    holder,
                    acquired_at: now,
                    expires_at,
                    started: Instant::now(),
                })
            }
            LockAcquisition::Held { holder, expires_at } => {
                tracing::info!(
                    lock_key = %lock_key,
                    holder = %holder,
                    expires_at = %expires_at,
                    "Install lock is held"
                );
                Err(InstallError::LockContention {
                    lock_key: lock_key.to_string(),
                    holder: Some(holder),
                    expires_at: Some(expires_at),
                })
            }
            LockAcquisition::Busy => {
                tracing::info!(
                    lock_key = %lock_key,
                    "Metadata store is write-locked by another installer"
                );
                Err(InstallError::LockContention {
                    lock_key: lock_key.to_string(),
                    holder: None,
                    expires_at: None,
                })
            }
        }
    }

    /// Release a lease. Best-effort: failures are logged, never returned.
    pub async fn release(&self, lease: &LockLease) {
        match self.store.release_lock(&lease.lock_key, &lease.holder).await {
            Ok(true) => {
                tracing::debug!(lock_key = %lease.lock_key, "Released install lock");
            }
            Ok(false) => {
                tracing::warn!(
                    lock_key = %lease.lock_key,
                    holder = %lease.holder,
                    "Install lock was no longer held at release"
                );
            }
            Err(e) => {
                tracing::warn!(
                    lock_key = %lease.lock_key,
                    error = %e,
                    "Failed to release install lock; it will expire"
                );
            }
        }
    }
}
