//! Install lock lease repository.

use crate::error::MetadataResult;
use crate::models::PackInstallLockRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Outcome of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The caller now holds the lease. `superseded` names an expired holder
    /// whose lease was reclaimed.
    Acquired { superseded: Option<String> },
    /// Another holder has a live lease.
    Held {
        holder: String,
        expires_at: OffsetDateTime,
    },
    /// Another connection held SQLite's writer lock past the busy timeout,
    /// so the lease row could not be read.
    Busy,
}

/// Repository for lease-based install locks.
#[async_trait]
pub trait LockRepo: Send + Sync {
    /// Try to take the lease for `lock_key`.
    ///
    /// The check and the write happen in one write transaction, so two
    /// callers cannot both observe the key as free. A store that stays
    /// write-locked by another connection yields [`LockAcquisition::Busy`]
    /// rather than an error.
    async fn try_acquire_lock(
        &self,
        lock_key: &str,
        holder: &str,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<LockAcquisition>;

    /// Release the lease if `holder` still owns it. Returns whether a lease was released.
    async fn release_lock(&self, lock_key: &str, holder: &str) -> MetadataResult<bool>;

    /// Current lease row, if any.
    async fn get_lock(&self, lock_key: &str) -> MetadataResult<Option<PackInstallLockRow>>;
}
