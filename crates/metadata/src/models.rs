//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Release ledger
// =============================================================================

/// One install or rollback attempt.
#[derive(Debug, Clone, FromRow)]
pub struct PackReleaseRow {
    pub release_record_id: Uuid,
    pub pack_code: String,
    pub pack_release_id: String,
    /// applying | applied | skipped | failed | rolled_back
    pub status: String,
    /// Snapshot of the verified manifest (JSON).
    pub manifest_json: String,
    /// sha256 of the whole downloaded bundle. NULL for rollback records.
    pub artifact_sha256: Option<String>,
    pub install_summary_json: Option<String>,
    /// JSON array of warning strings.
    pub warnings_json: String,
    pub error_message: Option<String>,
    pub applied_by: Option<String>,
    pub applied_by_type: String,
    /// Set on rollback records: the release being undone.
    pub rollback_of_release_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl PackReleaseRow {
    /// Decode the stored warnings list.
    pub fn warnings(&self) -> Vec<String> {
        serde_json::from_str(&self.warnings_json).unwrap_or_default()
    }

    pub fn is_rollback(&self) -> bool {
        self.rollback_of_release_id.is_some()
    }
}

// =============================================================================
// Object revisions and current state
// =============================================================================

/// Immutable snapshot of one configuration object within one release.
#[derive(Debug, Clone, FromRow)]
pub struct PackObjectRevisionRow {
    /// Insertion sequence; totally orders revisions in creation order.
    pub revision_seq: i64,
    pub revision_id: Uuid,
    pub release_record_id: Uuid,
    pub object_type: String,
    pub object_key: String,
    pub object_hash: String,
    /// Normalized payload (JSON).
    pub content_json: String,
    pub created_at: OffsetDateTime,
}

/// New revision to append. `revision_seq` is assigned by the database.
#[derive(Debug, Clone)]
pub struct NewObjectRevision {
    pub revision_id: Uuid,
    pub release_record_id: Uuid,
    pub object_type: String,
    pub object_key: String,
    pub object_hash: String,
    pub content_json: String,
    pub created_at: OffsetDateTime,
}

/// Current pointer for one object key.
#[derive(Debug, Clone, FromRow)]
pub struct PackObjectStateRow {
    pub object_key: String,
    pub object_type: String,
    /// Owning pack; only this pack may write the key.
    pub pack_code: String,
    pub current_revision_id: Uuid,
    pub current_hash: String,
    /// Domain entity id returned by the asset applier, if any.
    pub object_id: Option<String>,
    pub is_active: bool,
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Install lock
// =============================================================================

/// Lease row guarding installs/rollbacks for one lock key.
#[derive(Debug, Clone, FromRow)]
pub struct PackInstallLockRow {
    pub lock_key: String,
    pub lock_holder: Option<String>,
    pub lock_acquired_at: Option<OffsetDateTime>,
    pub lock_expires_at: Option<OffsetDateTime>,
}

impl PackInstallLockRow {
    /// Whether `holder` owns an unexpired lease at `now`.
    pub fn is_held_by(&self, holder: &str, now: OffsetDateTime) -> bool {
        self.lock_holder.as_deref() == Some(holder) && self.is_live(now)
    }

    /// Whether some holder owns an unexpired lease at `now`.
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        self.lock_holder.is_some() && self.lock_expires_at.is_some_and(|exp| exp > now)
    }
}

// =============================================================================
// Tenant configuration objects
// =============================================================================

/// Generic tenant configuration entity written by the document applier.
#[derive(Debug, Clone, FromRow)]
pub struct TenantConfigObjectRow {
    pub object_id: Uuid,
    pub object_type: String,
    pub object_code: String,
    pub pack_code: String,
    pub content_json: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}
