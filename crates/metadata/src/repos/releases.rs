//! Release ledger repository.

use crate::error::MetadataResult;
use crate::models::PackReleaseRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for release ledger operations.
#[async_trait]
pub trait ReleaseRepo: Send + Sync {
    /// Insert a release record (any status; skipped records are born terminal).
    async fn create_release(&self, release: &PackReleaseRow) -> MetadataResult<()>;

    /// Get a release record by id.
    async fn get_release(&self, release_record_id: Uuid) -> MetadataResult<Option<PackReleaseRow>>;

    /// Move an `applying` record to a terminal status.
    /// Returns `InvalidStateTransition` if the record is not `applying`.
    async fn complete_release(
        &self,
        release_record_id: Uuid,
        completion: &ReleaseCompletion,
    ) -> MetadataResult<()>;

    /// Most recent `applied` install record (not a rollback record) for
    /// `(pack_code, pack_release_id)`.
    async fn find_applied_release(
        &self,
        pack_code: &str,
        pack_release_id: &str,
    ) -> MetadataResult<Option<PackReleaseRow>>;

    /// Most recently completed `applied` install record for a pack.
    async fn latest_applied_release(&self, pack_code: &str)
    -> MetadataResult<Option<PackReleaseRow>>;

    /// List release records, newest first.
    async fn list_releases(&self, filter: &ReleaseFilter) -> MetadataResult<Vec<PackReleaseRow>>;
}

/// Terminal values written when a release attempt ends.
#[derive(Debug, Clone)]
pub struct ReleaseCompletion {
    pub status: ReleaseStatus,
    pub install_summary_json: Option<String>,
    pub warnings_json: String,
    pub error_message: Option<String>,
    pub completed_at: OffsetDateTime,
}

/// Listing filter for release records.
#[derive(Debug, Clone, Default)]
pub struct ReleaseFilter {
    pub pack_code: Option<String>,
    pub status: Option<ReleaseStatus>,
    pub limit: u32,
}

/// Release record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReleaseStatus {
    Applying,
    Applied,
    Skipped,
    Failed,
    RolledBack,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "applying" => Some(Self::Applying),
            "applied" => Some(Self::Applied),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }

    /// Terminal statuses never change, except `applied` → `rolled_back`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Applying)
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
