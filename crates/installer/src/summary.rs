//! Install and rollback summaries, and the printable release report.

use packyard_metadata::models::PackReleaseRow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// Per-type asset counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCounts {
    pub applied: usize,
    pub unchanged: usize,
}

/// Outcome counts stored on an install record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSummary {
    pub total_assets: usize,
    pub applied_assets: usize,
    pub unchanged_assets: usize,
    pub by_type: BTreeMap<String, TypeCounts>,
    /// Set when the release was already applied from identical bytes.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

impl InstallSummary {
    pub fn new(total_assets: usize) -> Self {
        Self {
            total_assets,
            ..Self::default()
        }
    }

    /// Summary for a skipped re-install: nothing was touched.
    pub fn skipped(total_assets: usize) -> Self {
        Self {
            total_assets,
            skipped: true,
            ..Self::default()
        }
    }

    pub fn record_applied(&mut self, asset_type: &str) {
        self.applied_assets += 1;
        self.by_type.entry(asset_type.to_string()).or_default().applied += 1;
    }

    pub fn record_unchanged(&mut self, asset_type: &str) {
        self.unchanged_assets += 1;
        self.by_type
            .entry(asset_type.to_string())
            .or_default()
            .unchanged += 1;
    }
}

/// Outcome counts stored on a rollback record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSummary {
    pub rollback_of: Uuid,
    pub total_objects: usize,
    pub restored_objects: usize,
    pub deactivated_objects: usize,
    /// Revisions already superseded by a later release.
    pub unchanged_objects: usize,
}

impl RollbackSummary {
    pub fn new(rollback_of: Uuid, total_objects: usize) -> Self {
        Self {
            rollback_of,
            total_objects,
            restored_objects: 0,
            deactivated_objects: 0,
            unchanged_objects: 0,
        }
    }
}

/// Result of [`crate::PackInstaller::install_pack`].
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub release: PackReleaseRow,
    pub summary: InstallSummary,
}

/// Result of [`crate::PackInstaller::rollback_pack`].
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub release: PackReleaseRow,
    pub summary: RollbackSummary,
}

/// Serializable view of a release record.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseReport {
    pub release_record_id: Uuid,
    pub pack_code: String,
    pub pack_release_id: String,
    pub status: String,
    pub artifact_sha256: Option<String>,
    pub install_summary: Option<Value>,
    pub warnings: Vec<String>,
    pub error_message: Option<String>,
    pub applied_by: Option<String>,
    pub applied_by_type: String,
    pub rollback_of_release_id: Option<Uuid>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl From<&PackReleaseRow> for ReleaseReport {
    fn from(row: &PackReleaseRow) -> Self {
        Self {
            release_record_id: row.release_record_id,
            pack_code: row.pack_code.clone(),
            pack_release_id: row.pack_release_id.clone(),
            status: row.status.clone(),
            artifact_sha256: row.artifact_sha256.clone(),
            install_summary: row
                .install_summary_json
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok()),
            warnings: row.warnings(),
            error_message: row.error_message.clone(),
            applied_by: row.applied_by.clone(),
            applied_by_type: row.applied_by_type.clone(),
            rollback_of_release_id: row.rollback_of_release_id,
            created_at: format_timestamp(row.created_at),
            completed_at: row.completed_at.map(format_timestamp),
        }
    }
}

fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = InstallSummary::new(3);
        summary.record_applied("views");
        summary.record_applied("metadata");
        summary.record_unchanged("views");

        assert_eq!(summary.applied_assets, 2);
        assert_eq!(summary.unchanged_assets, 1);
        assert_eq!(
            summary.by_type["views"],
            TypeCounts {
                applied: 1,
                unchanged: 1
            }
        );

        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("skipped").is_none());
        assert_eq!(json["total_assets"], 3);
    }
}
