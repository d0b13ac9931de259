//! Common test utilities and fixtures.

use packyard_metadata::models::{NewObjectRevision, PackObjectStateRow, PackReleaseRow};
use packyard_metadata::repos::ReleaseStatus;
use packyard_metadata::{MetadataResult, MetadataStore, SqliteStore};
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;
use uuid::Uuid;

/// A test metadata store wrapper that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn MetadataStore>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    db_path: Option<PathBuf>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    /// Create a new file-backed test store.
    #[allow(dead_code)]
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = Arc::new(SqliteStore::new(&db_path, None).await?);

        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            db_path: Some(db_path),
            _temp_dir: temp_dir,
        })
    }

    /// Create a new in-memory SQLite store (faster for tests).
    pub async fn in_memory() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let store = Arc::new(SqliteStore::in_memory().await?);

        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            db_path: None,
            _temp_dir: temp_dir,
        })
    }

    /// Open a second store on the same database file, as another process would.
    #[allow(dead_code)]
    pub async fn reopen(&self, busy_timeout: Duration) -> MetadataResult<SqliteStore> {
        let path = self
            .db_path
            .as_ref()
            .expect("reopen needs a file-backed store");
        SqliteStore::with_busy_timeout(path, None, busy_timeout).await
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Get a reference to the SQLite connection pool for raw queries.
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite_store.pool()
    }
}

/// A release record in the given status.
#[allow(dead_code)]
pub fn release_row(pack_code: &str, release_id: &str, status: ReleaseStatus) -> PackReleaseRow {
    let now = OffsetDateTime::now_utc();
    PackReleaseRow {
        release_record_id: Uuid::new_v4(),
        pack_code: pack_code.to_string(),
        pack_release_id: release_id.to_string(),
        status: status.as_str().to_string(),
        manifest_json: format!(r#"{{"code":"{pack_code}","release_id":"{release_id}"}}"#),
        artifact_sha256: Some("ab".repeat(32)),
        install_summary_json: None,
        warnings_json: "[]".to_string(),
        error_message: None,
        applied_by: None,
        applied_by_type: "system".to_string(),
        rollback_of_release_id: None,
        created_at: now,
        completed_at: status.is_terminal().then_some(now),
    }
}

#[allow(dead_code)]
pub fn revision(release_record_id: Uuid, object_key: &str, hash: &str) -> NewObjectRevision {
    let object_type = object_key.split(':').next().unwrap_or("metadata");
    NewObjectRevision {
        revision_id: Uuid::new_v4(),
        release_record_id,
        object_type: object_type.to_string(),
        object_key: object_key.to_string(),
        object_hash: hash.to_string(),
        content_json: format!(r#"{{"hash":"{hash}"}}"#),
        created_at: OffsetDateTime::now_utc(),
    }
}

#[allow(dead_code)]
pub fn state_for(revision: &NewObjectRevision, pack_code: &str) -> PackObjectStateRow {
    PackObjectStateRow {
        object_key: revision.object_key.clone(),
        object_type: revision.object_type.clone(),
        pack_code: pack_code.to_string(),
        current_revision_id: revision.revision_id,
        current_hash: revision.object_hash.clone(),
        object_id: None,
        is_active: true,
        updated_at: OffsetDateTime::now_utc(),
    }
}
