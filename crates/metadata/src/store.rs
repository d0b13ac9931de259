//! Metadata store trait and SQLite implementation.

use crate::error::MetadataResult;
use crate::repos::{ConfigObjectRepo, LockRepo, ObjectRepo, ReleaseRepo};
use async_trait::async_trait;
use packyard_core::config::DEFAULT_SQLITE_BUSY_TIMEOUT_MS;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: ReleaseRepo + LockRepo + ObjectRepo + ConfigObjectRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Open a write transaction for staging ledger changes.
    ///
    /// Callers must not touch the store's pool-level methods while holding the
    /// transaction; use [`crate::ledger`] with the transaction's connection.
    async fn begin(&self) -> MetadataResult<Transaction<'static, Sqlite>>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    query_timeout_secs: u64,
}

impl SqliteStore {
    /// Create a new SQLite store with the default busy timeout.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        Self::with_busy_timeout(
            path,
            query_timeout_secs,
            Duration::from_millis(DEFAULT_SQLITE_BUSY_TIMEOUT_MS),
        )
        .await
    }

    /// Create a new SQLite store whose writes wait at most `busy_timeout` for
    /// another connection's writer lock.
    pub async fn with_busy_timeout(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
        busy_timeout: Duration,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600);

        let in_memory = path.as_os_str() == ":memory:";
        if !in_memory {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path.display())
        };

        let mut opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(busy_timeout);
        if !in_memory {
            opts = opts
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers; it is also the only way an
            // in-memory database survives across acquisitions.
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(query_timeout_secs))
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            query_timeout_secs,
        };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs = store.query_timeout_secs,
            busy_timeout_ms = busy_timeout.as_millis() as u64,
            "Opened SQLite metadata store"
        );

        Ok(store)
    }

    /// Create a fresh in-memory store (used by tests and dry runs).
    pub async fn in_memory() -> MetadataResult<Self> {
        Self::new(":memory:", None).await
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin(&self) -> MetadataResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::error::MetadataError;
    use crate::ledger;
    use crate::models::*;
    use crate::repos::{LockAcquisition, ReleaseCompletion, ReleaseFilter};
    use packyard_core::effective_list_limit;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl ReleaseRepo for SqliteStore {
        async fn create_release(&self, release: &PackReleaseRow) -> MetadataResult<()> {
            let result = sqlx::query(
                r#"
                INSERT INTO pack_releases (
                    release_record_id, pack_code, pack_release_id, status, manifest_json,
                    artifact_sha256, install_summary_json, warnings_json, error_message,
                    applied_by, applied_by_type, rollback_of_release_id, created_at, completed_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(release.release_record_id)
            .bind(&release.pack_code)
            .bind(&release.pack_release_id)
            .bind(&release.status)
            .bind(&release.manifest_json)
            .bind(&release.artifact_sha256)
            .bind(&release.install_summary_json)
            .bind(&release.warnings_json)
            .bind(&release.error_message)
            .bind(&release.applied_by)
            .bind(&release.applied_by_type)
            .bind(release.rollback_of_release_id)
            .bind(release.created_at)
            .bind(release.completed_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    Err(MetadataError::AlreadyExists(format!(
                        "release record {} already exists",
                        release.release_record_id
                    )))
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn get_release(
            &self,
            release_record_id: Uuid,
        ) -> MetadataResult<Option<PackReleaseRow>> {
            let mut conn = self.pool.acquire().await?;
            ledger::get_release(&mut conn, release_record_id).await
        }

        async fn complete_release(
            &self,
            release_record_id: Uuid,
            completion: &ReleaseCompletion,
        ) -> MetadataResult<()> {
            let mut conn = self.pool.acquire().await?;
            ledger::complete_release(&mut conn, release_record_id, completion).await
        }

        async fn find_applied_release(
            &self,
            pack_code: &str,
            pack_release_id: &str,
        ) -> MetadataResult<Option<PackReleaseRow>> {
            let row = sqlx::query_as::<_, PackReleaseRow>(
                r#"
                SELECT * FROM pack_releases
                WHERE pack_code = ? AND pack_release_id = ? AND status = 'applied'
                  AND rollback_of_release_id IS NULL
                ORDER BY completed_at DESC, rowid DESC
                LIMIT 1
                "#,
            )
            .bind(pack_code)
            .bind(pack_release_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn latest_applied_release(
            &self,
            pack_code: &str,
        ) -> MetadataResult<Option<PackReleaseRow>> {
            let row = sqlx::query_as::<_, PackReleaseRow>(
                r#"
                SELECT * FROM pack_releases
                WHERE pack_code = ? AND status = 'applied' AND rollback_of_release_id IS NULL
                ORDER BY completed_at DESC, rowid DESC
                LIMIT 1
                "#,
            )
            .bind(pack_code)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_releases(
            &self,
            filter: &ReleaseFilter,
        ) -> MetadataResult<Vec<PackReleaseRow>> {
            let limit = effective_list_limit(filter.limit);
            let status = filter.status.map(|s| s.as_str());
            let rows = sqlx::query_as::<_, PackReleaseRow>(
                r#"
                SELECT * FROM pack_releases
                WHERE (?1 IS NULL OR pack_code = ?1)
                  AND (?2 IS NULL OR status = ?2)
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?3
                "#,
            )
            .bind(filter.pack_code.as_deref())
            .bind(status)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl LockRepo for SqliteStore {
        async fn try_acquire_lock(
            &self,
            lock_key: &str,
            holder: &str,
            now: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<LockAcquisition> {
            // The INSERT takes SQLite's writer lock before anything is read, so
            // two acquirers are serialized through the whole check-and-set.
            let mut tx = self.pool.begin().await?;

            let claim = sqlx::query(
                "INSERT INTO pack_install_locks (lock_key) VALUES (?) \
                 ON CONFLICT(lock_key) DO NOTHING",
            )
            .bind(lock_key)
            .execute(&mut *tx)
            .await;
            match claim {
                Ok(_) => {}
                // Another connection is mid-transaction; only lease holders write.
                Err(e) if is_busy(&e) => {
                    tx.rollback().await?;
                    return Ok(LockAcquisition::Busy);
                }
                Err(e) => return Err(e.into()),
            }

            let current = ledger::get_lock(&mut tx, lock_key)
                .await?
                .ok_or_else(|| MetadataError::Internal(format!("lock row {lock_key} vanished")))?;

            if current.is_live(now) {
                if let (Some(current_holder), Some(current_expiry)) =
                    (current.lock_holder.as_deref(), current.lock_expires_at)
                {
                    if current_holder != holder {
                        tx.rollback().await?;
                        return Ok(LockAcquisition::Held {
                            holder: current_holder.to_string(),
                            expires_at: current_expiry,
                        });
                    }
                }
            }

            let superseded = current
                .lock_holder
                .filter(|previous| previous != holder);

            sqlx::query(
                r#"
                UPDATE pack_install_locks
                SET lock_holder = ?, lock_acquired_at = ?, lock_expires_at = ?
                WHERE lock_key = ?
                "#,
            )
            .bind(holder)
            .bind(now)
            .bind(expires_at)
            .bind(lock_key)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(LockAcquisition::Acquired { superseded })
        }

        async fn release_lock(&self, lock_key: &str, holder: &str) -> MetadataResult<bool> {
            let result =
                sqlx::query("DELETE FROM pack_install_locks WHERE lock_key = ? AND lock_holder = ?")
                    .bind(lock_key)
                    .bind(holder)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn get_lock(&self, lock_key: &str) -> MetadataResult<Option<PackInstallLockRow>> {
            let mut conn = self.pool.acquire().await?;
            ledger::get_lock(&mut conn, lock_key).await
        }
    }

    /// SQLITE_BUSY or SQLITE_LOCKED, including their extended codes.
    fn is_busy(err: &sqlx::Error) -> bool {
        let sqlx::Error::Database(db) = err else {
            return false;
        };
        db.code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6))
    }

    #[async_trait]
    impl ObjectRepo for SqliteStore {
        async fn get_object_state(
            &self,
            object_key: &str,
        ) -> MetadataResult<Option<PackObjectStateRow>> {
            let mut conn = self.pool.acquire().await?;
            ledger::get_object_state(&mut conn, object_key).await
        }

        async fn list_object_states(
            &self,
            pack_code: &str,
        ) -> MetadataResult<Vec<PackObjectStateRow>> {
            let mut conn = self.pool.acquire().await?;
            ledger::list_object_states(&mut conn, pack_code).await
        }

        async fn list_revisions(
            &self,
            object_key: &str,
        ) -> MetadataResult<Vec<PackObjectRevisionRow>> {
            let mut conn = self.pool.acquire().await?;
            ledger::revisions_for_key(&mut conn, object_key).await
        }

        async fn get_revision(
            &self,
            revision_id: Uuid,
        ) -> MetadataResult<Option<PackObjectRevisionRow>> {
            let mut conn = self.pool.acquire().await?;
            ledger::get_revision(&mut conn, revision_id).await
        }
    }

    #[async_trait]
    impl ConfigObjectRepo for SqliteStore {
        async fn get_config_object(
            &self,
            object_id: Uuid,
        ) -> MetadataResult<Option<TenantConfigObjectRow>> {
            let mut conn = self.pool.acquire().await?;
            ledger::get_config_object(&mut conn, object_id).await
        }

        async fn find_config_object(
            &self,
            object_type: &str,
            object_code: &str,
        ) -> MetadataResult<Option<TenantConfigObjectRow>> {
            let mut conn = self.pool.acquire().await?;
            ledger::find_config_object(&mut conn, object_type, object_code).await
        }

        async fn list_config_objects(
            &self,
            pack_code: &str,
        ) -> MetadataResult<Vec<TenantConfigObjectRow>> {
            let rows = sqlx::query_as::<_, TenantConfigObjectRow>(
                r#"
                SELECT * FROM tenant_config_objects
                WHERE pack_code = ?
                ORDER BY object_type, object_code
                "#,
            )
            .bind(pack_code)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Release ledger: one row per install or rollback attempt
CREATE TABLE IF NOT EXISTS pack_releases (
    release_record_id BLOB PRIMARY KEY,
    pack_code TEXT NOT NULL,
    pack_release_id TEXT NOT NULL,
    status TEXT NOT NULL
        CHECK (status IN ('applying', 'applied', 'skipped', 'failed', 'rolled_back')),
    manifest_json TEXT NOT NULL,
    artifact_sha256 TEXT,
    install_summary_json TEXT,
    warnings_json TEXT NOT NULL DEFAULT '[]',
    error_message TEXT,
    applied_by TEXT,
    applied_by_type TEXT NOT NULL DEFAULT 'system',
    rollback_of_release_id BLOB REFERENCES pack_releases(release_record_id),
    created_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_pack_releases_pack ON pack_releases(pack_code, status);
CREATE INDEX IF NOT EXISTS idx_pack_releases_release ON pack_releases(pack_code, pack_release_id);
CREATE INDEX IF NOT EXISTS idx_pack_releases_created ON pack_releases(created_at);

-- Terminal statuses are final; the only permitted move out of one is applied -> rolled_back
CREATE TRIGGER IF NOT EXISTS trg_pack_releases_terminal
BEFORE UPDATE OF status ON pack_releases
WHEN OLD.status IN ('skipped', 'failed', 'rolled_back')
  OR (OLD.status = 'applied' AND NEW.status <> 'rolled_back')
BEGIN
    SELECT RAISE(ABORT, 'release record status is terminal');
END;

-- Append-only object revisions
CREATE TABLE IF NOT EXISTS pack_object_revisions (
    revision_seq INTEGER PRIMARY KEY AUTOINCREMENT,
    revision_id BLOB NOT NULL UNIQUE,
    release_record_id BLOB NOT NULL REFERENCES pack_releases(release_record_id),
    object_type TEXT NOT NULL,
    object_key TEXT NOT NULL,
    object_hash TEXT NOT NULL,
    content_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pack_object_revisions_key
    ON pack_object_revisions(object_key, revision_seq);
CREATE INDEX IF NOT EXISTS idx_pack_object_revisions_release
    ON pack_object_revisions(release_record_id, revision_seq);

CREATE TRIGGER IF NOT EXISTS trg_pack_object_revisions_no_update
BEFORE UPDATE ON pack_object_revisions
BEGIN
    SELECT RAISE(ABORT, 'pack_object_revisions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_pack_object_revisions_no_delete
BEFORE DELETE ON pack_object_revisions
BEGIN
    SELECT RAISE(ABORT, 'pack_object_revisions is append-only');
END;

-- Current pointer per object key
CREATE TABLE IF NOT EXISTS pack_object_states (
    object_key TEXT PRIMARY KEY,
    object_type TEXT NOT NULL,
    pack_code TEXT NOT NULL,
    current_revision_id BLOB NOT NULL REFERENCES pack_object_revisions(revision_id),
    current_hash TEXT NOT NULL,
    object_id TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pack_object_states_pack ON pack_object_states(pack_code);

-- Install lock leases
CREATE TABLE IF NOT EXISTS pack_install_locks (
    lock_key TEXT PRIMARY KEY,
    lock_holder TEXT,
    lock_acquired_at TEXT,
    lock_expires_at TEXT
);

-- Tenant configuration objects written by the document applier
CREATE TABLE IF NOT EXISTS tenant_config_objects (
    object_id BLOB PRIMARY KEY,
    object_type TEXT NOT NULL,
    object_code TEXT NOT NULL,
    pack_code TEXT NOT NULL,
    content_json TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(object_type, object_code)
);
CREATE INDEX IF NOT EXISTS idx_tenant_config_objects_pack ON tenant_config_objects(pack_code);
"#;
