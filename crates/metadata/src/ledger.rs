//! Transaction-scoped ledger queries.
//!
//! Every function takes the connection of an already-open transaction so the
//! apply and rollback engines can stage revisions, state pointers and release
//! status changes atomically. The pool-level repositories reuse these for
//! their read paths.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{
    NewObjectRevision, PackInstallLockRow, PackObjectRevisionRow, PackObjectStateRow,
    PackReleaseRow, TenantConfigObjectRow,
};
use crate::repos::{ReleaseCompletion, ReleaseStatus};
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Releases
// =============================================================================

pub async fn get_release(
    conn: &mut SqliteConnection,
    release_record_id: Uuid,
) -> MetadataResult<Option<PackReleaseRow>> {
    let row = sqlx::query_as::<_, PackReleaseRow>(
        "SELECT * FROM pack_releases WHERE release_record_id = ?",
    )
    .bind(release_record_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Move an `applying` record to its terminal status.
pub async fn complete_release(
    conn: &mut SqliteConnection,
    release_record_id: Uuid,
    completion: &ReleaseCompletion,
) -> MetadataResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE pack_releases
        SET status = ?, install_summary_json = ?, warnings_json = ?,
            error_message = ?, completed_at = ?
        WHERE release_record_id = ? AND status = 'applying'
        "#,
    )
    .bind(completion.status.as_str())
    .bind(&completion.install_summary_json)
    .bind(&completion.warnings_json)
    .bind(&completion.error_message)
    .bind(completion.completed_at)
    .bind(release_record_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(match get_release(conn, release_record_id).await? {
            Some(existing) => MetadataError::InvalidStateTransition {
                from: existing.status,
                to: completion.status.as_str().to_string(),
            },
            None => MetadataError::NotFound(format!("release {release_record_id}")),
        });
    }
    Ok(())
}

/// Flip an `applied` record to `rolled_back`.
pub async fn mark_rolled_back(
    conn: &mut SqliteConnection,
    release_record_id: Uuid,
) -> MetadataResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE pack_releases SET status = 'rolled_back'
        WHERE release_record_id = ? AND status = 'applied'
        "#,
    )
    .bind(release_record_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(match get_release(conn, release_record_id).await? {
            Some(existing) => MetadataError::InvalidStateTransition {
                from: existing.status,
                to: ReleaseStatus::RolledBack.as_str().to_string(),
            },
            None => MetadataError::NotFound(format!("release {release_record_id}")),
        });
    }
    Ok(())
}

// =============================================================================
// Revisions
// =============================================================================

/// Append a revision. Revisions are never updated or deleted.
pub async fn insert_revision(
    conn: &mut SqliteConnection,
    revision: &NewObjectRevision,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO pack_object_revisions
            (revision_id, release_record_id, object_type, object_key, object_hash,
             content_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(revision.revision_id)
    .bind(revision.release_record_id)
    .bind(&revision.object_type)
    .bind(&revision.object_key)
    .bind(&revision.object_hash)
    .bind(&revision.content_json)
    .bind(revision.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_revision(
    conn: &mut SqliteConnection,
    revision_id: Uuid,
) -> MetadataResult<Option<PackObjectRevisionRow>> {
    let row = sqlx::query_as::<_, PackObjectRevisionRow>(
        "SELECT * FROM pack_object_revisions WHERE revision_id = ?",
    )
    .bind(revision_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Revisions written by one release, newest first.
pub async fn revisions_for_release(
    conn: &mut SqliteConnection,
    release_record_id: Uuid,
) -> MetadataResult<Vec<PackObjectRevisionRow>> {
    let rows = sqlx::query_as::<_, PackObjectRevisionRow>(
        r#"
        SELECT * FROM pack_object_revisions
        WHERE release_record_id = ?
        ORDER BY revision_seq DESC
        "#,
    )
    .bind(release_record_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Revision history for one key in creation order.
pub async fn revisions_for_key(
    conn: &mut SqliteConnection,
    object_key: &str,
) -> MetadataResult<Vec<PackObjectRevisionRow>> {
    let rows = sqlx::query_as::<_, PackObjectRevisionRow>(
        "SELECT * FROM pack_object_revisions WHERE object_key = ? ORDER BY revision_seq ASC",
    )
    .bind(object_key)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// The latest revision of `object_key` created before `before_seq` whose
/// release is still `applied`. Revisions of releases that have since been
/// rolled back are skipped so undone content is never restored.
pub async fn previous_live_revision(
    conn: &mut SqliteConnection,
    object_key: &str,
    before_seq: i64,
) -> MetadataResult<Option<PackObjectRevisionRow>> {
    let row = sqlx::query_as::<_, PackObjectRevisionRow>(
        r#"
        SELECT rev.* FROM pack_object_revisions rev
        INNER JOIN pack_releases rel ON rel.release_record_id = rev.release_record_id
        WHERE rev.object_key = ?
          AND rev.revision_seq < ?
          AND rel.status = 'applied'
        ORDER BY rev.revision_seq DESC
        LIMIT 1
        "#,
    )
    .bind(object_key)
    .bind(before_seq)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

// =============================================================================
// Object state
// =============================================================================

pub async fn get_object_state(
    conn: &mut SqliteConnection,
    object_key: &str,
) -> MetadataResult<Option<PackObjectStateRow>> {
    let row = sqlx::query_as::<_, PackObjectStateRow>(
        "SELECT * FROM pack_object_states WHERE object_key = ?",
    )
    .bind(object_key)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn list_object_states(
    conn: &mut SqliteConnection,
    pack_code: &str,
) -> MetadataResult<Vec<PackObjectStateRow>> {
    let rows = sqlx::query_as::<_, PackObjectStateRow>(
        "SELECT * FROM pack_object_states WHERE pack_code = ? ORDER BY object_key",
    )
    .bind(pack_code)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Insert or repoint the current state for an object key.
///
/// The update is conditional on the stored owner matching `state.pack_code`;
/// a mismatch surfaces as `AlreadyExists` so a concurrent claim by another
/// pack cannot be silently overwritten.
pub async fn upsert_object_state(
    conn: &mut SqliteConnection,
    state: &PackObjectStateRow,
) -> MetadataResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO pack_object_states
            (object_key, object_type, pack_code, current_revision_id, current_hash,
             object_id, is_active, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(object_key) DO UPDATE SET
            current_revision_id = excluded.current_revision_id,
            current_hash = excluded.current_hash,
            object_id = excluded.object_id,
            is_active = excluded.is_active,
            updated_at = excluded.updated_at
        WHERE pack_object_states.pack_code = excluded.pack_code
        "#,
    )
    .bind(&state.object_key)
    .bind(&state.object_type)
    .bind(&state.pack_code)
    .bind(state.current_revision_id)
    .bind(&state.current_hash)
    .bind(&state.object_id)
    .bind(state.is_active)
    .bind(state.updated_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(MetadataError::AlreadyExists(format!(
            "object {} is owned by another pack",
            state.object_key
        )));
    }
    Ok(())
}

/// Mark an object state inactive, keeping its pointer for audit.
pub async fn deactivate_object_state(
    conn: &mut SqliteConnection,
    object_key: &str,
    updated_at: OffsetDateTime,
) -> MetadataResult<()> {
    let result = sqlx::query(
        "UPDATE pack_object_states SET is_active = 0, updated_at = ? WHERE object_key = ?",
    )
    .bind(updated_at)
    .bind(object_key)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(MetadataError::NotFound(format!("object state {object_key}")));
    }
    Ok(())
}

// =============================================================================
// Locks
// =============================================================================

/// Read the lease row from inside a transaction (used as a commit fence).
pub async fn get_lock(
    conn: &mut SqliteConnection,
    lock_key: &str,
) -> MetadataResult<Option<PackInstallLockRow>> {
    let row = sqlx::query_as::<_, PackInstallLockRow>(
        "SELECT * FROM pack_install_locks WHERE lock_key = ?",
    )
    .bind(lock_key)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

// =============================================================================
// Tenant configuration objects
// =============================================================================

pub async fn get_config_object(
    conn: &mut SqliteConnection,
    object_id: Uuid,
) -> MetadataResult<Option<TenantConfigObjectRow>> {
    let row = sqlx::query_as::<_, TenantConfigObjectRow>(
        "SELECT * FROM tenant_config_objects WHERE object_id = ?",
    )
    .bind(object_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn find_config_object(
    conn: &mut SqliteConnection,
    object_type: &str,
    object_code: &str,
) -> MetadataResult<Option<TenantConfigObjectRow>> {
    let row = sqlx::query_as::<_, TenantConfigObjectRow>(
        "SELECT * FROM tenant_config_objects WHERE object_type = ? AND object_code = ?",
    )
    .bind(object_type)
    .bind(object_code)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn insert_config_object(
    conn: &mut SqliteConnection,
    object: &TenantConfigObjectRow,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tenant_config_objects
            (object_id, object_type, object_code, pack_code, content_json, is_active,
             created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(object.object_id)
    .bind(&object.object_type)
    .bind(&object.object_code)
    .bind(&object.pack_code)
    .bind(&object.content_json)
    .bind(object.is_active)
    .bind(object.created_at)
    .bind(object.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Replace content and reactivate an existing configuration object.
pub async fn update_config_object(
    conn: &mut SqliteConnection,
    object_id: Uuid,
    object_code: &str,
    content_json: &str,
    updated_at: OffsetDateTime,
) -> MetadataResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE tenant_config_objects
        SET object_code = ?, content_json = ?, is_active = 1, updated_at = ?
        WHERE object_id = ?
        "#,
    )
    .bind(object_code)
    .bind(content_json)
    .bind(updated_at)
    .bind(object_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(MetadataError::NotFound(format!("config object {object_id}")));
    }
    Ok(())
}

/// Returns whether a row was deactivated.
pub async fn deactivate_config_object(
    conn: &mut SqliteConnection,
    object_id: Uuid,
    updated_at: OffsetDateTime,
) -> MetadataResult<bool> {
    let result = sqlx::query(
        r#"
        UPDATE tenant_config_objects SET is_active = 0, updated_at = ?
        WHERE object_id = ? AND is_active = 1
        "#,
    )
    .bind(updated_at)
    .bind(object_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}
