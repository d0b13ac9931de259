//! Integration tests for the SQLite release ledger.

mod common;

use common::{TestMetadata, release_row, revision, state_for};
use packyard_metadata::MetadataError;
use packyard_metadata::ledger;
use packyard_metadata::repos::{
    LockAcquisition, LockRepo, ReleaseCompletion, ReleaseFilter, ReleaseStatus,
};
use time::{Duration, OffsetDateTime};

fn completion(status: ReleaseStatus) -> ReleaseCompletion {
    ReleaseCompletion {
        status,
        install_summary_json: Some("{}".to_string()),
        warnings_json: "[]".to_string(),
        error_message: None,
        completed_at: OffsetDateTime::now_utc(),
    }
}

#[tokio::test]
async fn test_release_lifecycle() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let release = release_row("crm", "20240601.001", ReleaseStatus::Applying);
    store.create_release(&release).await.unwrap();

    assert!(
        store
            .find_applied_release("crm", "20240601.001")
            .await
            .unwrap()
            .is_none()
    );

    store
        .complete_release(release.release_record_id, &completion(ReleaseStatus::Applied))
        .await
        .unwrap();

    let applied = store
        .find_applied_release("crm", "20240601.001")
        .await
        .unwrap()
        .expect("applied release");
    assert_eq!(applied.release_record_id, release.release_record_id);
    assert!(applied.completed_at.is_some());

    let latest = store.latest_applied_release("crm").await.unwrap().unwrap();
    assert_eq!(latest.release_record_id, release.release_record_id);
}

#[tokio::test]
async fn test_complete_release_rejects_non_applying() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let release = release_row("crm", "20240601.001", ReleaseStatus::Skipped);
    store.create_release(&release).await.unwrap();

    let err = store
        .complete_release(release.release_record_id, &completion(ReleaseStatus::Applied))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));

    let missing = store
        .complete_release(uuid::Uuid::new_v4(), &completion(ReleaseStatus::Failed))
        .await
        .unwrap_err();
    assert!(matches!(missing, MetadataError::NotFound(_)));
}

#[tokio::test]
async fn test_terminal_status_guard_in_schema() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let failed = release_row("crm", "20240601.001", ReleaseStatus::Failed);
    store.create_release(&failed).await.unwrap();

    let result =
        sqlx::query("UPDATE pack_releases SET status = 'applied' WHERE release_record_id = ?")
            .bind(failed.release_record_id)
            .execute(metadata.pool())
            .await;
    assert!(result.is_err(), "failed records must stay failed");

    let applied = release_row("crm", "20240601.002", ReleaseStatus::Applied);
    store.create_release(&applied).await.unwrap();

    let result =
        sqlx::query("UPDATE pack_releases SET status = 'failed' WHERE release_record_id = ?")
            .bind(applied.release_record_id)
            .execute(metadata.pool())
            .await;
    assert!(result.is_err(), "applied may only move to rolled_back");

    let mut tx = store.begin().await.unwrap();
    ledger::mark_rolled_back(&mut tx, applied.release_record_id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let row = store
        .get_release(applied.release_record_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "rolled_back");
}

#[tokio::test]
async fn test_revisions_are_append_only() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    let release = release_row("crm", "20240601.001", ReleaseStatus::Applying);
    store.create_release(&release).await.unwrap();

    let rev = revision(release.release_record_id, "views:views/home.yaml", "h1");
    let mut tx = store.begin().await.unwrap();
    ledger::insert_revision(&mut tx, &rev).await.unwrap();
    tx.commit().await.unwrap();

    let update = sqlx::query("UPDATE pack_object_revisions SET object_hash = 'x'")
        .execute(metadata.pool())
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM pack_object_revisions")
        .execute(metadata.pool())
        .await;
    assert!(delete.is_err());

    let stored = store.get_revision(rev.revision_id).await.unwrap().unwrap();
    assert_eq!(stored.object_hash, "h1");
}

#[tokio::test]
async fn test_previous_live_revision_skips_rolled_back_releases() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let key = "views:views/home.yaml";

    let first = release_row("crm", "20240601.001", ReleaseStatus::Applied);
    let second = release_row("crm", "20240601.002", ReleaseStatus::Applied);
    let third = release_row("crm", "20240601.003", ReleaseStatus::Applied);
    for release in [&first, &second, &third] {
        store.create_release(release).await.unwrap();
    }

    let mut tx = store.begin().await.unwrap();
    for (release, hash) in [(&first, "h1"), (&second, "h2"), (&third, "h3")] {
        ledger::insert_revision(&mut tx, &revision(release.release_record_id, key, hash))
            .await
            .unwrap();
    }
    ledger::mark_rolled_back(&mut tx, second.release_record_id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let history = store.list_revisions(key).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.windows(2).all(|w| w[0].revision_seq < w[1].revision_seq));

    let mut conn = metadata.pool().acquire().await.unwrap();
    let previous = ledger::previous_live_revision(&mut conn, key, history[2].revision_seq)
        .await
        .unwrap()
        .expect("first revision is still live");
    assert_eq!(previous.object_hash, "h1");

    let none = ledger::previous_live_revision(&mut conn, key, history[0].revision_seq)
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_object_state_ownership_guard() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let key = "access:access/roles.yaml";

    let release = release_row("crm", "20240601.001", ReleaseStatus::Applying);
    store.create_release(&release).await.unwrap();

    let rev = revision(release.release_record_id, key, "h1");
    let mut tx = store.begin().await.unwrap();
    ledger::insert_revision(&mut tx, &rev).await.unwrap();
    ledger::upsert_object_state(&mut tx, &state_for(&rev, "crm"))
        .await
        .unwrap();

    let err = ledger::upsert_object_state(&mut tx, &state_for(&rev, "billing"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists(_)));
    tx.commit().await.unwrap();

    let state = store.get_object_state(key).await.unwrap().unwrap();
    assert_eq!(state.pack_code, "crm");
    assert!(state.is_active);
}

#[tokio::test]
async fn test_lock_acquire_contend_and_release() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let now = OffsetDateTime::now_utc();
    let expires = now + Duration::minutes(10);

    let first = store
        .try_acquire_lock("pack:crm", "holder-a", now, expires)
        .await
        .unwrap();
    assert_eq!(first, LockAcquisition::Acquired { superseded: None });

    let second = store
        .try_acquire_lock("pack:crm", "holder-b", now, expires)
        .await
        .unwrap();
    match second {
        LockAcquisition::Held { holder, .. } => assert_eq!(holder, "holder-a"),
        other => panic!("expected contention, got {other:?}"),
    }

    // Only the owner can release.
    assert!(!store.release_lock("pack:crm", "holder-b").await.unwrap());
    assert!(store.release_lock("pack:crm", "holder-a").await.unwrap());
    assert!(store.get_lock("pack:crm").await.unwrap().is_none());

    let third = store
        .try_acquire_lock("pack:crm", "holder-b", now, expires)
        .await
        .unwrap();
    assert_eq!(third, LockAcquisition::Acquired { superseded: None });
}

#[tokio::test]
async fn test_lock_attempt_on_write_locked_store_is_busy() {
    let metadata = TestMetadata::new().await.unwrap();
    let other = metadata
        .reopen(std::time::Duration::from_millis(100))
        .await
        .unwrap();
    let now = OffsetDateTime::now_utc();
    let expires = now + Duration::minutes(10);

    // An open write transaction on the first connection, as during an apply.
    let mut tx = metadata.store.begin().await.unwrap();
    sqlx::query("INSERT INTO pack_install_locks (lock_key) VALUES ('pack:billing')")
        .execute(&mut *tx)
        .await
        .unwrap();

    let attempt = other
        .try_acquire_lock("pack:crm", "holder-b", now, expires)
        .await
        .unwrap();
    assert_eq!(attempt, LockAcquisition::Busy);
    assert!(other.get_lock("pack:crm").await.unwrap().is_none());

    tx.rollback().await.unwrap();
    let attempt = other
        .try_acquire_lock("pack:crm", "holder-b", now, expires)
        .await
        .unwrap();
    assert_eq!(attempt, LockAcquisition::Acquired { superseded: None });
}

#[tokio::test]
async fn test_expired_lock_is_reclaimed() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();
    let past = OffsetDateTime::now_utc() - Duration::hours(1);

    store
        .try_acquire_lock("pack:crm", "stale", past, past + Duration::minutes(1))
        .await
        .unwrap();

    let now = OffsetDateTime::now_utc();
    let outcome = store
        .try_acquire_lock("pack:crm", "fresh", now, now + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        LockAcquisition::Acquired {
            superseded: Some("stale".to_string())
        }
    );

    let lock = store.get_lock("pack:crm").await.unwrap().unwrap();
    assert!(lock.is_held_by("fresh", now));
}

#[tokio::test]
async fn test_list_releases_filters_and_limits() {
    let metadata = TestMetadata::in_memory().await.unwrap();
    let store = metadata.store();

    for seq in 1..=5 {
        let release = release_row("crm", &format!("20240601.{seq:03}"), ReleaseStatus::Applied);
        store.create_release(&release).await.unwrap();
    }
    store
        .create_release(&release_row("billing", "20240601.001", ReleaseStatus::Failed))
        .await
        .unwrap();

    let all = store.list_releases(&ReleaseFilter::default()).await.unwrap();
    assert_eq!(all.len(), 6);
    assert_eq!(all[0].pack_code, "billing", "newest first");

    let crm = store
        .list_releases(&ReleaseFilter {
            pack_code: Some("crm".to_string()),
            status: None,
            limit: 2,
        })
        .await
        .unwrap();
    assert_eq!(crm.len(), 2);
    assert_eq!(crm[0].pack_release_id, "20240601.005");

    let failed = store
        .list_releases(&ReleaseFilter {
            pack_code: None,
            status: Some(ReleaseStatus::Failed),
            limit: 0,
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].pack_code, "billing");
}

#[tokio::test]
async fn test_file_backed_store_persists() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    store.health_check().await.unwrap();
    store
        .create_release(&release_row("crm", "20240601.001", ReleaseStatus::Skipped))
        .await
        .unwrap();
    assert!(store.latest_applied_release("crm").await.unwrap().is_none());
}
