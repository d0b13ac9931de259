//! The rollback engine.
//!
//! Only the most recently applied install of a pack may be rolled back, so
//! undo history stays linear. Rolling back walks the target's revisions
//! newest first and restores, per object, the latest earlier revision whose
//! release is still applied, or deactivates the object when there is none.

use crate::applier::ApplyContext;
use crate::error::{InstallError, InstallResult};
use crate::installer::{PackInstaller, new_release_record, write_state};
use crate::lock::LockLease;
use crate::request::{RollbackRequest, RollbackTarget};
use crate::summary::{RollbackOutcome, RollbackSummary};
use packyard_core::PackManifest;
use packyard_metadata::MetadataError;
use packyard_metadata::ledger;
use packyard_metadata::models::{PackObjectStateRow, PackReleaseRow};
use packyard_metadata::repos::{ReleaseCompletion, ReleaseStatus};
use serde_json::Value;
use time::OffsetDateTime;

impl PackInstaller {
    /// Undo the most recently applied release of a pack.
    #[tracing::instrument(skip(self, request), fields(target = ?request.target))]
    pub async fn rollback_pack(&self, request: RollbackRequest) -> InstallResult<RollbackOutcome> {
        request.validate()?;

        let target = self.resolve_rollback_target(&request.target).await?;
        self.ensure_rollback_eligible(&target).await?;
        let manifest: PackManifest =
            serde_json::from_str(&target.manifest_json).map_err(MetadataError::from)?;

        let lease = self.lock.acquire(&manifest.lock_key()).await?;
        let result = self.rollback_locked(&request, &target, &lease).await;
        self.lock.release(&lease).await;
        result
    }

    async fn resolve_rollback_target(
        &self,
        target: &RollbackTarget,
    ) -> InstallResult<PackReleaseRow> {
        match target {
            RollbackTarget::Record(id) => self
                .store
                .get_release(*id)
                .await?
                .ok_or_else(|| InstallError::NotFound(format!("release record {id}"))),
            RollbackTarget::Release {
                pack_code,
                release_id,
            } => self
                .store
                .find_applied_release(pack_code, release_id)
                .await?
                .ok_or_else(|| {
                    InstallError::NotFound(format!("no applied release {pack_code}@{release_id}"))
                }),
        }
    }

    /// Linear undo: the target must be an applied install record and the
    /// latest applied release of its pack.
    async fn ensure_rollback_eligible(&self, target: &PackReleaseRow) -> InstallResult<()> {
        if target.is_rollback() {
            return Err(InstallError::Conflict(format!(
                "release record {} is itself a rollback",
                target.release_record_id
            )));
        }
        if target.status != ReleaseStatus::Applied.as_str() {
            return Err(InstallError::Conflict(format!(
                "release record {} is {}, only applied releases can be rolled back",
                target.release_record_id, target.status
            )));
        }
        let latest = self.store.latest_applied_release(&target.pack_code).await?;
        match latest {
            Some(latest) if latest.release_record_id == target.release_record_id => Ok(()),
            Some(latest) => Err(InstallError::Conflict(format!(
                "release {} of {} is not the latest applied release (latest is {})",
                target.pack_release_id, target.pack_code, latest.pack_release_id
            ))),
            None => Err(InstallError::Conflict(format!(
                "pack {} has no applied release",
                target.pack_code
            ))),
        }
    }

    async fn rollback_locked(
        &self,
        request: &RollbackRequest,
        target: &PackReleaseRow,
        lease: &LockLease,
    ) -> InstallResult<RollbackOutcome> {
        // Another rollback or install may have finished while we waited.
        let target = self
            .resolve_rollback_target(&RollbackTarget::Record(target.release_record_id))
            .await?;
        self.ensure_rollback_eligible(&target).await?;

        let record = new_release_record(
            &target.pack_code,
            &target.pack_release_id,
            target.manifest_json.clone(),
            None,
            &request.actor,
            Some(target.release_record_id),
        );
        self.store.create_release(&record).await?;
        tracing::info!(
            release_record_id = %record.release_record_id,
            rollback_of = %target.release_record_id,
            "Rollback applying"
        );

        match self.rollback_in_transaction(&record, &target, request, lease).await {
            Ok(summary) => {
                let release = self.get_release(record.release_record_id).await?;
                tracing::info!(
                    release_record_id = %record.release_record_id,
                    restored = summary.restored_objects,
                    deactivated = summary.deactivated_objects,
                    unchanged = summary.unchanged_objects,
                    "Rollback applied"
                );
                Ok(RollbackOutcome { release, summary })
            }
            Err(err) => {
                self.mark_failed(record.release_record_id, "[]", &err).await;
                Err(err)
            }
        }
    }

    async fn rollback_in_transaction(
        &self,
        record: &PackReleaseRow,
        target: &PackReleaseRow,
        request: &RollbackRequest,
        lease: &LockLease,
    ) -> InstallResult<RollbackSummary> {
        let mut tx = self.store.begin().await?;
        let revisions = ledger::revisions_for_release(&mut tx, target.release_record_id).await?;
        let mut summary = RollbackSummary::new(target.release_record_id, revisions.len());

        for revision in &revisions {
            self.check_deadline(lease)?;

            let state = ledger::get_object_state(&mut tx, &revision.object_key)
                .await?
                .filter(|s| s.current_revision_id == revision.revision_id);
            let Some(state) = state else {
                tracing::debug!(
                    object_key = %revision.object_key,
                    "Revision superseded; left as is"
                );
                summary.unchanged_objects += 1;
                continue;
            };

            let applier = self
                .registry
                .get(&revision.object_type)
                .ok_or_else(|| InstallError::UnsupportedAssetType(revision.object_type.clone()))?;
            let ctx = ApplyContext {
                pack_code: state.pack_code.clone(),
                release_id: target.pack_release_id.clone(),
                actor_id: request.actor.id.clone(),
                object_type: revision.object_type.clone(),
                object_key: revision.object_key.clone(),
                existing_object_id: state.object_id.clone(),
            };
            let now = OffsetDateTime::now_utc();

            let previous =
                ledger::previous_live_revision(&mut tx, &revision.object_key, revision.revision_seq)
                    .await?;
            match previous {
                Some(previous) => {
                    let payload = stored_payload(&previous.content_json)?;
                    let object_id = applier
                        .apply(&mut tx, &payload, &ctx)
                        .await
                        .map_err(|source| InstallError::Applier {
                            object_key: revision.object_key.clone(),
                            source,
                        })?;
                    let restored = PackObjectStateRow {
                        current_revision_id: previous.revision_id,
                        current_hash: previous.object_hash.clone(),
                        object_id: object_id.or(state.object_id.clone()),
                        is_active: true,
                        updated_at: now,
                        ..state
                    };
                    write_state(&mut tx, &restored).await?;
                    tracing::debug!(
                        object_key = %revision.object_key,
                        revision_id = %previous.revision_id,
                        "Restored previous revision"
                    );
                    summary.restored_objects += 1;
                }
                None => {
                    let payload = stored_payload(&revision.content_json)?;
                    applier
                        .deactivate(&mut tx, &payload, &ctx)
                        .await
                        .map_err(|source| InstallError::Applier {
                            object_key: revision.object_key.clone(),
                            source,
                        })?;
                    ledger::deactivate_object_state(&mut tx, &revision.object_key, now).await?;
                    tracing::debug!(object_key = %revision.object_key, "Deactivated object");
                    summary.deactivated_objects += 1;
                }
            }
        }

        self.check_deadline(lease)?;
        lease.fence(&mut tx).await?;

        let completion = ReleaseCompletion {
            status: ReleaseStatus::Applied,
            install_summary_json: Some(
                serde_json::to_string(&summary).map_err(MetadataError::from)?,
            ),
            warnings_json: "[]".to_string(),
            error_message: None,
            completed_at: OffsetDateTime::now_utc(),
        };
        ledger::complete_release(&mut tx, record.release_record_id, &completion).await?;
        ledger::mark_rolled_back(&mut tx, target.release_record_id).await?;
        tx.commit().await.map_err(MetadataError::from)?;
        Ok(summary)
    }
}

fn stored_payload(content_json: &str) -> InstallResult<Value> {
    Ok(serde_json::from_str(content_json).map_err(MetadataError::from)?)
}
