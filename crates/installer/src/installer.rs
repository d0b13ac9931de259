//! The apply engine.

use crate::applier::{ApplierRegistry, ApplyContext};
use crate::artifact::{ArtifactLoader, HttpArtifactSource, PackArtifact};
use crate::compat::{assert_compatibility, assert_dependencies};
use crate::error::{InstallError, InstallResult};
use crate::lock::{InstallLock, LockLease};
use crate::plan::ApplyPlan;
use crate::request::{Actor, InstallRequest};
use crate::summary::{InstallOutcome, InstallSummary};
use packyard_core::config::AppConfig;
use packyard_metadata::ledger;
use packyard_metadata::models::{NewObjectRevision, PackObjectStateRow, PackReleaseRow};
use packyard_metadata::repos::{ReleaseCompletion, ReleaseFilter, ReleaseStatus};
use packyard_metadata::{MetadataError, MetadataStore};
use packyard_signer::KeyRing;
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Engine settings derived from configuration.
#[derive(Debug, Clone)]
pub struct InstallSettings {
    /// Current platform release, checked against manifest ranges.
    pub platform_release_id: String,
    pub lock_ttl: Duration,
    /// Apply/rollback loops abort once a lease has been held this long.
    pub max_apply: Duration,
}

impl InstallSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            platform_release_id: config.platform.release_id.clone(),
            lock_ttl: config.install.lock_ttl(),
            max_apply: config.install.max_apply_duration(),
        }
    }
}

/// Installs and rolls back pack releases against a metadata store.
pub struct PackInstaller {
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) loader: ArtifactLoader,
    pub(crate) registry: ApplierRegistry,
    pub(crate) lock: InstallLock,
    pub(crate) settings: InstallSettings,
}

impl PackInstaller {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        loader: ArtifactLoader,
        registry: ApplierRegistry,
        settings: InstallSettings,
    ) -> Self {
        let lock = InstallLock::new(store.clone(), settings.lock_ttl);
        Self {
            store,
            loader,
            registry,
            lock,
            settings,
        }
    }

    /// Build an installer with an HTTP artifact source, the configured key
    /// ring and the built-in document appliers.
    pub fn from_config(config: &AppConfig, store: Arc<dyn MetadataStore>) -> InstallResult<Self> {
        config
            .validate()
            .map_err(|e| InstallError::InvalidRequest(e.to_string()))?;
        let keys = KeyRing::from_base64_map(&config.signing.public_keys)
            .map_err(|e| InstallError::InvalidRequest(format!("signing.public_keys: {e}")))?;
        tracing::debug!(keys = keys.len(), "Loaded pack signing keys");
        let source = Arc::new(HttpArtifactSource::new(config.install.artifact_timeout())?);

        Ok(Self::new(
            store,
            ArtifactLoader::new(source, keys)
                .with_max_extracted_bytes(config.install.max_extracted_bytes),
            ApplierRegistry::with_document_appliers(),
            InstallSettings::from_config(config),
        ))
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn settings(&self) -> &InstallSettings {
        &self.settings
    }

    /// List release records, newest first.
    pub async fn list_releases(
        &self,
        filter: &ReleaseFilter,
    ) -> InstallResult<Vec<PackReleaseRow>> {
        Ok(self.store.list_releases(filter).await?)
    }

    pub async fn get_release(&self, release_record_id: Uuid) -> InstallResult<PackReleaseRow> {
        self.store
            .get_release(release_record_id)
            .await?
            .ok_or_else(|| InstallError::NotFound(format!("release record {release_record_id}")))
    }

    /// Verify, lock and apply one pack release.
    ///
    /// Validation, trust, compatibility and contention failures happen before
    /// any release record exists. Failures after the `applying` record is
    /// written leave it `failed` with the error message.
    #[tracing::instrument(
        skip(self, request),
        fields(pack = %request.pack_code, release = %request.release_id)
    )]
    pub async fn install_pack(&self, request: InstallRequest) -> InstallResult<InstallOutcome> {
        request.validate()?;

        let artifact = self.loader.load(&request.artifact_url).await?;
        request.check_identity(&artifact.manifest)?;
        assert_compatibility(&artifact.manifest, &self.settings.platform_release_id)?;
        assert_dependencies(self.store.as_ref(), &artifact.manifest).await?;
        let plan = ApplyPlan::build(&artifact, &self.registry)?;

        let lease = self.lock.acquire(&artifact.manifest.lock_key()).await?;
        let result = self.install_locked(&request, &artifact, &plan, &lease).await;
        self.lock.release(&lease).await;
        result
    }

    async fn install_locked(
        &self,
        request: &InstallRequest,
        artifact: &PackArtifact,
        plan: &ApplyPlan,
        lease: &LockLease,
    ) -> InstallResult<InstallOutcome> {
        let manifest = &artifact.manifest;
        let manifest_json = serde_json::to_string(manifest).map_err(MetadataError::from)?;
        let mut warnings = Vec::new();

        if let Some(previous) = self
            .store
            .find_applied_release(&manifest.code, &manifest.release_id)
            .await?
        {
            if previous.artifact_sha256.as_deref() == Some(artifact.artifact_sha256.as_str()) {
                return self
                    .record_skipped(request, artifact, &manifest_json, &previous)
                    .await;
            }
            warnings.push(format!(
                "release {} was previously applied from artifact {} (record {}); \
                 now applying artifact {}",
                manifest.release_id,
                previous.artifact_sha256.as_deref().unwrap_or("unknown"),
                previous.release_record_id,
                artifact.artifact_sha256
            ));
        }

        let warnings_json = serde_json::to_string(&warnings).map_err(MetadataError::from)?;
        let record = new_release_record(
            &manifest.code,
            &manifest.release_id,
            manifest_json,
            Some(artifact.artifact_sha256.clone()),
            &request.actor,
            None,
        );
        self.store.create_release(&record).await?;
        tracing::info!(
            release_record_id = %record.release_record_id,
            assets = plan.len(),
            "Release applying"
        );

        match self
            .apply_plan(&record, request, plan, lease, &warnings_json)
            .await
        {
            Ok(summary) => {
                let release = self.get_release(record.release_record_id).await?;
                tracing::info!(
                    release_record_id = %record.release_record_id,
                    applied = summary.applied_assets,
                    unchanged = summary.unchanged_assets,
                    "Release applied"
                );
                Ok(InstallOutcome { release, summary })
            }
            Err(err) => {
                self.mark_failed(record.release_record_id, &warnings_json, &err)
                    .await;
                Err(err)
            }
        }
    }

    async fn record_skipped(
        &self,
        request: &InstallRequest,
        artifact: &PackArtifact,
        manifest_json: &str,
        previous: &PackReleaseRow,
    ) -> InstallResult<InstallOutcome> {
        let summary = InstallSummary::skipped(artifact.manifest.assets.len());
        let mut record = new_release_record(
            &artifact.manifest.code,
            &artifact.manifest.release_id,
            manifest_json.to_string(),
            Some(artifact.artifact_sha256.clone()),
            &request.actor,
            None,
        );
        record.status = ReleaseStatus::Skipped.as_str().to_string();
        record.install_summary_json =
            Some(serde_json::to_string(&summary).map_err(MetadataError::from)?);
        record.completed_at = Some(record.created_at);
        self.store.create_release(&record).await?;

        tracing::info!(
            release_record_id = %record.release_record_id,
            applied_record_id = %previous.release_record_id,
            "Release already applied from identical artifact; skipped"
        );
        Ok(InstallOutcome {
            release: record,
            summary,
        })
    }

    /// Apply every planned asset in one transaction and mark the record
    /// `applied` in that same transaction.
    async fn apply_plan(
        &self,
        record: &PackReleaseRow,
        request: &InstallRequest,
        plan: &ApplyPlan,
        lease: &LockLease,
        warnings_json: &str,
    ) -> InstallResult<InstallSummary> {
        let pack_code = record.pack_code.as_str();
        let mut summary = InstallSummary::new(plan.len());
        let mut tx = self.store.begin().await?;

        for asset in &plan.assets {
            self.check_deadline(lease)?;

            let state = ledger::get_object_state(&mut tx, &asset.object_key).await?;
            if let Some(state) = &state {
                if state.pack_code != pack_code {
                    return Err(InstallError::OwnershipConflict {
                        object_key: asset.object_key.clone(),
                        owner: state.pack_code.clone(),
                    });
                }
                if state.is_active && state.current_hash == asset.content_hash {
                    tracing::debug!(object_key = %asset.object_key, "Asset unchanged");
                    summary.record_unchanged(&asset.asset_type);
                    continue;
                }
            }

            let applier = self
                .registry
                .get(&asset.asset_type)
                .ok_or_else(|| InstallError::UnsupportedAssetType(asset.asset_type.clone()))?;

            let now = OffsetDateTime::now_utc();
            let revision = NewObjectRevision {
                revision_id: Uuid::new_v4(),
                release_record_id: record.release_record_id,
                object_type: asset.asset_type.clone(),
                object_key: asset.object_key.clone(),
                object_hash: asset.content_hash.clone(),
                content_json: asset.content_json.clone(),
                created_at: now,
            };
            ledger::insert_revision(&mut tx, &revision).await?;

            let existing_object_id = state.as_ref().and_then(|s| s.object_id.clone());
            let ctx = ApplyContext {
                pack_code: pack_code.to_string(),
                release_id: record.pack_release_id.clone(),
                actor_id: request.actor.id.clone(),
                object_type: asset.asset_type.clone(),
                object_key: asset.object_key.clone(),
                existing_object_id: existing_object_id.clone(),
            };
            let object_id = applier
                .apply(&mut tx, &asset.payload, &ctx)
                .await
                .map_err(|source| InstallError::Applier {
                    object_key: asset.object_key.clone(),
                    source,
                })?;

            let next = PackObjectStateRow {
                object_key: asset.object_key.clone(),
                object_type: asset.asset_type.clone(),
                pack_code: pack_code.to_string(),
                current_revision_id: revision.revision_id,
                current_hash: asset.content_hash.clone(),
                object_id: object_id.or(existing_object_id),
                is_active: true,
                updated_at: now,
            };
            write_state(&mut tx, &next).await?;

            tracing::debug!(
                object_key = %asset.object_key,
                revision_id = %revision.revision_id,
                "Asset applied"
            );
            summary.record_applied(&asset.asset_type);
        }

        self.check_deadline(lease)?;
        lease.fence(&mut tx).await?;

        let completion = ReleaseCompletion {
            status: ReleaseStatus::Applied,
            install_summary_json: Some(
                serde_json::to_string(&summary).map_err(MetadataError::from)?,
            ),
            warnings_json: warnings_json.to_string(),
            error_message: None,
            completed_at: OffsetDateTime::now_utc(),
        };
        ledger::complete_release(&mut tx, record.release_record_id, &completion).await?;
        tx.commit().await.map_err(MetadataError::from)?;
        Ok(summary)
    }

    /// Abort once the lease has been held longer than the apply bound.
    pub(crate) fn check_deadline(&self, lease: &LockLease) -> InstallResult<()> {
        let elapsed = lease.elapsed();
        if elapsed > self.settings.max_apply {
            return Err(InstallError::LeaseLost(format!(
                "held lock {} for {}ms, limit is {}ms",
                lease.lock_key,
                elapsed.as_millis(),
                self.settings.max_apply.as_millis()
            )));
        }
        Ok(())
    }

    /// Move an `applying` record to `failed`. The transaction has already been
    /// rolled back, so this goes through the pool.
    pub(crate) async fn mark_failed(
        &self,
        release_record_id: Uuid,
        warnings_json: &str,
        error: &InstallError,
    ) {
        let completion = ReleaseCompletion {
            status: ReleaseStatus::Failed,
            install_summary_json: None,
            warnings_json: warnings_json.to_string(),
            error_message: Some(error.to_string()),
            completed_at: OffsetDateTime::now_utc(),
        };
        tracing::warn!(
            release_record_id = %release_record_id,
            code = error.code(),
            error = %error,
            "Release failed"
        );
        if let Err(e) = self
            .store
            .complete_release(release_record_id, &completion)
            .await
        {
            tracing::error!(
                release_record_id = %release_record_id,
                error = %e,
                "Failed to record release failure"
            );
        }
    }
}

/// Upsert an object state, reporting a foreign owner as an ownership conflict.
pub(crate) async fn write_state(
    conn: &mut SqliteConnection,
    state: &PackObjectStateRow,
) -> InstallResult<()> {
    match ledger::upsert_object_state(conn, state).await {
        Ok(()) => Ok(()),
        Err(MetadataError::AlreadyExists(_)) => {
            let owner = ledger::get_object_state(conn, &state.object_key)
                .await?
                .map(|s| s.pack_code)
                .unwrap_or_default();
            Err(InstallError::OwnershipConflict {
                object_key: state.object_key.clone(),
                owner,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// A fresh `applying` release record.
pub(crate) fn new_release_record(
    pack_code: &str,
    pack_release_id: &str,
    manifest_json: String,
    artifact_sha256: Option<String>,
    actor: &Actor,
    rollback_of_release_id: Option<Uuid>,
) -> PackReleaseRow {
    PackReleaseRow {
        release_record_id: Uuid::new_v4(),
        pack_code: pack_code.to_string(),
        pack_release_id: pack_release_id.to_string(),
        status: ReleaseStatus::Applying.as_str().to_string(),
        manifest_json,
        artifact_sha256,
        install_summary_json: None,
        warnings_json: "[]".to_string(),
        error_message: None,
        applied_by: actor.id.clone(),
        applied_by_type: actor.kind.as_str().to_string(),
        rollback_of_release_id,
        created_at: OffsetDateTime::now_utc(),
        completed_at: None,
    }
}
