//! Common test utilities and fixtures.

#![allow(dead_code)]

use async_trait::async_trait;
use packyard_core::PackManifest;
use packyard_core::config::AppConfig;
use packyard_installer::{
    ApplierError, ApplierRegistry, ApplyContext, ArtifactLoader, AssetApplier, BundleBuilder,
    DocumentApplier, InstallOutcome, InstallRequest, InstallResult, InstallSettings,
    MemoryArtifactSource, PackInstaller,
};
use packyard_metadata::models::PackObjectStateRow;
use packyard_metadata::{MetadataStore, SqliteStore};
use packyard_signer::{KeyRing, PackSigner};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const KEY_ID: &str = "release-key-1";

static URL_COUNTER: AtomicU64 = AtomicU64::new(1);

/// An installer over a file-backed SQLite store and an in-memory artifact source.
pub struct TestEnv {
    pub store: Arc<dyn MetadataStore>,
    pub sqlite: Arc<SqliteStore>,
    pub source: Arc<MemoryArtifactSource>,
    pub signer: PackSigner,
    pub installer: PackInstaller,
    keys: KeyRing,
    db_path: PathBuf,
    _temp_dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::build(ApplierRegistry::with_document_appliers(), None).await
    }

    pub async fn with_registry(registry: ApplierRegistry) -> Self {
        Self::build(registry, None).await
    }

    pub async fn with_max_apply(registry: ApplierRegistry, max_apply: Duration) -> Self {
        Self::build(registry, Some(max_apply)).await
    }

    async fn build(registry: ApplierRegistry, max_apply: Option<Duration>) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("packyard.db");
        let sqlite = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to open store"),
        );
        let store: Arc<dyn MetadataStore> = sqlite.clone();

        let signer = PackSigner::generate(KEY_ID);
        let mut keys = KeyRing::new();
        keys.insert(KEY_ID, signer.public_key().clone());

        let source = Arc::new(MemoryArtifactSource::new());
        let mut settings = InstallSettings::from_config(&AppConfig::for_testing());
        if let Some(max_apply) = max_apply {
            settings.max_apply = max_apply;
        }
        let installer = PackInstaller::new(
            store.clone(),
            ArtifactLoader::new(source.clone(), keys.clone()),
            registry,
            settings,
        );

        Self {
            store,
            sqlite,
            source,
            signer,
            installer,
            keys,
            db_path,
            _temp_dir: temp_dir,
        }
    }

    /// An installer with its own store on the same database file, standing in
    /// for a second process. It sees the same bundles and keys.
    pub async fn peer_installer(&self, busy_timeout: Duration) -> PackInstaller {
        let store = SqliteStore::with_busy_timeout(&self.db_path, None, busy_timeout)
            .await
            .expect("Failed to open second store");
        PackInstaller::new(
            Arc::new(store),
            ArtifactLoader::new(self.source.clone(), self.keys.clone()),
            ApplierRegistry::with_document_appliers(),
            InstallSettings::from_config(&AppConfig::for_testing()),
        )
    }

    /// Build, sign and publish a fixture; returns its URL.
    pub async fn publish(&self, pack: &PackFixture) -> String {
        let bytes = pack.bundle(&self.signer);
        self.publish_bytes(bytes).await
    }

    pub async fn publish_bytes(&self, bytes: Vec<u8>) -> String {
        let n = URL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let url = format!("mem://bundles/{n}.zip");
        self.source.insert(url.clone(), bytes).await;
        url
    }

    pub async fn install(&self, pack: &PackFixture) -> InstallResult<InstallOutcome> {
        let url = self.publish(pack).await;
        self.installer.install_pack(pack.request(&url)).await
    }

    pub async fn object_state(&self, object_key: &str) -> Option<PackObjectStateRow> {
        self.store.get_object_state(object_key).await.unwrap()
    }

    pub async fn release_count(&self) -> usize {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pack_releases")
            .fetch_one(self.sqlite.pool())
            .await
            .unwrap() as usize
    }

    pub async fn state_count(&self) -> usize {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pack_object_states")
            .fetch_one(self.sqlite.pool())
            .await
            .unwrap() as usize
    }
}

/// Declarative pack used to build bundles.
#[derive(Clone, Debug)]
pub struct PackFixture {
    pub code: String,
    pub release_id: String,
    pub apply_order: Vec<String>,
    pub assets: Vec<(String, String, String)>,
    pub dependencies: Vec<(String, String)>,
    pub platform_min: Option<String>,
    pub platform_max: Option<String>,
    pub lock_key: Option<String>,
    pub key_id: String,
}

impl PackFixture {
    pub fn new(code: &str, release_id: &str) -> Self {
        Self {
            code: code.to_string(),
            release_id: release_id.to_string(),
            apply_order: ["metadata", "views", "automation"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            assets: Vec::new(),
            dependencies: Vec::new(),
            platform_min: None,
            platform_max: None,
            lock_key: None,
            key_id: KEY_ID.to_string(),
        }
    }

    /// Add an asset of `asset_type` at `path` with `content`.
    pub fn asset(mut self, asset_type: &str, path: &str, content: &str) -> Self {
        self.assets
            .push((asset_type.to_string(), path.to_string(), content.to_string()));
        self
    }

    pub fn depends_on(mut self, code: &str, min_release_id: &str) -> Self {
        self.dependencies
            .push((code.to_string(), min_release_id.to_string()));
        self
    }

    pub fn platform(mut self, min: Option<&str>, max: Option<&str>) -> Self {
        self.platform_min = min.map(str::to_string);
        self.platform_max = max.map(str::to_string);
        self
    }

    pub fn lock_key(mut self, key: &str) -> Self {
        self.lock_key = Some(key.to_string());
        self
    }

    pub fn apply_order(mut self, order: &[&str]) -> Self {
        self.apply_order = order.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn manifest(&self) -> PackManifest {
        let mut doc = serde_json::json!({
            "code": self.code,
            "release_id": self.release_id,
            "signing": { "public_key_id": self.key_id },
            "install": { "apply_order": self.apply_order },
            "dependencies": self.dependencies.iter().map(|(code, min)| {
                serde_json::json!({ "code": code, "min_release_id": min })
            }).collect::<Vec<_>>(),
            "assets": self.assets.iter().map(|(ty, path, _)| {
                serde_json::json!({ "type": ty, "path": path, "sha256": "" })
            }).collect::<Vec<_>>(),
        });
        if let Some(min) = &self.platform_min {
            doc["platform_min_release_id"] = Value::String(min.clone());
        }
        if let Some(max) = &self.platform_max {
            doc["platform_max_release_id"] = Value::String(max.clone());
        }
        if let Some(key) = &self.lock_key {
            doc["install"]["lock_key"] = Value::String(key.clone());
        }
        serde_json::from_value(doc).expect("fixture manifest")
    }

    pub fn builder(&self) -> BundleBuilder {
        self.assets
            .iter()
            .fold(BundleBuilder::new(self.manifest()), |b, (_, path, content)| {
                b.asset(path.clone(), content.clone())
            })
    }

    pub fn bundle(&self, signer: &PackSigner) -> Vec<u8> {
        self.builder().build(signer).expect("bundle builds")
    }

    pub fn request(&self, url: &str) -> InstallRequest {
        InstallRequest::new(&self.code, &self.release_id, url)
    }
}

/// Document applier that fails for one object key.
pub struct FailingApplier {
    pub fail_on: String,
}

#[async_trait]
impl AssetApplier for FailingApplier {
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        payload: &Value,
        ctx: &ApplyContext,
    ) -> Result<Option<String>, ApplierError> {
        if ctx.object_key == self.fail_on {
            return Err(ApplierError::Other(format!("forced failure on {}", ctx.object_key)));
        }
        DocumentApplier::new().apply(conn, payload, ctx).await
    }

    async fn deactivate(
        &self,
        conn: &mut SqliteConnection,
        payload: &Value,
        ctx: &ApplyContext,
    ) -> Result<(), ApplierError> {
        DocumentApplier::new().deactivate(conn, payload, ctx).await
    }
}

/// Document applier that sleeps before every apply.
pub struct SlowApplier {
    pub delay: Duration,
}

#[async_trait]
impl AssetApplier for SlowApplier {
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        payload: &Value,
        ctx: &ApplyContext,
    ) -> Result<Option<String>, ApplierError> {
        tokio::time::sleep(self.delay).await;
        DocumentApplier::new().apply(conn, payload, ctx).await
    }

    async fn deactivate(
        &self,
        conn: &mut SqliteConnection,
        payload: &Value,
        ctx: &ApplyContext,
    ) -> Result<(), ApplierError> {
        DocumentApplier::new().deactivate(conn, payload, ctx).await
    }
}

/// Registry with document appliers everywhere except `asset_type`.
pub fn registry_with(asset_type: &str, applier: Arc<dyn AssetApplier>) -> ApplierRegistry {
    let mut registry = ApplierRegistry::with_document_appliers();
    registry.register(asset_type, applier);
    registry
}
