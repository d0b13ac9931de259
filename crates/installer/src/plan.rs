//! Preflight apply plan.

use crate::applier::ApplierRegistry;
use crate::artifact::PackArtifact;
use crate::error::{InstallError, InstallResult};
use crate::payload::normalize_payload;
use packyard_core::ContentHash;
use serde_json::Value;

/// One asset, ready to apply.
#[derive(Debug, Clone)]
pub struct PlannedAsset {
    pub asset_type: String,
    pub path: String,
    pub object_key: String,
    /// sha256 of the raw asset bytes.
    pub content_hash: String,
    pub payload: Value,
    /// `payload` serialized for the revision row.
    pub content_json: String,
}

/// Assets in apply order: by `install.apply_order`, then manifest order.
#[derive(Debug, Clone, Default)]
pub struct ApplyPlan {
    pub assets: Vec<PlannedAsset>,
}

impl ApplyPlan {
    /// Decode every asset up front so that unknown types and unreadable
    /// payloads fail before the lock is taken.
    pub fn build(artifact: &PackArtifact, registry: &ApplierRegistry) -> InstallResult<Self> {
        let mut assets = Vec::with_capacity(artifact.manifest.assets.len());
        for entry in artifact.manifest.assets_in_apply_order() {
            if !registry.contains(&entry.asset_type) {
                return Err(InstallError::UnsupportedAssetType(entry.asset_type.clone()));
            }
            let bytes = artifact.asset_bytes(&entry.path).ok_or_else(|| {
                InstallError::ArtifactFormat(format!("asset {} is missing", entry.path))
            })?;
            let payload = normalize_payload(&entry.asset_type, &entry.path, bytes)?;
            let content_json =
                serde_json::to_string(&payload).map_err(|e| InstallError::PayloadFormat {
                    path: entry.path.clone(),
                    message: e.to_string(),
                })?;

            assets.push(PlannedAsset {
                asset_type: entry.asset_type.clone(),
                path: entry.path.clone(),
                object_key: entry.object_key(),
                content_hash: ContentHash::compute(bytes).to_hex(),
                payload,
                content_json,
            });
        }
        Ok(Self { assets })
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}
