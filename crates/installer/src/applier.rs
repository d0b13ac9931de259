//! Asset applier contract and the type-tag registry.

use async_trait::async_trait;
use packyard_metadata::MetadataError;
use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by an asset applier.
#[derive(Debug, Error)]
pub enum ApplierError {
    #[error("{object_type} '{code}' is owned by pack {owner}")]
    OwnershipConflict {
        object_type: String,
        code: String,
        owner: String,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

/// Who is applying what, passed to every applier call.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    pub pack_code: String,
    pub release_id: String,
    pub actor_id: Option<String>,
    pub object_type: String,
    pub object_key: String,
    /// Domain entity id recorded for this object by an earlier apply.
    pub existing_object_id: Option<String>,
}

/// Applies one asset type's normalized payloads to the tenant's domain model.
///
/// Both methods run on the connection of the engine's open transaction and
/// must not begin or commit transactions of their own.
#[async_trait]
pub trait AssetApplier: Send + Sync {
    /// Create or update the domain entity for `payload`. Returns its id, if any.
    ///
    /// Must be idempotent for an identical payload and matching existing state.
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        payload: &Value,
        ctx: &ApplyContext,
    ) -> Result<Option<String>, ApplierError>;

    /// Mark the domain entity inactive. A missing entity is not an error.
    async fn deactivate(
        &self,
        conn: &mut SqliteConnection,
        payload: &Value,
        ctx: &ApplyContext,
    ) -> Result<(), ApplierError>;
}

/// Maps asset type tags to their applier.
#[derive(Clone, Default)]
pub struct ApplierRegistry {
    appliers: BTreeMap<String, Arc<dyn AssetApplier>>,
}

impl ApplierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in document applier bound to every standard type.
    pub fn with_document_appliers() -> Self {
        let applier: Arc<dyn AssetApplier> = Arc::new(crate::document::DocumentApplier::new());
        let mut registry = Self::new();
        for asset_type in packyard_core::STANDARD_ASSET_TYPES {
            registry.register(asset_type, applier.clone());
        }
        registry
    }

    /// Register (or replace) the applier for `asset_type`.
    pub fn register(&mut self, asset_type: impl Into<String>, applier: Arc<dyn AssetApplier>) {
        self.appliers.insert(asset_type.into(), applier);
    }

    pub fn get(&self, asset_type: &str) -> Option<Arc<dyn AssetApplier>> {
        self.appliers.get(asset_type).cloned()
    }

    pub fn contains(&self, asset_type: &str) -> bool {
        self.appliers.contains_key(asset_type)
    }

    /// Registered type tags in sorted order.
    pub fn asset_types(&self) -> impl Iterator<Item = &str> {
        self.appliers.keys().map(String::as_str)
    }
}
