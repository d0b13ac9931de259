//! Object revision and current-state repository (read side).
//!
//! Writes happen inside apply/rollback transactions through [`crate::ledger`].

use crate::error::MetadataResult;
use crate::models::{PackObjectRevisionRow, PackObjectStateRow};
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait ObjectRepo: Send + Sync {
    /// Current state for an object key.
    async fn get_object_state(&self, object_key: &str)
    -> MetadataResult<Option<PackObjectStateRow>>;

    /// All object states owned by a pack, ordered by key.
    async fn list_object_states(&self, pack_code: &str) -> MetadataResult<Vec<PackObjectStateRow>>;

    /// Revision history for an object key in creation order.
    async fn list_revisions(&self, object_key: &str) -> MetadataResult<Vec<PackObjectRevisionRow>>;

    /// Get a revision by id.
    async fn get_revision(&self, revision_id: Uuid)
    -> MetadataResult<Option<PackObjectRevisionRow>>;
}
