//! Tenant configuration object repository (read side).

use crate::error::MetadataResult;
use crate::models::TenantConfigObjectRow;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait ConfigObjectRepo: Send + Sync {
    async fn get_config_object(&self, object_id: Uuid)
    -> MetadataResult<Option<TenantConfigObjectRow>>;

    async fn find_config_object(
        &self,
        object_type: &str,
        object_code: &str,
    ) -> MetadataResult<Option<TenantConfigObjectRow>>;

    /// Configuration objects owned by a pack, ordered by type then code.
    async fn list_config_objects(&self, pack_code: &str)
    -> MetadataResult<Vec<TenantConfigObjectRow>>;
}
