//! Built-in applier storing payloads as tenant configuration documents.

use crate::applier::{ApplierError, ApplyContext, AssetApplier};
use async_trait::async_trait;
use packyard_metadata::ledger;
use packyard_metadata::models::TenantConfigObjectRow;
use serde_json::Value;
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use uuid::Uuid;

/// Stores each payload in `tenant_config_objects`, keyed by
/// `(object_type, object_code)`.
///
/// The object code is the payload's `code` field, falling back to the
/// object key. A code owned by another pack is an ownership conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentApplier;

impl DocumentApplier {
    pub fn new() -> Self {
        Self
    }

    fn object_code(payload: &Value, ctx: &ApplyContext) -> String {
        payload
            .get("code")
            .and_then(Value::as_str)
            .filter(|code| !code.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| ctx.object_key.clone())
    }

    async fn locate(
        conn: &mut SqliteConnection,
        ctx: &ApplyContext,
        code: &str,
    ) -> Result<Option<TenantConfigObjectRow>, ApplierError> {
        let known_id = ctx
            .existing_object_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok());
        if let Some(id) = known_id {
            if let Some(row) = ledger::get_config_object(conn, id).await? {
                return Ok(Some(row));
            }
        }
        Ok(ledger::find_config_object(conn, &ctx.object_type, code).await?)
    }

    fn ensure_owner(row: &TenantConfigObjectRow, ctx: &ApplyContext) -> Result<(), ApplierError> {
        if row.pack_code != ctx.pack_code {
            return Err(ApplierError::OwnershipConflict {
                object_type: row.object_type.clone(),
                code: row.object_code.clone(),
                owner: row.pack_code.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AssetApplier for DocumentApplier {
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        payload: &Value,
        ctx: &ApplyContext,
    ) -> Result<Option<String>, ApplierError> {
        let code = Self::object_code(payload, ctx);
        let content_json = serde_json::to_string(payload)
            .map_err(|e| ApplierError::InvalidPayload(e.to_string()))?;
        let now = OffsetDateTime::now_utc();

        match Self::locate(conn, ctx, &code).await? {
            Some(existing) => {
                Self::ensure_owner(&existing, ctx)?;
                if existing.is_active
                    && existing.object_code == code
                    && existing.content_json == content_json
                {
                    return Ok(Some(existing.object_id.to_string()));
                }
                if existing.object_code != code {
                    // Renaming onto a code held by someone else must not steal it.
                    if let Some(other) =
                        ledger::find_config_object(conn, &ctx.object_type, &code).await?
                    {
                        Self::ensure_owner(&other, ctx)?;
                    }
                }
                ledger::update_config_object(conn, existing.object_id, &code, &content_json, now)
                    .await?;
                tracing::debug!(
                    object_type = %ctx.object_type,
                    code = %code,
                    object_id = %existing.object_id,
                    "Updated configuration object"
                );
                Ok(Some(existing.object_id.to_string()))
            }
            None => {
                let row = TenantConfigObjectRow {
                    object_id: Uuid::new_v4(),
                    object_type: ctx.object_type.clone(),
                    object_code: code,
                    pack_code: ctx.pack_code.clone(),
                    content_json,
                    is_active: true,
                    created_at: now,
                    updated_at: now,
                };
                ledger::insert_config_object(conn, &row).await?;
                tracing::debug!(
                    object_type = %row.object_type,
                    code = %row.object_code,
                    object_id = %row.object_id,
                    "Created configuration object"
                );
                Ok(Some(row.object_id.to_string()))
            }
        }
    }

    async fn deactivate(
        &self,
        conn: &mut SqliteConnection,
        payload: &Value,
        ctx: &ApplyContext,
    ) -> Result<(), ApplierError> {
        let code = Self::object_code(payload, ctx);
        let Some(existing) = Self::locate(conn, ctx, &code).await? else {
            return Ok(());
        };
        Self::ensure_owner(&existing, ctx)?;
        ledger::deactivate_config_object(conn, existing.object_id, OffsetDateTime::now_utc())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packyard_metadata::SqliteStore;
    use packyard_metadata::repos::ConfigObjectRepo;
    use serde_json::json;

    fn ctx(pack: &str) -> ApplyContext {
        ApplyContext {
            pack_code: pack.to_string(),
            release_id: "20240601.001".to_string(),
            actor_id: None,
            object_type: "views".to_string(),
            object_key: "views:views/home.yaml".to_string(),
            existing_object_id: None,
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_and_deactivates() {
        let store = SqliteStore::in_memory().await.unwrap();
        let applier = DocumentApplier::new();
        let payload = json!({"code": "home", "title": "Home"});

        let mut conn = store.pool().acquire().await.unwrap();
        let first = applier.apply(&mut conn, &payload, &ctx("crm")).await.unwrap();
        let second = applier.apply(&mut conn, &payload, &ctx("crm")).await.unwrap();
        assert_eq!(first, second);

        applier
            .deactivate(&mut conn, &payload, &ctx("crm"))
            .await
            .unwrap();
        drop(conn);

        let row = store.find_config_object("views", "home").await.unwrap().unwrap();
        assert!(!row.is_active);
        assert_eq!(Some(row.object_id.to_string()), first);
    }

    #[tokio::test]
    async fn test_foreign_code_is_an_ownership_conflict() {
        let store = SqliteStore::in_memory().await.unwrap();
        let applier = DocumentApplier::new();
        let payload = json!({"code": "home"});

        let mut conn = store.pool().acquire().await.unwrap();
        applier.apply(&mut conn, &payload, &ctx("crm")).await.unwrap();
        let err = applier
            .apply(&mut conn, &json!({"code": "home", "x": 1}), &ctx("billing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApplierError::OwnershipConflict { .. }));
    }

    #[tokio::test]
    async fn test_deactivate_missing_is_noop() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        DocumentApplier::new()
            .deactivate(&mut conn, &json!({"code": "ghost"}), &ctx("crm"))
            .await
            .unwrap();
    }
}
