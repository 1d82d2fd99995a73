//! # Settings Repository
//!
//! Tenant settings documents, stored as JSON and replaced wholesale.

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use serde_json::Value as JsonValue;

use crate::error::StoreError;
use crate::models::tenant_settings::{
    ActiveModel as SettingsActiveModel, Column, Entity as SettingsEntity, Model as SettingsModel,
};
use crate::store::StoreQuery;
use crate::tenant::{Settings, TenantId};

/// Repository for tenant settings database operations
pub struct SettingsRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> SettingsRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert or replace the settings document for a tenant.
    pub async fn upsert(
        &self,
        tenant_id: TenantId,
        settings: &Settings,
    ) -> Result<SettingsModel, StoreError> {
        let document = serde_json::to_value(settings).map_err(|e| StoreError::InvalidRows {
            table: "tenant_settings",
            tenant_ids: vec![tenant_id],
            details: e.to_string(),
        })?;
        self.upsert_document(tenant_id, document).await
    }

    /// Insert or replace a raw document. The sync loop decodes it on read, so
    /// a document that is not valid settings is stored but later rejected.
    pub async fn upsert_document(
        &self,
        tenant_id: TenantId,
        document: JsonValue,
    ) -> Result<SettingsModel, StoreError> {
        let model = SettingsModel {
            tenant_id,
            document,
            updated_at: Utc::now().into(),
        };

        let active = SettingsActiveModel {
            tenant_id: Set(model.tenant_id),
            document: Set(model.document.clone()),
            updated_at: Set(model.updated_at),
        };

        SettingsEntity::insert(active)
            .on_conflict(
                OnConflict::column(Column::TenantId)
                    .update_columns([Column::Document, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(self.db)
            .await
            .map_err(|e| StoreError::database("upsert settings", e))?;

        Ok(model)
    }

    pub async fn delete(&self, tenant_id: TenantId) -> Result<bool, StoreError> {
        let result = SettingsEntity::delete_by_id(tenant_id)
            .exec(self.db)
            .await
            .map_err(|e| StoreError::database("delete settings", e))?;

        Ok(result.rows_affected > 0)
    }

    /// Settings rows covered by `query`, ordered by tenant.
    pub async fn list(&self, query: StoreQuery) -> Result<Vec<SettingsModel>, StoreError> {
        let mut select = SettingsEntity::find();
        if let Some((since, until)) = query.window() {
            select = select
                .filter(Column::UpdatedAt.gt(since))
                .filter(Column::UpdatedAt.lte(until));
        }

        select
            .order_by_asc(Column::TenantId)
            .all(self.db)
            .await
            .map_err(|e| StoreError::database("list settings", e))
    }
}
