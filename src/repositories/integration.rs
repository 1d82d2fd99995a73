//! # Integration Repository
//!
//! Install/uninstall bookkeeping for tenants. Uninstalls are recorded as a
//! `removed_at` mark so incremental reads can turn them into removals.

use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};

use crate::error::StoreError;
use crate::models::integration::{
    ActiveModel as IntegrationActiveModel, Column, Entity as IntegrationEntity,
    Model as IntegrationModel,
};
use crate::store::StoreQuery;
use crate::tenant::{Integration, TenantId};

/// Repository for integration database operations
pub struct IntegrationRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> IntegrationRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Record an installation. Reinstalling replaces the previous row, clears
    /// any removal mark and makes it visible to the next incremental read.
    pub async fn insert(&self, integration: &Integration) -> Result<IntegrationModel, StoreError> {
        let model = IntegrationModel {
            tenant_id: integration.tenant_id,
            installation_id: integration.installation_id,
            app_id: integration.app_id,
            created_at: Utc::now().into(),
            removed_at: None,
        };

        let active = IntegrationActiveModel {
            tenant_id: Set(model.tenant_id),
            installation_id: Set(model.installation_id),
            app_id: Set(model.app_id),
            created_at: Set(model.created_at),
            removed_at: Set(None),
        };

        IntegrationEntity::insert(active)
            .on_conflict(
                OnConflict::column(Column::TenantId)
                    .update_columns([
                        Column::InstallationId,
                        Column::AppId,
                        Column::CreatedAt,
                        Column::RemovedAt,
                    ])
                    .to_owned(),
            )
            .exec(self.db)
            .await
            .map_err(|e| StoreError::database("insert integration", e))?;

        Ok(model)
    }

    /// Mark a tenant's installation as removed. Returns whether an active
    /// installation existed.
    pub async fn delete(&self, tenant_id: TenantId) -> Result<bool, StoreError> {
        let removed_at: sea_orm::prelude::DateTimeWithTimeZone = Utc::now().into();
        let result = IntegrationEntity::update_many()
            .col_expr(Column::RemovedAt, Expr::value(removed_at))
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::RemovedAt.is_null())
            .exec(self.db)
            .await
            .map_err(|e| StoreError::database("remove integration", e))?;

        Ok(result.rows_affected > 0)
    }

    /// Active installation of a tenant.
    pub async fn find(&self, tenant_id: TenantId) -> Result<Option<IntegrationModel>, StoreError> {
        IntegrationEntity::find_by_id(tenant_id)
            .filter(Column::RemovedAt.is_null())
            .one(self.db)
            .await
            .map_err(|e| StoreError::database("find integration", e))
    }

    /// Active integrations covered by `query`, ordered by tenant.
    pub async fn list(&self, query: StoreQuery) -> Result<Vec<IntegrationModel>, StoreError> {
        let mut select = IntegrationEntity::find().filter(Column::RemovedAt.is_null());
        if let Some((since, until)) = query.window() {
            select = select
                .filter(Column::CreatedAt.gt(since))
                .filter(Column::CreatedAt.lte(until));
        }

        select
            .order_by_asc(Column::TenantId)
            .all(self.db)
            .await
            .map_err(|e| StoreError::database("list integrations", e))
    }

    /// Tenants whose installation was removed within `query`.
    pub async fn list_removed(&self, query: StoreQuery) -> Result<Vec<TenantId>, StoreError> {
        let mut select = IntegrationEntity::find().filter(Column::RemovedAt.is_not_null());
        if let Some((since, until)) = query.window() {
            select = select
                .filter(Column::RemovedAt.gt(since))
                .filter(Column::RemovedAt.lte(until));
        }

        let rows = select
            .order_by_asc(Column::TenantId)
            .all(self.db)
            .await
            .map_err(|e| StoreError::database("list removed integrations", e))?;

        Ok(rows.into_iter().map(|row| row.tenant_id).collect())
    }
}
