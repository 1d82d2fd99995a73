//! Integration entity model
//!
//! One row per tenant recording the GitHub App installation it belongs to.
//! Uninstalling marks the row with `removed_at`; reinstalling clears it.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

use crate::tenant;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "integrations")]
pub struct Model {
    /// Repository identifier (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: i64,

    /// GitHub App installation identifier
    pub installation_id: i64,

    /// GitHub App identifier
    pub app_id: i64,

    /// Timestamp when the installation was recorded
    pub created_at: DateTimeWithTimeZone,

    /// Set when the installation was removed
    pub removed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for tenant::Integration {
    fn from(model: Model) -> Self {
        Self {
            tenant_id: model.tenant_id,
            installation_id: model.installation_id,
            app_id: model.app_id,
        }
    }
}
