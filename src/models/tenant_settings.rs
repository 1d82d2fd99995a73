//! TenantSettings entity model
//!
//! Stores each tenant's settings document as JSON. The document is replaced
//! wholesale on update.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tenant_settings")]
pub struct Model {
    /// Repository identifier (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub tenant_id: i64,

    /// Serialized `Settings` document
    #[sea_orm(column_type = "JsonBinary")]
    pub document: JsonValue,

    /// Timestamp of the last write; drives incremental reads
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
