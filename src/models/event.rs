//! Event entity model
//!
//! Normalized repository activity recorded by the ingestion path.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

use crate::tenant::EventContainer;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Repository the event belongs to
    pub tenant_id: i64,

    /// GitHub event name (e.g. `issues`)
    pub event_type: String,

    /// Event action (e.g. `opened`)
    pub action: String,

    /// Raw webhook payload
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for EventContainer {
    fn from(model: Model) -> Self {
        EventContainer::new(model.tenant_id, model.event_type, model.action, model.payload)
    }
}
