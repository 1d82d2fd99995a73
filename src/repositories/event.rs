//! # Event Repository

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, NotSet, QueryFilter,
    QueryOrder, Set,
};

use crate::error::StoreError;
use crate::models::event::{
    ActiveModel as EventActiveModel, Column, Entity as EventEntity, Model as EventModel,
};
use crate::store::StoreQuery;
use crate::tenant::EventContainer;

/// Repository for event database operations
pub struct EventRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> EventRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Append one event.
    pub async fn insert(&self, event: &EventContainer) -> Result<EventModel, StoreError> {
        let active = EventActiveModel {
            id: NotSet,
            tenant_id: Set(event.tenant_id),
            event_type: Set(event.event_type.clone()),
            action: Set(event.action.clone()),
            payload: Set(event.payload.clone()),
            created_at: Set(Utc::now().into()),
        };

        active
            .insert(self.db)
            .await
            .map_err(|e| StoreError::database("insert event", e))
    }

    /// Events covered by `query`, in insertion order.
    pub async fn list(&self, query: StoreQuery) -> Result<Vec<EventModel>, StoreError> {
        let mut select = EventEntity::find();
        if let Some((since, until)) = query.window() {
            select = select
                .filter(Column::CreatedAt.gt(since))
                .filter(Column::CreatedAt.lte(until));
        }

        select
            .order_by_asc(Column::Id)
            .all(self.db)
            .await
            .map_err(|e| StoreError::database("list events", e))
    }
}
