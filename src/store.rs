//! # Durable Store
//!
//! Read contract between the sync loop and the system of record, plus the
//! SeaORM-backed implementation. Reads may partially fail: whatever could be
//! read is returned alongside the error so one bad tenant never hides the
//! others.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use sea_orm::prelude::DateTimeWithTimeZone;
use tracing::warn;

use crate::error::StoreError;
use crate::repositories::{EventRepository, IntegrationRepository, SettingsRepository};
use crate::tenant::{EventContainer, Integration, Settings, TenantId};

/// Which rows a read covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreQuery {
    /// Everything currently stored (bootstrap).
    All,
    /// Rows written in the half-open window `(since, until]`.
    Changed {
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    },
}

impl StoreQuery {
    /// Window bounds in the column type used by the tables.
    pub fn window(&self) -> Option<(DateTimeWithTimeZone, DateTimeWithTimeZone)> {
        match self {
            StoreQuery::All => None,
            StoreQuery::Changed { since, until } => Some(((*since).into(), (*until).into())),
        }
    }
}

/// Result of one store read: the data that could be read plus the error, if any.
#[derive(Debug)]
pub struct StoreRead<T> {
    pub data: T,
    pub error: Option<StoreError>,
}

impl<T> StoreRead<T> {
    pub fn complete(data: T) -> Self {
        Self { data, error: None }
    }

    pub fn partial(data: T, error: StoreError) -> Self {
        Self {
            data,
            error: Some(error),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Whether the rows the query covered were all looked at, even if some
    /// were rejected. Only a failed query needs its window read again.
    pub fn is_exhausted(&self) -> bool {
        !matches!(self.error, Some(StoreError::Database { .. }))
    }
}

impl<T: Default> StoreRead<T> {
    pub fn failed(error: StoreError) -> Self {
        Self::partial(T::default(), error)
    }
}

/// Read side of the system of record.
#[async_trait]
pub trait Store: Send + Sync {
    async fn read_integrations(
        &self,
        query: StoreQuery,
    ) -> StoreRead<HashMap<TenantId, Integration>>;

    async fn read_settings(&self, query: StoreQuery) -> StoreRead<HashMap<TenantId, Settings>>;

    async fn read_events(
        &self,
        query: StoreQuery,
    ) -> StoreRead<HashMap<TenantId, Vec<EventContainer>>>;

    /// Tenants whose integration was removed.
    async fn read_removals(&self, query: StoreQuery) -> StoreRead<Vec<TenantId>>;
}

/// [`Store`] backed by the `integrations`, `tenant_settings` and `events` tables.
#[derive(Clone)]
pub struct DatabaseStore {
    db: DatabaseConnection,
}

impl DatabaseStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Store for DatabaseStore {
    async fn read_integrations(
        &self,
        query: StoreQuery,
    ) -> StoreRead<HashMap<TenantId, Integration>> {
        match IntegrationRepository::new(&self.db).list(query).await {
            Ok(rows) => StoreRead::complete(
                rows.into_iter()
                    .map(|row| (row.tenant_id, Integration::from(row)))
                    .collect(),
            ),
            Err(err) => StoreRead::failed(err),
        }
    }

    async fn read_settings(&self, query: StoreQuery) -> StoreRead<HashMap<TenantId, Settings>> {
        let rows = match SettingsRepository::new(&self.db).list(query).await {
            Ok(rows) => rows,
            Err(err) => return StoreRead::failed(err),
        };

        let mut settings = HashMap::with_capacity(rows.len());
        let mut rejected = Vec::new();
        let mut details = Vec::new();
        for row in rows {
            match serde_json::from_value::<Settings>(row.document) {
                Ok(document) => {
                    settings.insert(row.tenant_id, document);
                }
                Err(err) => {
                    warn!(tenant_id = row.tenant_id, error = %err, "Skipping undecodable settings document");
                    rejected.push(row.tenant_id);
                    details.push(format!("tenant {}: {}", row.tenant_id, err));
                }
            }
        }

        if rejected.is_empty() {
            StoreRead::complete(settings)
        } else {
            StoreRead::partial(
                settings,
                StoreError::InvalidRows {
                    table: "tenant_settings",
                    tenant_ids: rejected,
                    details: details.join("; "),
                },
            )
        }
    }

    async fn read_events(
        &self,
        query: StoreQuery,
    ) -> StoreRead<HashMap<TenantId, Vec<EventContainer>>> {
        match EventRepository::new(&self.db).list(query).await {
            Ok(rows) => {
                let mut events: HashMap<TenantId, Vec<EventContainer>> = HashMap::new();
                for row in rows {
                    events
                        .entry(row.tenant_id)
                        .or_default()
                        .push(EventContainer::from(row));
                }
                StoreRead::complete(events)
            }
            Err(err) => StoreRead::failed(err),
        }
    }

    async fn read_removals(&self, query: StoreQuery) -> StoreRead<Vec<TenantId>> {
        match IntegrationRepository::new(&self.db).list_removed(query).await {
            Ok(tenant_ids) => StoreRead::complete(tenant_ids),
            Err(err) => StoreRead::failed(err),
        }
    }
}
