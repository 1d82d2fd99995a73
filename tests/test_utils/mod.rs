//! Test utilities for database testing.
//!
//! Sets up in-memory SQLite databases with migrations applied and seeds the
//! scheduler tables.

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::json;

use steward::repositories::{EventRepository, IntegrationRepository, SettingsRepository};
use steward::tenant::{EventContainer, Integration, Settings, TenantId};

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn integration(tenant_id: TenantId) -> Integration {
    Integration {
        tenant_id,
        installation_id: tenant_id * 100,
        app_id: 1,
    }
}

/// Stores an integration and its settings document.
#[allow(dead_code)]
pub async fn install_tenant(
    db: &DatabaseConnection,
    tenant_id: TenantId,
    settings: &Settings,
) -> Result<()> {
    IntegrationRepository::new(db)
        .insert(&integration(tenant_id))
        .await?;
    SettingsRepository::new(db).upsert(tenant_id, settings).await?;
    Ok(())
}

#[allow(dead_code)]
pub async fn insert_opened_issue(
    db: &DatabaseConnection,
    tenant_id: TenantId,
    number: i64,
) -> Result<()> {
    let event = EventContainer::new(
        tenant_id,
        "issues",
        "opened",
        json!({ "issue": { "number": number } }),
    );
    EventRepository::new(db).insert(&event).await?;
    Ok(())
}
