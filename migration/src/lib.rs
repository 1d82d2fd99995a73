//! Database migrations for the Steward tenant scheduler.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_01_05_000001_create_integrations;
mod m2026_01_05_000002_create_tenant_settings;
mod m2026_01_05_000003_create_events;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_01_05_000001_create_integrations::Migration),
            Box::new(m2026_01_05_000002_create_tenant_settings::Migration),
            Box::new(m2026_01_05_000003_create_events::Migration),
        ]
    }
}
