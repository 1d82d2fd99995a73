//! Migration to create the tenant_settings table.
//!
//! Stores the desired handler configuration document for each tenant. The
//! document is replaced wholesale on every update and `updated_at` drives
//! incremental reads.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TenantSettings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TenantSettings::TenantId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TenantSettings::Document)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TenantSettings::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tenant_settings_updated_at")
                    .table(TenantSettings::Table)
                    .col(TenantSettings::UpdatedAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TenantSettings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TenantSettings {
    Table,
    TenantId,
    Document,
    UpdatedAt,
}
