//! Migration to create the integrations table.
//!
//! An integration links one organization to one external provider workspace
//! and carries the sync/delete lifecycle fields observed by the dashboard.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Integrations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Integrations::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Integrations::OrganizationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Integrations::Provider).text().not_null())
                    .col(
                        ColumnDef::new(Integrations::Credentials)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Integrations::SyncId).uuid().null())
                    .col(
                        ColumnDef::new(Integrations::SyncStartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::SyncFinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Integrations::SyncUpdatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Integrations::SyncStep).text().null())
                    .col(ColumnDef::new(Integrations::SyncError).text().null())
                    .col(
                        ColumnDef::new(Integrations::SyncErrorAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Integrations::DeleteId).uuid().null())
                    .col(ColumnDef::new(Integrations::DeleteError).text().null())
                    .col(
                        ColumnDef::new(Integrations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Integrations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_integrations_organization_id")
                            .from(Integrations::Table, Integrations::OrganizationId)
                            .to(Organizations::Table, Organizations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One workspace per organization and provider.
        manager
            .create_index(
                Index::create()
                    .name("idx_integrations_org_provider")
                    .table(Integrations::Table)
                    .col(Integrations::OrganizationId)
                    .col(Integrations::Provider)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_integrations_org_provider")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(Integrations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
    OrganizationId,
    Provider,
    Credentials,
    SyncId,
    SyncStartedAt,
    SyncFinishedAt,
    SyncUpdatedAt,
    SyncStep,
    SyncError,
    SyncErrorAt,
    DeleteId,
    DeleteError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Organizations {
    Table,
    Id,
}
