//! Migration to create the external_entities table.
//!
//! Reference data (repositories, projects, channels, files, users, teams)
//! scoped to an integration and keyed by the provider-assigned identifier.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExternalEntities::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalEntities::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ExternalEntities::IntegrationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExternalEntities::Kind).text().not_null())
                    .col(
                        ColumnDef::new(ExternalEntities::ExternalId)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ExternalEntities::Name).text().not_null())
                    .col(ColumnDef::new(ExternalEntities::Metadata).json_binary().null())
                    .col(
                        ColumnDef::new(ExternalEntities::LastSeenAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalEntities::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ExternalEntities::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_external_entities_integration_id")
                            .from(ExternalEntities::Table, ExternalEntities::IntegrationId)
                            .to(Integrations::Table, Integrations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Natural key used by the upsert path.
        manager
            .create_index(
                Index::create()
                    .name("idx_external_entities_natural_key")
                    .table(ExternalEntities::Table)
                    .col(ExternalEntities::IntegrationId)
                    .col(ExternalEntities::Kind)
                    .col(ExternalEntities::ExternalId)
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
                    .name("idx_external_entities_natural_key")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(ExternalEntities::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExternalEntities {
    Table,
    Id,
    IntegrationId,
    Kind,
    ExternalId,
    Name,
    Metadata,
    LastSeenAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
}
