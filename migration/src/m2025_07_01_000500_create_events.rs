//! Migration to create the events table.
//!
//! Events are facts ingested from external platforms, unique per
//! (provider, external_id) so overlapping fetch windows converge to one row.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Events::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Events::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Events::OrganizationId).uuid().not_null())
                    .col(ColumnDef::new(Events::IntegrationId).uuid().not_null())
                    .col(ColumnDef::new(Events::Provider).text().not_null())
                    .col(ColumnDef::new(Events::ExternalId).text().not_null())
                    .col(ColumnDef::new(Events::Kind).text().not_null())
                    .col(ColumnDef::new(Events::ActorExternalId).text().null())
                    .col(ColumnDef::new(Events::EntityExternalId).text().null())
                    .col(
                        ColumnDef::new(Events::OccurredAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Events::ReceivedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Events::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(Events::LastSeenAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(Events::EnrichError).text().null())
                    .col(
                        ColumnDef::new(Events::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Events::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_events_integration_id")
                            .from(Events::Table, Events::IntegrationId)
                            .to(Integrations::Table, Integrations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Idempotency key for the upsert path.
        manager
            .create_index(
                Index::create()
                    .name("idx_events_provider_external_id")
                    .table(Events::Table)
                    .col(Events::Provider)
                    .col(Events::ExternalId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Retrieval joins by actor within a time window, newest data first.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_events_org_provider_actor_occurred ON events (organization_id, provider, actor_external_id, occurred_at DESC)".to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_events_org_provider_actor_occurred")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_events_provider_external_id")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(Events::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Events {
    Table,
    Id,
    OrganizationId,
    IntegrationId,
    Provider,
    ExternalId,
    Kind,
    ActorExternalId,
    EntityExternalId,
    OccurredAt,
    ReceivedAt,
    Payload,
    LastSeenAt,
    EnrichError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Integrations {
    Table,
    Id,
}
