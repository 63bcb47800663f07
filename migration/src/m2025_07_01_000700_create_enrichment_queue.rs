//! Migration to create the enrichment_queue table.
//!
//! Backing table for the at-least-once enrichment queue: opaque payloads,
//! attempt counters, retry timing, and a dead-letter status.

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
                    .table(EnrichmentQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EnrichmentQueue::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EnrichmentQueue::Payload).text().not_null())
                    .col(
                        ColumnDef::new(EnrichmentQueue::Status)
                            .text()
                            .not_null()
                            .default("queued"),
                    )
                    .col(
                        ColumnDef::new(EnrichmentQueue::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(EnrichmentQueue::RetryAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(EnrichmentQueue::LastError).text().null())
                    .col(
                        ColumnDef::new(EnrichmentQueue::EnqueuedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(EnrichmentQueue::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim scans filter on status plus retry eligibility.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_enrichment_queue_status_retry ON enrichment_queue (status, retry_after, enqueued_at)".to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_enrichment_queue_status_retry")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(EnrichmentQueue::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum EnrichmentQueue {
    Table,
    Id,
    Payload,
    Status,
    Attempts,
    RetryAfter,
    LastError,
    EnqueuedAt,
    UpdatedAt,
}
