//! Migration to create the event_vectors table.
//!
//! One row per enriched event: the AI summary plus its embedding stored as a
//! declared-dimension float array. Absence of a row means "not yet enriched".

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EventVectors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EventVectors::EventId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EventVectors::Summary).text().not_null())
                    .col(
                        ColumnDef::new(EventVectors::Embedding)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(EventVectors::Dimension).integer().not_null())
                    .col(
                        ColumnDef::new(EventVectors::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_event_vectors_event_id")
                            .from(EventVectors::Table, EventVectors::EventId)
                            .to(Events::Table, Events::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EventVectors::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum EventVectors {
    Table,
    EventId,
    Summary,
    Embedding,
    Dimension,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Events {
    Table,
    Id,
}
