//! Repository for provider reference data (repositories, channels, projects,
//! files, users, teams).

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::RepositoryError;
use crate::models::external_entity::{ActiveModel, Column, Entity as ExternalEntity, Model};

/// One entity observed on the provider side during a sync step.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub kind: String,
    pub external_id: String,
    pub name: String,
    pub metadata: Option<JsonValue>,
}

pub struct ExternalEntityRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> ExternalEntityRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert or refresh a batch of entities for one integration.
    ///
    /// Conflicts on (integration_id, kind, external_id) update the mutable
    /// columns and bump last_seen_at; identity columns and created_at are left
    /// untouched.
    pub async fn upsert_batch(
        &self,
        integration_id: Uuid,
        records: Vec<EntityRecord>,
    ) -> Result<u64, RepositoryError> {
        if records.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let count = records.len() as u64;
        let models = records.into_iter().map(|record| ActiveModel {
            id: Set(Uuid::new_v4()),
            integration_id: Set(integration_id),
            kind: Set(record.kind),
            external_id: Set(record.external_id),
            name: Set(record.name),
            metadata: Set(record.metadata),
            last_seen_at: Set(now),
            created_at: Set(now),
            updated_at: Set(now),
        });

        ExternalEntity::insert_many(models)
            .on_conflict(
                OnConflict::columns([Column::IntegrationId, Column::Kind, Column::ExternalId])
                    .update_columns([
                        Column::Name,
                        Column::Metadata,
                        Column::LastSeenAt,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db)
            .await?;

        Ok(count)
    }

    /// All entities of a given kind for one integration.
    pub async fn list_by_kind(
        &self,
        integration_id: Uuid,
        kind: &str,
    ) -> Result<Vec<Model>, RepositoryError> {
        let entities = ExternalEntity::find()
            .filter(Column::IntegrationId.eq(integration_id))
            .filter(Column::Kind.eq(kind))
            .all(self.db)
            .await?;

        Ok(entities)
    }
}
