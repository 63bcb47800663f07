//! Repository for ingested activity events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::RepositoryError;
use crate::models::event::{ActiveModel, Column, Entity as Event, Model};
use crate::models::event_vector;

/// One activity fact produced by a provider sync step.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub organization_id: Uuid,
    pub integration_id: Uuid,
    pub provider: String,
    pub external_id: String,
    pub kind: String,
    pub actor_external_id: Option<String>,
    pub entity_external_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

pub struct EventRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> EventRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert or refresh a batch of events, returning the internal ids of
    /// every row touched.
    ///
    /// Conflicts on (provider, external_id) update the mutable columns and
    /// bump last_seen_at; occurred_at and created_at keep their first-insert
    /// values. The ids are re-selected after the upsert so callers can
    /// enqueue them for enrichment regardless of whether the row was new.
    pub async fn upsert_batch(
        &self,
        records: Vec<EventRecord>,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();

        // Group the natural keys by provider so the re-select below matches
        // exactly the rows in this batch, even when providers are mixed or an
        // external id repeats across providers.
        let mut keys_by_provider: HashMap<String, Vec<String>> = HashMap::new();
        for record in &records {
            keys_by_provider
                .entry(record.provider.clone())
                .or_default()
                .push(record.external_id.clone());
        }

        let models = records.into_iter().map(|record| ActiveModel {
            id: Set(Uuid::new_v4()),
            organization_id: Set(record.organization_id),
            integration_id: Set(record.integration_id),
            provider: Set(record.provider),
            external_id: Set(record.external_id),
            kind: Set(record.kind),
            actor_external_id: Set(record.actor_external_id),
            entity_external_id: Set(record.entity_external_id),
            occurred_at: Set(record.occurred_at),
            received_at: Set(now),
            payload: Set(record.payload),
            last_seen_at: Set(now),
            enrich_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        });

        Event::insert_many(models)
            .on_conflict(
                OnConflict::columns([Column::Provider, Column::ExternalId])
                    .update_columns([
                        Column::Kind,
                        Column::ActorExternalId,
                        Column::EntityExternalId,
                        Column::Payload,
                        Column::LastSeenAt,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db)
            .await?;

        let mut batch_keys = Condition::any();
        for (provider, external_ids) in keys_by_provider {
            batch_keys = batch_keys.add(
                Condition::all()
                    .add(Column::Provider.eq(provider))
                    .add(Column::ExternalId.is_in(external_ids)),
            );
        }

        let ids: Vec<Uuid> = Event::find()
            .select_only()
            .column(Column::Id)
            .filter(batch_keys)
            .into_tuple()
            .all(self.db)
            .await?;

        Ok(ids)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, RepositoryError> {
        Ok(Event::find_by_id(id).one(self.db).await?)
    }

    /// Record or clear the latest enrichment failure on an event.
    pub async fn set_enrich_error(
        &self,
        id: Uuid,
        error: Option<String>,
    ) -> Result<(), RepositoryError> {
        Event::update_many()
            .col_expr(Column::EnrichError, error.into())
            .col_expr(Column::UpdatedAt, Utc::now().into())
            .filter(Column::Id.eq(id))
            .exec(self.db)
            .await?;

        Ok(())
    }

    /// Enriched events for one actor on one provider within a time window,
    /// oldest first. Events without a vector are excluded.
    pub async fn enriched_actor_events(
        &self,
        organization_id: Uuid,
        provider: &str,
        actor_external_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        entity_external_id: Option<&str>,
    ) -> Result<Vec<(Model, event_vector::Model)>, RepositoryError> {
        let mut query = Event::find()
            .find_also_related(event_vector::Entity)
            .filter(Column::OrganizationId.eq(organization_id))
            .filter(Column::Provider.eq(provider))
            .filter(Column::ActorExternalId.eq(actor_external_id))
            .filter(Column::OccurredAt.gte(from))
            .filter(Column::OccurredAt.lte(to));

        if let Some(entity) = entity_external_id {
            query = query.filter(Column::EntityExternalId.eq(entity));
        }

        let rows = query
            .order_by_asc(Column::OccurredAt)
            .order_by_asc(Column::Id)
            .all(self.db)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(event, vector)| vector.map(|v| (event, v)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{ActiveModelTrait, Database};

    use crate::models::{integration, organization};

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect sqlite");
        Migrator::up(&db, None).await.expect("run migrations");
        db
    }

    async fn seed_integration(db: &DatabaseConnection, org_id: Uuid, provider: &str) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        integration::ActiveModel {
            id: Set(id),
            organization_id: Set(org_id),
            provider: Set(provider.to_string()),
            credentials: Set(serde_json::json!({"token": "t"})),
            sync_id: Set(None),
            sync_started_at: Set(None),
            sync_finished_at: Set(None),
            sync_updated_at: Set(None),
            sync_step: Set(None),
            sync_error: Set(None),
            sync_error_at: Set(None),
            delete_id: Set(None),
            delete_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap();
        id
    }

    async fn seed_org(db: &DatabaseConnection) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        organization::ActiveModel {
            id: Set(id),
            name: Set("acme".to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap();
        id
    }

    fn record(
        org_id: Uuid,
        integration_id: Uuid,
        provider: &str,
        external_id: &str,
    ) -> EventRecord {
        EventRecord {
            organization_id: org_id,
            integration_id,
            provider: provider.to_string(),
            external_id: external_id.to_string(),
            kind: "commit".to_string(),
            actor_external_id: Some("octocat".to_string()),
            entity_external_id: None,
            occurred_at: Utc::now(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn upsert_ids_are_scoped_per_provider() {
        let db = setup_db().await;
        let org_id = seed_org(&db).await;
        let github = seed_integration(&db, org_id, "github").await;
        let discord = seed_integration(&db, org_id, "discord").await;
        let repo = EventRepository::new(&db);

        // A discord event that shares its external id with the github batch
        // below must not leak into that batch's returned ids.
        let discord_ids = repo
            .upsert_batch(vec![record(org_id, discord, "discord", "42")])
            .await
            .unwrap();
        assert_eq!(discord_ids.len(), 1);

        let github_ids = repo
            .upsert_batch(vec![record(org_id, github, "github", "42")])
            .await
            .unwrap();
        assert_eq!(github_ids.len(), 1);
        assert_ne!(github_ids[0], discord_ids[0]);

        let stored = repo.find_by_id(github_ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.provider, "github");
    }

    #[tokio::test]
    async fn mixed_provider_batch_returns_every_row() {
        let db = setup_db().await;
        let org_id = seed_org(&db).await;
        let github = seed_integration(&db, org_id, "github").await;
        let discord = seed_integration(&db, org_id, "discord").await;
        let repo = EventRepository::new(&db);

        let ids = repo
            .upsert_batch(vec![
                record(org_id, github, "github", "42"),
                record(org_id, discord, "discord", "42"),
            ])
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }
}
