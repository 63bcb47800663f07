//! Repository for enrichment output rows.

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use uuid::Uuid;

use super::RepositoryError;
use crate::models::event_vector::{ActiveModel, Entity as EventVector, Model};

pub struct EventVectorRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> EventVectorRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Whether an event already has enrichment output.
    pub async fn exists(&self, event_id: Uuid) -> Result<bool, RepositoryError> {
        Ok(EventVector::find_by_id(event_id)
            .one(self.db)
            .await?
            .is_some())
    }

    pub async fn find_by_event(&self, event_id: Uuid) -> Result<Option<Model>, RepositoryError> {
        Ok(EventVector::find_by_id(event_id).one(self.db).await?)
    }

    /// Store the summary and embedding for one event.
    pub async fn insert(
        &self,
        event_id: Uuid,
        summary: String,
        embedding: &[f32],
    ) -> Result<Model, RepositoryError> {
        let model = ActiveModel {
            event_id: Set(event_id),
            summary: Set(summary),
            embedding: Set(serde_json::json!(embedding)),
            dimension: Set(embedding.len() as i32),
            created_at: Set(Utc::now()),
        };

        Ok(model.insert(self.db).await?)
    }
}
