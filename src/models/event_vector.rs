//! Enrichment output for one event: the generated summary and its embedding.
//!
//! The embedding is stored as a JSON array of f32 with the dimension recorded
//! alongside it. A missing row means the event has not been enriched yet, so
//! presence of the row is the worker's idempotency check.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "event_vectors")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub event_id: Uuid,
    pub summary: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub embedding: Json,
    pub dimension: i32,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// Decode the stored embedding back into a float vector.
    pub fn embedding_values(&self) -> Vec<f32> {
        serde_json::from_value(self.embedding.clone()).unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::event::Entity",
        from = "Column::EventId",
        to = "super::event::Column::Id"
    )]
    Event,
}

impl Related<super::event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Event.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
