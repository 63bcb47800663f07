//! An activity fact ingested from an external platform.
//!
//! `(provider, external_id)` is unique, so re-fetching an overlapping window
//! updates the existing row instead of duplicating it. `occurred_at` is the
//! provider timestamp and never changes after first insert.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub organization_id: Uuid,
    pub integration_id: Uuid,
    pub provider: String,
    pub external_id: String,
    pub kind: String,
    pub actor_external_id: Option<String>,
    pub entity_external_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Json,
    pub last_seen_at: DateTime<Utc>,
    pub enrich_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::integration::Entity",
        from = "Column::IntegrationId",
        to = "super::integration::Column::Id"
    )]
    Integration,
    #[sea_orm(has_one = "super::event_vector::Entity")]
    Vector,
}

impl Related<super::integration::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Integration.def()
    }
}

impl Related<super::event_vector::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Vector.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
