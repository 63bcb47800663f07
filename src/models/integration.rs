//! An organization's connection to one external provider workspace.
//!
//! The sync_* columns are the durable record of the step-wise sync lifecycle:
//! `sync_id` marks a run in flight, `sync_step` the step it reached, and
//! `sync_finished_at` the high-water mark used as the next incremental cutoff.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "integrations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub credentials: Json,
    pub sync_id: Option<Uuid>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub sync_finished_at: Option<DateTime<Utc>>,
    pub sync_updated_at: Option<DateTime<Utc>>,
    pub sync_step: Option<String>,
    pub sync_error: Option<String>,
    pub sync_error_at: Option<DateTime<Utc>>,
    pub delete_id: Option<Uuid>,
    pub delete_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::organization::Entity",
        from = "Column::OrganizationId",
        to = "super::organization::Column::Id"
    )]
    Organization,
    #[sea_orm(has_many = "super::event::Entity")]
    Events,
    #[sea_orm(has_many = "super::external_entity::Entity")]
    ExternalEntities,
}

impl Related<super::organization::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Organization.def()
    }
}

impl Related<super::event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Events.def()
    }
}

impl Related<super::external_entity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExternalEntities.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
