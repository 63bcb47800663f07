//! Database migrations for the Syncline ingestion pipeline.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_07_01_000100_create_organizations;
mod m2025_07_01_000200_create_members;
mod m2025_07_01_000300_create_integrations;
mod m2025_07_01_000400_create_external_entities;
mod m2025_07_01_000500_create_events;
mod m2025_07_01_000600_create_event_vectors;
mod m2025_07_01_000700_create_enrichment_queue;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_07_01_000100_create_organizations::Migration),
            Box::new(m2025_07_01_000200_create_members::Migration),
            Box::new(m2025_07_01_000300_create_integrations::Migration),
            Box::new(m2025_07_01_000400_create_external_entities::Migration),
            Box::new(m2025_07_01_000500_create_events::Migration),
            Box::new(m2025_07_01_000600_create_event_vectors::Migration),
            Box::new(m2025_07_01_000700_create_enrichment_queue::Migration),
        ]
    }
}
