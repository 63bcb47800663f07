//! Data access layer: per-entity repositories over the shared connection pool.

pub mod event;
pub mod event_vector;
pub mod external_entity;
pub mod integration;
pub mod member;

use thiserror::Error;

/// Errors surfaced by repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("record not found: {0}")]
    NotFound(String),
}
