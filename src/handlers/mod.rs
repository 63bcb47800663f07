//! Read-only HTTP handlers for the status surface.
//!
//! Writes happen through the sync lifecycle, never through these routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db;
use crate::enrichment::queue::EnrichmentQueue;
use crate::error::ApiError;
use crate::repositories::integration::IntegrationRepository;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Liveness plus a database round trip.
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    db::health_check(&state.db).await.map_err(|e| {
        tracing::error!(error = %e, "health check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            "database unreachable",
        )
    })?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// Sync lifecycle fields of one integration.
#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub provider: String,
    pub sync_id: Option<Uuid>,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub sync_finished_at: Option<DateTime<Utc>>,
    pub sync_updated_at: Option<DateTime<Utc>>,
    pub sync_step: Option<String>,
    pub sync_error: Option<serde_json::Value>,
    pub sync_error_at: Option<DateTime<Utc>>,
    pub delete_id: Option<Uuid>,
    pub delete_error: Option<String>,
}

impl From<crate::models::integration::Model> for SyncStatusResponse {
    fn from(model: crate::models::integration::Model) -> Self {
        // Errors are stored as serialized JSON; fall back to a plain string
        // for rows written before the taxonomy existed.
        let sync_error = model.sync_error.map(|raw| {
            serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
        });

        Self {
            id: model.id,
            organization_id: model.organization_id,
            provider: model.provider,
            sync_id: model.sync_id,
            sync_started_at: model.sync_started_at,
            sync_finished_at: model.sync_finished_at,
            sync_updated_at: model.sync_updated_at,
            sync_step: model.sync_step,
            sync_error,
            sync_error_at: model.sync_error_at,
            delete_id: model.delete_id,
            delete_error: model.delete_error,
        }
    }
}

pub async fn list_integrations(
    State(state): State<AppState>,
) -> Result<Json<Vec<SyncStatusResponse>>, ApiError> {
    let integrations = IntegrationRepository::new(&state.db).list_all().await?;

    Ok(Json(
        integrations.into_iter().map(SyncStatusResponse::from).collect(),
    ))
}

pub async fn integration_sync_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncStatusResponse>, ApiError> {
    let integration = IntegrationRepository::new(&state.db)
        .find_by_id(id)
        .await?
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("integration {} not found", id),
            )
        })?;

    Ok(Json(integration.into()))
}

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub queued: u64,
    pub dead: u64,
}

/// Enrichment queue depth, the lag between ingestion and retrieval.
pub async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let queue = EnrichmentQueue::new(&state.db);
    let queued = queue.queued_count().await?;
    let dead = queue.dead_count().await?;

    Ok(Json(QueueStatsResponse { queued, dead }))
}
