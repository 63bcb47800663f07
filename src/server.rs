//! Axum server exposing the read-only status surface.

use axum::{Router, routing::get};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::handlers;

/// Shared resources for request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/integrations", get(handlers::list_integrations))
        .route(
            "/integrations/{id}/sync-status",
            get(handlers::integration_sync_status),
        )
        .route("/queue/stats", get(handlers::queue_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn run_server(
    config: &AppConfig,
    db: DatabaseConnection,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = AppState { db };
    let app = create_app(state);

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, profile = %config.profile, "status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{ActiveModelTrait, Database, Set};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::models::{integration, organization};

    async fn test_app() -> (Router, DatabaseConnection) {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect sqlite");
        Migrator::up(&db, None).await.expect("run migrations");
        (create_app(AppState { db: db.clone() }), db)
    }

    async fn seed_integration(db: &DatabaseConnection) -> integration::Model {
        let now = Utc::now();
        let org_id = Uuid::new_v4();
        organization::ActiveModel {
            id: Set(org_id),
            name: Set("acme".to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap();

        integration::ActiveModel {
            id: Set(Uuid::new_v4()),
            organization_id: Set(org_id),
            provider: Set("github".to_string()),
            credentials: Set(serde_json::json!({"token": "t", "account": "acme"})),
            sync_id: Set(None),
            sync_started_at: Set(None),
            sync_finished_at: Set(Some(now)),
            sync_updated_at: Set(None),
            sync_step: Set(None),
            sync_error: Set(Some(r#"{"type":"transient","message":"x"}"#.to_string())),
            sync_error_at: Set(Some(now)),
            delete_id: Set(None),
            delete_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (app, _db) = test_app().await;

        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_status_exposes_lifecycle_fields() {
        let (app, db) = test_app().await;
        let seeded = seed_integration(&db).await;

        let response = app
            .oneshot(
                Request::get(format!("/integrations/{}/sync-status", seeded.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["provider"], "github");
        assert_eq!(body["sync_error"]["type"], "transient");
        assert!(body["sync_finished_at"].is_string());
    }

    #[tokio::test]
    async fn unknown_integration_is_404_problem_json() {
        let (app, _db) = test_app().await;

        let response = app
            .oneshot(
                Request::get(format!("/integrations/{}/sync-status", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn queue_stats_starts_empty() {
        let (app, _db) = test_app().await;

        let response = app
            .oneshot(Request::get("/queue/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["queued"], 0);
        assert_eq!(body["dead"], 0);
    }
}
