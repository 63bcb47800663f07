//! Retrieval of enriched member activity.
//!
//! Joins a member's provider identity to their events and the generated
//! summaries. Events still waiting on enrichment have no vector row and are
//! silently excluded, so retrieval degrades gracefully while the queue
//! drains.

pub mod agent;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::repositories::RepositoryError;
use crate::repositories::event::EventRepository;
use crate::repositories::member::MemberRepository;

/// Parameters for one activity lookup.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberActivityQuery {
    pub organization_id: Uuid,
    pub member_id: Uuid,
    pub provider: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Optional scope to one entity: a repository, channel or file.
    #[serde(default)]
    pub entity_external_id: Option<String>,
}

/// One enriched activity fact, ready to feed a status-update draft.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivitySummary {
    pub event_id: Uuid,
    pub external_id: String,
    pub kind: String,
    pub entity_external_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub summary: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("member {0} not found in organization")]
    MemberNotFound(Uuid),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// The retrieval seam the agent calls through.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn member_activity(
        &self,
        query: &MemberActivityQuery,
    ) -> Result<Vec<ActivitySummary>, RetrievalError>;
}

pub struct ActivityRetriever {
    db: DatabaseConnection,
}

impl ActivityRetriever {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ActivitySource for ActivityRetriever {
    /// What did this member do on this provider inside the window.
    ///
    /// A member without a linked identity for the provider has no activity
    /// there, so the result is empty rather than an error. Duplicate external
    /// ids keep their first (oldest) occurrence.
    #[instrument(skip(self), fields(member_id = %query.member_id, provider = %query.provider))]
    async fn member_activity(
        &self,
        query: &MemberActivityQuery,
    ) -> Result<Vec<ActivitySummary>, RetrievalError> {
        let members = MemberRepository::new(&self.db);
        let Some(member) = members
            .find_in_organization(query.organization_id, query.member_id)
            .await?
        else {
            return Err(RetrievalError::MemberNotFound(query.member_id));
        };

        let Some(identity) = member.identity_for(&query.provider) else {
            return Ok(Vec::new());
        };

        let events = EventRepository::new(&self.db);
        let rows = events
            .enriched_actor_events(
                query.organization_id,
                &query.provider,
                identity,
                query.from,
                query.to,
                query.entity_external_id.as_deref(),
            )
            .await?;

        let mut seen = HashSet::new();
        let summaries = rows
            .into_iter()
            .filter(|(event, _)| seen.insert(event.external_id.clone()))
            .map(|(event, vector)| ActivitySummary {
                event_id: event.id,
                external_id: event.external_id,
                kind: event.kind,
                entity_external_id: event.entity_external_id,
                occurred_at: event.occurred_at,
                summary: vector.summary,
            })
            .collect();

        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{ActiveModelTrait, Database, Set};

    use crate::models::{event, event_vector, integration, member, organization};

    struct Seed {
        organization_id: Uuid,
        integration_id: Uuid,
        member_id: Uuid,
    }

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect sqlite");
        Migrator::up(&db, None).await.expect("run migrations");
        db
    }

    async fn seed_member(db: &DatabaseConnection, github_login: Option<&str>) -> Seed {
        let now = Utc::now();
        let organization_id = Uuid::new_v4();
        organization::ActiveModel {
            id: Set(organization_id),
            name: Set("acme".to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap();

        let integration_id = Uuid::new_v4();
        integration::ActiveModel {
            id: Set(integration_id),
            organization_id: Set(organization_id),
            provider: Set("github".to_string()),
            credentials: Set(serde_json::json!({"token": "t", "account": "acme"})),
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

        let member_id = Uuid::new_v4();
        member::ActiveModel {
            id: Set(member_id),
            organization_id: Set(organization_id),
            display_name: Set("Dana".to_string()),
            github_login: Set(github_login.map(str::to_string)),
            discord_user_id: Set(None),
            figma_user_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap();

        Seed {
            organization_id,
            integration_id,
            member_id,
        }
    }

    async fn seed_event(
        db: &DatabaseConnection,
        seed: &Seed,
        external_id: &str,
        actor: &str,
        occurred_at: DateTime<Utc>,
        summary: Option<&str>,
    ) -> Uuid {
        let now = Utc::now();
        let event_id = Uuid::new_v4();
        event::ActiveModel {
            id: Set(event_id),
            organization_id: Set(seed.organization_id),
            integration_id: Set(seed.integration_id),
            provider: Set("github".to_string()),
            external_id: Set(external_id.to_string()),
            kind: Set("commit".to_string()),
            actor_external_id: Set(Some(actor.to_string())),
            entity_external_id: Set(Some("widget-repo".to_string())),
            occurred_at: Set(occurred_at),
            received_at: Set(now),
            payload: Set(serde_json::json!({"message": "work"})),
            last_seen_at: Set(now),
            enrich_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .unwrap();

        if let Some(summary) = summary {
            event_vector::ActiveModel {
                event_id: Set(event_id),
                summary: Set(summary.to_string()),
                embedding: Set(serde_json::json!([0.1, 0.2])),
                dimension: Set(2),
                created_at: Set(now),
            }
            .insert(db)
            .await
            .unwrap();
        }

        event_id
    }

    fn window_query(seed: &Seed) -> MemberActivityQuery {
        MemberActivityQuery {
            organization_id: seed.organization_id,
            member_id: seed.member_id,
            provider: "github".to_string(),
            from: Utc::now() - Duration::days(1),
            to: Utc::now() + Duration::days(1),
            entity_external_id: None,
        }
    }

    #[tokio::test]
    async fn returns_time_ordered_enriched_summaries() {
        let db = setup_db().await;
        let seed = seed_member(&db, Some("octocat")).await;
        let base = Utc::now() - Duration::hours(5);

        seed_event(&db, &seed, "sha-b", "octocat", base + Duration::hours(2), Some("later")).await;
        seed_event(&db, &seed, "sha-a", "octocat", base, Some("earlier")).await;

        let retriever = ActivityRetriever::new(db);
        let activity = retriever
            .member_activity(&window_query(&seed))
            .await
            .unwrap();

        let summaries: Vec<_> = activity.iter().map(|a| a.summary.as_str()).collect();
        assert_eq!(summaries, vec!["earlier", "later"]);
    }

    #[tokio::test]
    async fn unenriched_and_foreign_actor_events_are_excluded() {
        let db = setup_db().await;
        let seed = seed_member(&db, Some("octocat")).await;
        let now = Utc::now();

        seed_event(&db, &seed, "sha-1", "octocat", now, Some("enriched")).await;
        seed_event(&db, &seed, "sha-2", "octocat", now, None).await;
        seed_event(&db, &seed, "sha-3", "someone-else", now, Some("not hers")).await;

        let retriever = ActivityRetriever::new(db);
        let activity = retriever
            .member_activity(&window_query(&seed))
            .await
            .unwrap();

        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].summary, "enriched");
    }

    #[tokio::test]
    async fn missing_identity_yields_empty_result() {
        let db = setup_db().await;
        let seed = seed_member(&db, None).await;
        seed_event(&db, &seed, "sha-1", "octocat", Utc::now(), Some("s")).await;

        let retriever = ActivityRetriever::new(db);
        let activity = retriever
            .member_activity(&window_query(&seed))
            .await
            .unwrap();

        assert!(activity.is_empty());
    }

    #[tokio::test]
    async fn unknown_member_is_an_error() {
        let db = setup_db().await;
        let seed = seed_member(&db, Some("octocat")).await;

        let mut query = window_query(&seed);
        query.member_id = Uuid::new_v4();

        let retriever = ActivityRetriever::new(db);
        let err = retriever.member_activity(&query).await.unwrap_err();
        assert!(matches!(err, RetrievalError::MemberNotFound(_)));
    }

    #[tokio::test]
    async fn window_bounds_and_entity_filter_apply() {
        let db = setup_db().await;
        let seed = seed_member(&db, Some("octocat")).await;
        let now = Utc::now();

        seed_event(&db, &seed, "sha-old", "octocat", now - Duration::days(10), Some("old")).await;
        seed_event(&db, &seed, "sha-new", "octocat", now, Some("new")).await;

        let retriever = ActivityRetriever::new(db);
        let activity = retriever
            .member_activity(&window_query(&seed))
            .await
            .unwrap();
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].summary, "new");

        let mut scoped = window_query(&seed);
        scoped.entity_external_id = Some("another-repo".to_string());
        let activity = retriever.member_activity(&scoped).await.unwrap();
        assert!(activity.is_empty());
    }
}
