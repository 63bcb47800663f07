//! End to end coverage of the sync, enrichment and retrieval pipeline over
//! an in-memory database, with stubbed provider and AI backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, Set};
use uuid::Uuid;

use syncline::ai::{AiError, Embedder, TextGenerator};
use syncline::config::{EnrichmentConfig, SyncConfig};
use syncline::enrichment::queue::EnrichmentQueue;
use syncline::enrichment::worker::EnrichmentWorker;
use syncline::models::{enrichment_queue, event, event_vector, integration, member, organization};
use syncline::providers::error::SyncError;
use syncline::providers::github::{
    GithubApi, GithubCommit, GithubRepo, GithubSync, GithubUser,
};
use syncline::providers::{ProviderAuth, ProviderRegistry};
use syncline::retrieval::{ActivityRetriever, ActivitySource, MemberActivityQuery};
use syncline::sync::fetcher::Page;
use syncline::sync::orchestrator::{SyncOrchestrator, SyncOutcome};

struct StubGithub {
    repos: Vec<&'static str>,
    commits: Vec<GithubCommit>,
    repo_errors: HashMap<&'static str, SyncError>,
}

impl StubGithub {
    fn with_commits(commits: Vec<GithubCommit>) -> Self {
        Self {
            repos: vec!["widgets"],
            commits,
            repo_errors: HashMap::new(),
        }
    }

    fn commit(sha: &str, author: &str, committed_at: DateTime<Utc>) -> GithubCommit {
        GithubCommit {
            sha: sha.to_string(),
            author_login: Some(author.to_string()),
            committed_at,
            raw: serde_json::json!({"sha": sha, "message": format!("change {}", sha)}),
        }
    }
}

#[async_trait]
impl GithubApi for StubGithub {
    async fn list_repositories(
        &self,
        _auth: &ProviderAuth,
        _page: u64,
    ) -> Result<Page<GithubRepo>, SyncError> {
        Ok(Page {
            items: self
                .repos
                .iter()
                .map(|name| GithubRepo {
                    external_id: format!("id-{}", name),
                    name: name.to_string(),
                    raw: serde_json::json!({"name": name}),
                })
                .collect(),
            next: None,
        })
    }

    async fn list_members(
        &self,
        _auth: &ProviderAuth,
        _page: u64,
    ) -> Result<Page<GithubUser>, SyncError> {
        Ok(Page {
            items: vec![GithubUser {
                login: "octocat".to_string(),
                raw: serde_json::json!({"login": "octocat"}),
            }],
            next: None,
        })
    }

    async fn list_commits(
        &self,
        _auth: &ProviderAuth,
        repo: &str,
        _page: u64,
    ) -> Result<Page<GithubCommit>, SyncError> {
        if let Some(error) = self.repo_errors.get(repo) {
            return Err(error.clone());
        }
        // Newest first, as the real API returns them.
        let mut commits = self.commits.clone();
        commits.sort_by(|a, b| b.committed_at.cmp(&a.committed_at));
        Ok(Page {
            items: commits,
            next: None,
        })
    }
}

struct CountingGenerator {
    calls: AtomicUsize,
    reply: String,
}

#[async_trait]
impl TextGenerator for CountingGenerator {
    async fn generate(&self, _system: &str, _prompt: &str) -> Result<String, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

struct StubEmbedder {
    dimension: usize,
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, AiError> {
        Ok(vec![0.5; self.dimension])
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

struct Harness {
    db: DatabaseConnection,
    organization_id: Uuid,
    integration_id: Uuid,
    member_id: Uuid,
}

async fn setup(sync_finished_at: Option<DateTime<Utc>>) -> Harness {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("connect sqlite");
    Migrator::up(&db, None).await.expect("run migrations");

    let now = Utc::now();
    let organization_id = Uuid::new_v4();
    organization::ActiveModel {
        id: Set(organization_id),
        name: Set("acme".to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&db)
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
        sync_finished_at: Set(sync_finished_at),
        sync_updated_at: Set(None),
        sync_step: Set(None),
        sync_error: Set(None),
        sync_error_at: Set(None),
        delete_id: Set(None),
        delete_error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&db)
    .await
    .unwrap();

    let member_id = Uuid::new_v4();
    member::ActiveModel {
        id: Set(member_id),
        organization_id: Set(organization_id),
        display_name: Set("Dana".to_string()),
        github_login: Set(Some("octocat".to_string())),
        discord_user_id: Set(None),
        figma_user_id: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&db)
    .await
    .unwrap();

    Harness {
        db,
        organization_id,
        integration_id,
        member_id,
    }
}

fn orchestrator_for(db: &DatabaseConnection, stub: StubGithub) -> SyncOrchestrator {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(GithubSync::new(stub)));
    let config = SyncConfig {
        backoff_base_seconds: 0,
        jitter_factor: 0.0,
        step_max_attempts: 2,
        ..SyncConfig::default()
    };
    SyncOrchestrator::new(db.clone(), registry, config)
}

fn worker_for(
    db: &DatabaseConnection,
    generator: Arc<CountingGenerator>,
    max_attempts: i32,
) -> EnrichmentWorker {
    let config = EnrichmentConfig {
        retry_delay_seconds: 0,
        max_attempts,
        ..EnrichmentConfig::default()
    };
    EnrichmentWorker::new(
        db.clone(),
        generator,
        Arc::new(StubEmbedder { dimension: 4 }),
        config,
        4,
    )
}

async fn event_count(db: &DatabaseConnection) -> u64 {
    event::Entity::find().count(db).await.unwrap()
}

async fn vector_count(db: &DatabaseConnection) -> u64 {
    event_vector::Entity::find().count(db).await.unwrap()
}

#[tokio::test]
async fn sync_enrich_retrieve_round_trip() {
    let harness = setup(None).await;
    let now = Utc::now();

    let stub = StubGithub::with_commits(vec![
        StubGithub::commit("sha-1", "octocat", now - Duration::hours(6)),
        StubGithub::commit("sha-2", "octocat", now - Duration::hours(3)),
    ]);
    let orchestrator = orchestrator_for(&harness.db, stub);

    let outcome = orchestrator
        .sync_integration(harness.integration_id)
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Completed);
    assert_eq!(event_count(&harness.db).await, 2);

    let generator = Arc::new(CountingGenerator {
        calls: AtomicUsize::new(0),
        reply: "did some work".to_string(),
    });
    let worker = worker_for(&harness.db, generator.clone(), 5);
    worker.tick().await.unwrap();

    assert_eq!(vector_count(&harness.db).await, 2);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

    let retriever = ActivityRetriever::new(harness.db.clone());
    let activity = retriever
        .member_activity(&MemberActivityQuery {
            organization_id: harness.organization_id,
            member_id: harness.member_id,
            provider: "github".to_string(),
            from: now - Duration::days(1),
            to: now + Duration::days(1),
            entity_external_id: None,
        })
        .await
        .unwrap();

    assert_eq!(activity.len(), 2);
    assert_eq!(activity[0].external_id, "sha-1");
    assert_eq!(activity[1].external_id, "sha-2");
    assert!(activity.iter().all(|a| a.summary == "did some work"));
}

#[tokio::test]
async fn resync_is_idempotent_end_to_end() {
    let harness = setup(None).await;
    let now = Utc::now();
    let commits = vec![
        StubGithub::commit("sha-1", "octocat", now - Duration::hours(6)),
        StubGithub::commit("sha-2", "octocat", now - Duration::hours(3)),
    ];

    let generator = Arc::new(CountingGenerator {
        calls: AtomicUsize::new(0),
        reply: "did some work".to_string(),
    });

    for _ in 0..2 {
        let stub = StubGithub::with_commits(commits.clone());
        let orchestrator = orchestrator_for(&harness.db, stub);
        let outcome = orchestrator
            .sync_integration(harness.integration_id)
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::Completed);

        let worker = worker_for(&harness.db, generator.clone(), 5);
        while worker.tick().await.unwrap() > 0 {}
    }

    // Same external ids collapse onto the same rows, and redelivered queue
    // messages hit the already-enriched guard instead of the AI backend.
    assert_eq!(event_count(&harness.db).await, 2);
    assert_eq!(vector_count(&harness.db).await, 2);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn only_events_after_the_cutoff_are_ingested() {
    let cutoff = Utc::now() - Duration::days(2);
    let harness = setup(Some(cutoff)).await;

    let stub = StubGithub::with_commits(vec![
        StubGithub::commit("sha-old", "octocat", cutoff - Duration::hours(1)),
        StubGithub::commit("sha-at", "octocat", cutoff),
        StubGithub::commit("sha-new", "octocat", cutoff + Duration::hours(1)),
    ]);
    let orchestrator = orchestrator_for(&harness.db, stub);
    orchestrator
        .sync_integration(harness.integration_id)
        .await
        .unwrap();

    let external_ids: Vec<String> = event::Entity::find()
        .all(&harness.db)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.external_id)
        .collect();
    assert_eq!(external_ids, vec!["sha-new".to_string()]);

    let queued = enrichment_queue::Entity::find()
        .count(&harness.db)
        .await
        .unwrap();
    assert_eq!(queued, 1);
}

#[tokio::test]
async fn one_broken_repository_does_not_block_the_others() {
    let harness = setup(None).await;
    let now = Utc::now();

    let mut stub = StubGithub::with_commits(vec![StubGithub::commit(
        "sha-good",
        "octocat",
        now - Duration::hours(1),
    )]);
    stub.repos = vec!["widgets", "flaky"];
    stub.repo_errors
        .insert("flaky", SyncError::transient("secondary rate limit"));

    let outcome = orchestrator_for(&harness.db, stub)
        .sync_integration(harness.integration_id)
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Completed);

    let events = event::Entity::find().all(&harness.db).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].external_id, "sha-good");
    assert_eq!(events[0].entity_external_id.as_deref(), Some("id-widgets"));
}

#[tokio::test]
async fn revoked_credentials_fail_the_run_and_record_the_error() {
    let harness = setup(None).await;

    let mut stub = StubGithub::with_commits(vec![]);
    stub.repo_errors
        .insert("widgets", SyncError::unauthorized("token revoked"));

    let outcome = orchestrator_for(&harness.db, stub)
        .sync_integration(harness.integration_id)
        .await
        .unwrap();
    assert!(matches!(outcome, SyncOutcome::Failed(_)));

    let row = integration::Entity::find_by_id(harness.integration_id)
        .one(&harness.db)
        .await
        .unwrap()
        .unwrap();
    assert!(row.sync_id.is_none());
    assert_eq!(row.sync_step.as_deref(), Some("sync-events"));
    assert!(row.sync_error.unwrap().contains("unauthorized"));
    assert!(row.sync_finished_at.is_none());

    // Entities from the completed steps survive the failed one.
    let entities = syncline::models::external_entity::Entity::find()
        .count(&harness.db)
        .await
        .unwrap();
    assert_eq!(entities, 2);
    assert_eq!(event_count(&harness.db).await, 0);
}

#[tokio::test]
async fn empty_summaries_dead_letter_after_the_retry_ceiling() {
    let harness = setup(None).await;
    let now = Utc::now();

    let stub = StubGithub::with_commits(vec![StubGithub::commit(
        "sha-1",
        "octocat",
        now - Duration::hours(1),
    )]);
    orchestrator_for(&harness.db, stub)
        .sync_integration(harness.integration_id)
        .await
        .unwrap();

    let generator = Arc::new(CountingGenerator {
        calls: AtomicUsize::new(0),
        reply: "   ".to_string(),
    });
    let worker = worker_for(&harness.db, generator.clone(), 2);

    worker.tick().await.unwrap();
    worker.tick().await.unwrap();

    let message = enrichment_queue::Entity::find()
        .one(&harness.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.status, enrichment_queue::STATUS_DEAD);
    assert_eq!(message.attempts, 2);

    assert_eq!(vector_count(&harness.db).await, 0);
    let event_row = event::Entity::find()
        .one(&harness.db)
        .await
        .unwrap()
        .unwrap();
    assert!(event_row.enrich_error.is_some());
}

#[tokio::test]
async fn contended_claim_admits_exactly_one_run() {
    let harness = setup(None).await;
    let now = Utc::now();

    let make_orchestrator = || {
        orchestrator_for(
            &harness.db,
            StubGithub::with_commits(vec![StubGithub::commit(
                "sha-1",
                "octocat",
                now - Duration::hours(1),
            )]),
        )
    };

    // Hold the claim, then show a competing run backs off.
    let holder = Uuid::new_v4();
    integration::Entity::update_many()
        .col_expr(integration::Column::SyncId, holder.into())
        .col_expr(integration::Column::SyncUpdatedAt, Utc::now().into())
        .filter(integration::Column::Id.eq(harness.integration_id))
        .exec(&harness.db)
        .await
        .unwrap();

    let outcome = make_orchestrator()
        .sync_integration(harness.integration_id)
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::ClaimHeld);

    // Release and run for real.
    integration::Entity::update_many()
        .col_expr(integration::Column::SyncId, Option::<Uuid>::None.into())
        .filter(integration::Column::Id.eq(harness.integration_id))
        .exec(&harness.db)
        .await
        .unwrap();

    let outcome = make_orchestrator()
        .sync_integration(harness.integration_id)
        .await
        .unwrap();
    assert_eq!(outcome, SyncOutcome::Completed);
    assert_eq!(event_count(&harness.db).await, 1);
}
