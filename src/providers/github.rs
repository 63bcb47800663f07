//! GitHub provider: repositories and members as reference entities, commits
//! as activity events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::instrument;

use super::error::{SyncError, SyncErrorKind};
use super::{ProviderAuth, ProviderSync, StepContext};
use crate::enrichment::queue::EnrichmentQueue;
use crate::repositories::event::{EventRecord, EventRepository};
use crate::repositories::external_entity::{EntityRecord, ExternalEntityRepository};
use crate::sync::fetcher::{Page, PageToken, ScanOrder, fetch_until_cutoff};

pub const SLUG: &str = "github";

const STEPS: &[&str] = &["sync-repositories", "sync-members", "sync-events"];
const DEFAULT_API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;

#[derive(Debug, Clone)]
pub struct GithubRepo {
    pub external_id: String,
    pub name: String,
    pub raw: JsonValue,
}

#[derive(Debug, Clone)]
pub struct GithubUser {
    pub login: String,
    pub raw: JsonValue,
}

#[derive(Debug, Clone)]
pub struct GithubCommit {
    pub sha: String,
    pub author_login: Option<String>,
    pub committed_at: DateTime<Utc>,
    pub raw: JsonValue,
}

/// GitHub REST surface used by the sync steps. Listings are offset paginated
/// and commits arrive newest first.
#[async_trait]
pub trait GithubApi: Send + Sync {
    async fn list_repositories(
        &self,
        auth: &ProviderAuth,
        page: u64,
    ) -> Result<Page<GithubRepo>, SyncError>;

    async fn list_members(
        &self,
        auth: &ProviderAuth,
        page: u64,
    ) -> Result<Page<GithubUser>, SyncError>;

    async fn list_commits(
        &self,
        auth: &ProviderAuth,
        repo: &str,
        page: u64,
    ) -> Result<Page<GithubCommit>, SyncError>;
}

pub struct GithubSync<A: GithubApi> {
    api: A,
}

impl<A: GithubApi> GithubSync<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    async fn sync_repositories(&self, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        let auth = ProviderAuth::from_credentials(&ctx.integration.credentials)?;
        let entities = ExternalEntityRepository::new(ctx.db);

        let mut page = 1u64;
        let mut pages = 0u32;
        loop {
            pages += 1;
            let batch = self.api.list_repositories(&auth, page).await?;
            let records = batch
                .items
                .into_iter()
                .map(|repo| EntityRecord {
                    kind: "repository".to_string(),
                    external_id: repo.external_id,
                    name: repo.name,
                    metadata: Some(repo.raw),
                })
                .collect();
            entities.upsert_batch(ctx.integration.id, records).await?;

            match batch.next {
                Some(PageToken::Offset(next)) if pages < ctx.sync.max_pages => page = next,
                _ => break,
            }
        }

        Ok(())
    }

    async fn sync_members(&self, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        let auth = ProviderAuth::from_credentials(&ctx.integration.credentials)?;
        let entities = ExternalEntityRepository::new(ctx.db);

        let mut page = 1u64;
        let mut pages = 0u32;
        loop {
            pages += 1;
            let batch = self.api.list_members(&auth, page).await?;
            let records = batch
                .items
                .into_iter()
                .map(|user| EntityRecord {
                    kind: "user".to_string(),
                    external_id: user.login.clone(),
                    name: user.login,
                    metadata: Some(user.raw),
                })
                .collect();
            entities.upsert_batch(ctx.integration.id, records).await?;

            match batch.next {
                Some(PageToken::Offset(next)) if pages < ctx.sync.max_pages => page = next,
                _ => break,
            }
        }

        Ok(())
    }

    #[instrument(skip(self, ctx), fields(integration_id = %ctx.integration.id))]
    async fn sync_events(&self, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        let auth = ProviderAuth::from_credentials(&ctx.integration.credentials)?;
        let entities = ExternalEntityRepository::new(ctx.db);
        let events = EventRepository::new(ctx.db);
        let queue = EnrichmentQueue::new(ctx.db);

        let repos = entities
            .list_by_kind(ctx.integration.id, "repository")
            .await?;

        for repo in repos {
            let fetched = fetch_until_cutoff(
                PageToken::Offset(1),
                ctx.cutoff,
                ctx.sync.max_pages,
                ScanOrder::NewestFirst,
                |commit: &GithubCommit| commit.committed_at,
                |token| {
                    let page = match token {
                        PageToken::Offset(page) => page,
                        _ => 1,
                    };
                    self.api.list_commits(&auth, &repo.name, page)
                },
            )
            .await;

            // One broken repository must not sink the rest of the step.
            let commits = match fetched {
                Ok(commits) => commits,
                Err(error) if matches!(error.kind, SyncErrorKind::Unauthorized) => {
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(repo = %repo.name, %error, "skipping repository");
                    metrics::counter!("sync_resources_skipped_total", "provider" => SLUG)
                        .increment(1);
                    continue;
                }
            };

            let records: Vec<EventRecord> = commits
                .into_iter()
                .map(|commit| EventRecord {
                    organization_id: ctx.integration.organization_id,
                    integration_id: ctx.integration.id,
                    provider: SLUG.to_string(),
                    external_id: commit.sha,
                    kind: "commit".to_string(),
                    actor_external_id: commit.author_login,
                    entity_external_id: Some(repo.external_id.clone()),
                    occurred_at: commit.committed_at,
                    payload: commit.raw,
                })
                .collect();

            let ids = events.upsert_batch(records).await?;
            queue.enqueue_events(&ids).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl<A: GithubApi> ProviderSync for GithubSync<A> {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, step: &str, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        match step {
            "sync-repositories" => self.sync_repositories(ctx).await,
            "sync-members" => self.sync_members(ctx).await,
            "sync-events" => self.sync_events(ctx).await,
            other => Err(SyncError::permanent(format!(
                "unknown github sync step: {}",
                other
            ))),
        }
    }
}

/// Thin reqwest-backed implementation of [`GithubApi`].
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
}

impl GithubClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn api_base(auth: &ProviderAuth) -> String {
        auth.api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string()
    }

    async fn get_json(&self, auth: &ProviderAuth, url: String) -> Result<JsonValue, SyncError> {
        let response = self
            .http
            .get(&url)
            .bearer_auth(&auth.token)
            .header(reqwest::header::USER_AGENT, "syncline")
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            let body = response.text().await.ok();
            return Err(SyncError::from_status(status.as_u16(), retry_after, body));
        }

        Ok(response.json().await?)
    }

    fn offset_next(len: usize, page: u64) -> Option<PageToken> {
        (len == PER_PAGE).then(|| PageToken::Offset(page + 1))
    }
}

fn str_field(value: &JsonValue, field: &str) -> Result<String, SyncError> {
    value[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| SyncError::transient(format!("github response missing field: {}", field)))
}

#[async_trait]
impl GithubApi for GithubClient {
    async fn list_repositories(
        &self,
        auth: &ProviderAuth,
        page: u64,
    ) -> Result<Page<GithubRepo>, SyncError> {
        let url = format!(
            "{}/orgs/{}/repos?per_page={}&page={}",
            Self::api_base(auth),
            auth.account,
            PER_PAGE,
            page
        );
        let values: Vec<JsonValue> = serde_json::from_value(self.get_json(auth, url).await?)
            .map_err(|e| SyncError::transient(format!("github repos response: {}", e)))?;

        let next = Self::offset_next(values.len(), page);
        let items = values
            .into_iter()
            .map(|raw| {
                Ok(GithubRepo {
                    external_id: raw["id"]
                        .as_i64()
                        .map(|id| id.to_string())
                        .ok_or_else(|| SyncError::transient("github repo missing id"))?,
                    name: str_field(&raw, "name")?,
                    raw,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        Ok(Page { items, next })
    }

    async fn list_members(
        &self,
        auth: &ProviderAuth,
        page: u64,
    ) -> Result<Page<GithubUser>, SyncError> {
        let url = format!(
            "{}/orgs/{}/members?per_page={}&page={}",
            Self::api_base(auth),
            auth.account,
            PER_PAGE,
            page
        );
        let values: Vec<JsonValue> = serde_json::from_value(self.get_json(auth, url).await?)
            .map_err(|e| SyncError::transient(format!("github members response: {}", e)))?;

        let next = Self::offset_next(values.len(), page);
        let items = values
            .into_iter()
            .map(|raw| {
                Ok(GithubUser {
                    login: str_field(&raw, "login")?,
                    raw,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        Ok(Page { items, next })
    }

    async fn list_commits(
        &self,
        auth: &ProviderAuth,
        repo: &str,
        page: u64,
    ) -> Result<Page<GithubCommit>, SyncError> {
        let url = format!(
            "{}/repos/{}/{}/commits?per_page={}&page={}",
            Self::api_base(auth),
            auth.account,
            repo,
            PER_PAGE,
            page
        );
        let values: Vec<JsonValue> = serde_json::from_value(self.get_json(auth, url).await?)
            .map_err(|e| SyncError::transient(format!("github commits response: {}", e)))?;

        let next = Self::offset_next(values.len(), page);
        let items = values
            .into_iter()
            .map(|raw| {
                let committed_at = raw["commit"]["author"]["date"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok_or_else(|| SyncError::transient("github commit missing author date"))?;
                Ok(GithubCommit {
                    sha: str_field(&raw, "sha")?,
                    author_login: raw["author"]["login"].as_str().map(str::to_string),
                    committed_at,
                    raw,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        Ok(Page { items, next })
    }
}
