//! Figma provider: team projects and files as reference entities, file
//! comments as activity events.

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

pub const SLUG: &str = "figma";

const STEPS: &[&str] = &["sync-projects", "sync-files", "sync-events"];
const DEFAULT_API_BASE: &str = "https://api.figma.com/v1";

#[derive(Debug, Clone)]
pub struct FigmaProject {
    pub id: String,
    pub name: String,
    pub raw: JsonValue,
}

#[derive(Debug, Clone)]
pub struct FigmaFile {
    pub key: String,
    pub name: String,
    pub raw: JsonValue,
}

#[derive(Debug, Clone)]
pub struct FigmaComment {
    pub id: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub raw: JsonValue,
}

/// Figma REST surface used by the sync steps. Comments are cursor paginated
/// and arrive newest first.
#[async_trait]
pub trait FigmaApi: Send + Sync {
    async fn list_projects(&self, auth: &ProviderAuth) -> Result<Vec<FigmaProject>, SyncError>;

    async fn list_files(
        &self,
        auth: &ProviderAuth,
        project_id: &str,
    ) -> Result<Vec<FigmaFile>, SyncError>;

    async fn list_comments(
        &self,
        auth: &ProviderAuth,
        file_key: &str,
        cursor: Option<String>,
    ) -> Result<Page<FigmaComment>, SyncError>;
}

pub struct FigmaSync<A: FigmaApi> {
    api: A,
}

impl<A: FigmaApi> FigmaSync<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    async fn sync_projects(&self, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        let auth = ProviderAuth::from_credentials(&ctx.integration.credentials)?;
        let entities = ExternalEntityRepository::new(ctx.db);

        let projects = self.api.list_projects(&auth).await?;
        let records = projects
            .into_iter()
            .map(|project| EntityRecord {
                kind: "project".to_string(),
                external_id: project.id,
                name: project.name,
                metadata: Some(project.raw),
            })
            .collect();
        entities.upsert_batch(ctx.integration.id, records).await?;

        Ok(())
    }

    async fn sync_files(&self, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        let auth = ProviderAuth::from_credentials(&ctx.integration.credentials)?;
        let entities = ExternalEntityRepository::new(ctx.db);

        let projects = entities.list_by_kind(ctx.integration.id, "project").await?;
        for project in projects {
            let files = self.api.list_files(&auth, &project.external_id).await?;
            let records = files
                .into_iter()
                .map(|file| EntityRecord {
                    kind: "file".to_string(),
                    external_id: file.key,
                    name: file.name,
                    metadata: Some(file.raw),
                })
                .collect();
            entities.upsert_batch(ctx.integration.id, records).await?;
        }

        Ok(())
    }

    #[instrument(skip(self, ctx), fields(integration_id = %ctx.integration.id))]
    async fn sync_events(&self, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        let auth = ProviderAuth::from_credentials(&ctx.integration.credentials)?;
        let entities = ExternalEntityRepository::new(ctx.db);
        let events = EventRepository::new(ctx.db);
        let queue = EnrichmentQueue::new(ctx.db);

        let files = entities.list_by_kind(ctx.integration.id, "file").await?;

        for file in files {
            let fetched = fetch_until_cutoff(
                PageToken::Cursor(String::new()),
                ctx.cutoff,
                ctx.sync.max_pages,
                ScanOrder::NewestFirst,
                |comment: &FigmaComment| comment.created_at,
                |token| {
                    let cursor = match token {
                        PageToken::Cursor(cursor) if !cursor.is_empty() => Some(cursor),
                        _ => None,
                    };
                    self.api.list_comments(&auth, &file.external_id, cursor)
                },
            )
            .await;

            // One broken file must not sink the rest of the step.
            let comments = match fetched {
                Ok(comments) => comments,
                Err(error) if matches!(error.kind, SyncErrorKind::Unauthorized) => {
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(file = %file.external_id, %error, "skipping figma file");
                    metrics::counter!("sync_resources_skipped_total", "provider" => SLUG)
                        .increment(1);
                    continue;
                }
            };

            let records: Vec<EventRecord> = comments
                .into_iter()
                .map(|comment| EventRecord {
                    organization_id: ctx.integration.organization_id,
                    integration_id: ctx.integration.id,
                    provider: SLUG.to_string(),
                    external_id: comment.id,
                    kind: "comment".to_string(),
                    actor_external_id: comment.user_id,
                    entity_external_id: Some(file.external_id.clone()),
                    occurred_at: comment.created_at,
                    payload: comment.raw,
                })
                .collect();

            let ids = events.upsert_batch(records).await?;
            queue.enqueue_events(&ids).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl<A: FigmaApi> ProviderSync for FigmaSync<A> {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, step: &str, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        match step {
            "sync-projects" => self.sync_projects(ctx).await,
            "sync-files" => self.sync_files(ctx).await,
            "sync-events" => self.sync_events(ctx).await,
            other => Err(SyncError::permanent(format!(
                "unknown figma sync step: {}",
                other
            ))),
        }
    }
}

/// Thin reqwest-backed implementation of [`FigmaApi`].
#[derive(Clone)]
pub struct FigmaClient {
    http: reqwest::Client,
}

impl FigmaClient {
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
            .header("X-Figma-Token", &auth.token)
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
}

fn str_field(value: &JsonValue, field: &str) -> Result<String, SyncError> {
    value[field]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| SyncError::transient(format!("figma response missing field: {}", field)))
}

#[async_trait]
impl FigmaApi for FigmaClient {
    async fn list_projects(&self, auth: &ProviderAuth) -> Result<Vec<FigmaProject>, SyncError> {
        let url = format!(
            "{}/teams/{}/projects",
            Self::api_base(auth),
            auth.account
        );
        let body = self.get_json(auth, url).await?;
        let values: Vec<JsonValue> = serde_json::from_value(body["projects"].clone())
            .map_err(|e| SyncError::transient(format!("figma projects response: {}", e)))?;

        values
            .into_iter()
            .map(|raw| {
                // Project ids are numbers in some responses and strings in
                // others.
                let id = raw["id"]
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| raw["id"].as_i64().map(|id| id.to_string()))
                    .ok_or_else(|| SyncError::transient("figma project missing id"))?;
                Ok(FigmaProject {
                    id,
                    name: str_field(&raw, "name")?,
                    raw,
                })
            })
            .collect()
    }

    async fn list_files(
        &self,
        auth: &ProviderAuth,
        project_id: &str,
    ) -> Result<Vec<FigmaFile>, SyncError> {
        let url = format!(
            "{}/projects/{}/files",
            Self::api_base(auth),
            project_id
        );
        let body = self.get_json(auth, url).await?;
        let values: Vec<JsonValue> = serde_json::from_value(body["files"].clone())
            .map_err(|e| SyncError::transient(format!("figma files response: {}", e)))?;

        values
            .into_iter()
            .map(|raw| {
                Ok(FigmaFile {
                    key: str_field(&raw, "key")?,
                    name: str_field(&raw, "name")?,
                    raw,
                })
            })
            .collect()
    }

    async fn list_comments(
        &self,
        auth: &ProviderAuth,
        file_key: &str,
        cursor: Option<String>,
    ) -> Result<Page<FigmaComment>, SyncError> {
        let mut url = format!("{}/files/{}/comments", Self::api_base(auth), file_key);
        if let Some(cursor) = &cursor {
            url.push_str(&format!("?cursor={}", cursor));
        }

        let body = self.get_json(auth, url).await?;
        let values: Vec<JsonValue> = serde_json::from_value(body["comments"].clone())
            .map_err(|e| SyncError::transient(format!("figma comments response: {}", e)))?;

        let items = values
            .into_iter()
            .map(|raw| {
                let created_at = raw["created_at"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .ok_or_else(|| SyncError::transient("figma comment missing created_at"))?;
                Ok(FigmaComment {
                    id: str_field(&raw, "id")?,
                    user_id: raw["user"]["id"].as_str().map(str::to_string),
                    created_at,
                    raw,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        let next = body["next_cursor"]
            .as_str()
            .filter(|cursor| !cursor.is_empty())
            .map(|cursor| PageToken::Cursor(cursor.to_string()));

        Ok(Page { items, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::error::SyncErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth_for(server: &MockServer) -> ProviderAuth {
        ProviderAuth {
            token: "figd-token".to_string(),
            account: "team-1".to_string(),
            api_base: Some(server.uri()),
        }
    }

    #[tokio::test]
    async fn list_comments_parses_and_carries_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/filekey/comments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "comments": [
                    {
                        "id": "c1",
                        "user": {"id": "u1", "handle": "dana"},
                        "created_at": "2024-06-15T08:00:00Z",
                        "message": "looks good"
                    }
                ],
                "next_cursor": "abc"
            })))
            .mount(&server)
            .await;

        let client = FigmaClient::new(reqwest::Client::new());
        let page = client
            .list_comments(&auth_for(&server), "filekey", None)
            .await
            .unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].user_id.as_deref(), Some("u1"));
        assert_eq!(page.next, Some(PageToken::Cursor("abc".to_string())));
    }

    #[tokio::test]
    async fn forbidden_team_maps_to_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/teams/team-1/projects"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let client = FigmaClient::new(reqwest::Client::new());
        let err = client.list_projects(&auth_for(&server)).await.unwrap_err();

        assert!(matches!(err.kind, SyncErrorKind::Unauthorized));
    }
}
