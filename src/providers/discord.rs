//! Discord provider: guild channels and members as reference entities,
//! messages as activity events.
//!
//! Incremental message fetches use snowflake `after` boundaries derived from
//! the cutoff timestamp, so pages arrive oldest first and are already
//! bounded on the provider side.

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
use crate::sync::snowflake;

pub const SLUG: &str = "discord";

const STEPS: &[&str] = &["sync-channels", "sync-members", "sync-events"];
const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const MESSAGE_PAGE_LIMIT: usize = 100;
const MEMBER_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct DiscordChannel {
    pub id: String,
    pub name: String,
    pub raw: JsonValue,
}

#[derive(Debug, Clone)]
pub struct DiscordMember {
    pub user_id: String,
    pub display_name: String,
    pub raw: JsonValue,
}

#[derive(Debug, Clone)]
pub struct DiscordMessage {
    pub id: String,
    pub author_id: String,
    pub sent_at: DateTime<Utc>,
    pub raw: JsonValue,
}

/// Discord REST surface used by the sync steps.
#[async_trait]
pub trait DiscordApi: Send + Sync {
    /// Guild channels; the listing is not paginated.
    async fn list_channels(&self, auth: &ProviderAuth) -> Result<Vec<DiscordChannel>, SyncError>;

    /// Guild members after the given user snowflake, ascending.
    async fn list_members(
        &self,
        auth: &ProviderAuth,
        after: u64,
    ) -> Result<Page<DiscordMember>, SyncError>;

    /// Channel messages after the given message snowflake, ascending.
    async fn list_messages(
        &self,
        auth: &ProviderAuth,
        channel_id: &str,
        after: u64,
    ) -> Result<Page<DiscordMessage>, SyncError>;
}

pub struct DiscordSync<A: DiscordApi> {
    api: A,
}

impl<A: DiscordApi> DiscordSync<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    async fn sync_channels(&self, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        let auth = ProviderAuth::from_credentials(&ctx.integration.credentials)?;
        let entities = ExternalEntityRepository::new(ctx.db);

        let channels = self.api.list_channels(&auth).await?;
        let records = channels
            .into_iter()
            .map(|channel| EntityRecord {
                kind: "channel".to_string(),
                external_id: channel.id,
                name: channel.name,
                metadata: Some(channel.raw),
            })
            .collect();
        entities.upsert_batch(ctx.integration.id, records).await?;

        Ok(())
    }

    async fn sync_members(&self, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        let auth = ProviderAuth::from_credentials(&ctx.integration.credentials)?;
        let entities = ExternalEntityRepository::new(ctx.db);

        let mut after = 0u64;
        let mut pages = 0u32;
        loop {
            pages += 1;
            let batch = self.api.list_members(&auth, after).await?;
            let records = batch
                .items
                .into_iter()
                .map(|member| EntityRecord {
                    kind: "user".to_string(),
                    external_id: member.user_id,
                    name: member.display_name,
                    metadata: Some(member.raw),
                })
                .collect();
            entities.upsert_batch(ctx.integration.id, records).await?;

            match batch.next {
                Some(PageToken::Snowflake(next)) if pages < ctx.sync.max_pages => after = next,
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

        let cutoff_snowflake = snowflake::from_timestamp(ctx.cutoff);
        let channels = entities.list_by_kind(ctx.integration.id, "channel").await?;

        for channel in channels {
            let fetched = fetch_until_cutoff(
                PageToken::Snowflake(cutoff_snowflake),
                ctx.cutoff,
                ctx.sync.max_pages,
                ScanOrder::OldestFirst,
                |message: &DiscordMessage| message.sent_at,
                |token| {
                    let after = match token {
                        PageToken::Snowflake(after) => after,
                        _ => cutoff_snowflake,
                    };
                    self.api.list_messages(&auth, &channel.external_id, after)
                },
            )
            .await;

            // One broken channel must not sink the rest of the step.
            let messages = match fetched {
                Ok(messages) => messages,
                Err(error) if matches!(error.kind, SyncErrorKind::Unauthorized) => {
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(channel = %channel.external_id, %error, "skipping channel");
                    metrics::counter!("sync_resources_skipped_total", "provider" => SLUG)
                        .increment(1);
                    continue;
                }
            };

            let records: Vec<EventRecord> = messages
                .into_iter()
                .map(|message| EventRecord {
                    organization_id: ctx.integration.organization_id,
                    integration_id: ctx.integration.id,
                    provider: SLUG.to_string(),
                    external_id: message.id,
                    kind: "message".to_string(),
                    actor_external_id: Some(message.author_id),
                    entity_external_id: Some(channel.external_id.clone()),
                    occurred_at: message.sent_at,
                    payload: message.raw,
                })
                .collect();

            let ids = events.upsert_batch(records).await?;
            queue.enqueue_events(&ids).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl<A: DiscordApi> ProviderSync for DiscordSync<A> {
    fn slug(&self) -> &'static str {
        SLUG
    }

    fn steps(&self) -> &'static [&'static str] {
        STEPS
    }

    async fn run_step(&self, step: &str, ctx: &StepContext<'_>) -> Result<(), SyncError> {
        match step {
            "sync-channels" => self.sync_channels(ctx).await,
            "sync-members" => self.sync_members(ctx).await,
            "sync-events" => self.sync_events(ctx).await,
            other => Err(SyncError::permanent(format!(
                "unknown discord sync step: {}",
                other
            ))),
        }
    }
}

/// Thin reqwest-backed implementation of [`DiscordApi`].
#[derive(Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
}

impl DiscordClient {
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
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bot {}", auth.token),
            )
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
        .ok_or_else(|| SyncError::transient(format!("discord response missing field: {}", field)))
}

fn max_snowflake<'a>(ids: impl Iterator<Item = &'a str>) -> Option<u64> {
    ids.filter_map(|id| id.parse::<u64>().ok()).max()
}

#[async_trait]
impl DiscordApi for DiscordClient {
    async fn list_channels(&self, auth: &ProviderAuth) -> Result<Vec<DiscordChannel>, SyncError> {
        let url = format!(
            "{}/guilds/{}/channels",
            Self::api_base(auth),
            auth.account
        );
        let values: Vec<JsonValue> = serde_json::from_value(self.get_json(auth, url).await?)
            .map_err(|e| SyncError::transient(format!("discord channels response: {}", e)))?;

        values
            .into_iter()
            .map(|raw| {
                Ok(DiscordChannel {
                    id: str_field(&raw, "id")?,
                    name: str_field(&raw, "name")?,
                    raw,
                })
            })
            .collect()
    }

    async fn list_members(
        &self,
        auth: &ProviderAuth,
        after: u64,
    ) -> Result<Page<DiscordMember>, SyncError> {
        let url = format!(
            "{}/guilds/{}/members?limit={}&after={}",
            Self::api_base(auth),
            auth.account,
            MEMBER_PAGE_LIMIT,
            after
        );
        let values: Vec<JsonValue> = serde_json::from_value(self.get_json(auth, url).await?)
            .map_err(|e| SyncError::transient(format!("discord members response: {}", e)))?;

        let full_page = values.len() == MEMBER_PAGE_LIMIT;
        let items = values
            .into_iter()
            .map(|raw| {
                let user_id = raw["user"]["id"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| SyncError::transient("discord member missing user id"))?;
                let display_name = raw["nick"]
                    .as_str()
                    .or_else(|| raw["user"]["username"].as_str())
                    .unwrap_or(&user_id)
                    .to_string();
                Ok(DiscordMember {
                    user_id,
                    display_name,
                    raw,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        let next = full_page
            .then(|| max_snowflake(items.iter().map(|m| m.user_id.as_str())))
            .flatten()
            .map(PageToken::Snowflake);

        Ok(Page { items, next })
    }

    async fn list_messages(
        &self,
        auth: &ProviderAuth,
        channel_id: &str,
        after: u64,
    ) -> Result<Page<DiscordMessage>, SyncError> {
        let url = format!(
            "{}/channels/{}/messages?limit={}&after={}",
            Self::api_base(auth),
            channel_id,
            MESSAGE_PAGE_LIMIT,
            after
        );
        let values: Vec<JsonValue> = serde_json::from_value(self.get_json(auth, url).await?)
            .map_err(|e| SyncError::transient(format!("discord messages response: {}", e)))?;

        let full_page = values.len() == MESSAGE_PAGE_LIMIT;
        let items = values
            .into_iter()
            .map(|raw| {
                let id = str_field(&raw, "id")?;
                let author_id = raw["author"]["id"]
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| SyncError::transient("discord message missing author id"))?;
                let sent_at = raw["timestamp"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    // Snowflakes embed the creation time, so a missing
                    // timestamp field still decodes.
                    .or_else(|| id.parse::<u64>().ok().map(snowflake::to_timestamp))
                    .ok_or_else(|| SyncError::transient("discord message missing timestamp"))?;
                Ok(DiscordMessage {
                    id,
                    author_id,
                    sent_at,
                    raw,
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        let next = full_page
            .then(|| max_snowflake(items.iter().map(|m| m.id.as_str())))
            .flatten()
            .map(PageToken::Snowflake);

        Ok(Page { items, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::error::SyncErrorKind;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth_for(server: &MockServer) -> ProviderAuth {
        ProviderAuth {
            token: "bot-token".to_string(),
            account: "9000".to_string(),
            api_base: Some(server.uri()),
        }
    }

    #[tokio::test]
    async fn list_messages_parses_author_and_timestamp() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/1234/messages"))
            .and(query_param("after", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "id": "175928847299117063",
                    "author": {"id": "42"},
                    "timestamp": "2016-04-30T11:18:25.796Z",
                    "content": "hello"
                }
            ])))
            .mount(&server)
            .await;

        let client = DiscordClient::new(reqwest::Client::new());
        let page = client
            .list_messages(&auth_for(&server), "1234", 0)
            .await
            .unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].author_id, "42");
        assert_eq!(page.items[0].sent_at.timestamp_millis(), 1462015105796);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn rate_limited_guild_listing_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/guilds/9000/channels"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_string("rate limited"),
            )
            .mount(&server)
            .await;

        let client = DiscordClient::new(reqwest::Client::new());
        let err = client.list_channels(&auth_for(&server)).await.unwrap_err();

        assert!(matches!(
            err.kind,
            SyncErrorKind::RateLimited {
                retry_after_secs: Some(7)
            }
        ));
    }
}
