//! Provider sync implementations.
//!
//! Each provider declares an ordered list of named steps and executes them
//! one at a time under the orchestrator's control. Step names are durable:
//! they are written to the integration row as the run progresses, so an
//! operator can see exactly where a failed run stopped.

pub mod discord;
pub mod error;
pub mod figma;
pub mod github;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::Deserialize;

use crate::config::SyncConfig;
use crate::models::integration;
use error::SyncError;

/// Credentials stored on the integration row.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderAuth {
    /// API token for the provider.
    pub token: String,
    /// Provider-side account scope: GitHub org, Discord guild id, Figma team id.
    pub account: String,
    /// Base URL override, used against mock servers in tests.
    #[serde(default)]
    pub api_base: Option<String>,
}

impl ProviderAuth {
    pub fn from_credentials(credentials: &serde_json::Value) -> Result<Self, SyncError> {
        serde_json::from_value(credentials.clone())
            .map_err(|e| SyncError::permanent(format!("invalid integration credentials: {}", e)))
    }
}

/// Everything a sync step needs: the claimed integration, the incremental
/// cutoff and the shared pool.
pub struct StepContext<'a> {
    pub db: &'a DatabaseConnection,
    pub integration: &'a integration::Model,
    pub cutoff: DateTime<Utc>,
    pub sync: &'a SyncConfig,
}

#[async_trait]
pub trait ProviderSync: Send + Sync {
    /// Stable provider identifier, matching `integrations.provider`.
    fn slug(&self) -> &'static str;

    /// Ordered step names executed per run. The orchestrator appends its own
    /// finalize step after these.
    fn steps(&self) -> &'static [&'static str];

    /// Execute one named step to completion.
    async fn run_step(&self, step: &str, ctx: &StepContext<'_>) -> Result<(), SyncError>;
}

/// Slug-keyed lookup of provider implementations.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn ProviderSync>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry wired with the real HTTP clients for all supported providers.
    pub fn with_defaults(http: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(github::GithubSync::new(github::GithubClient::new(
            http.clone(),
        ))));
        registry.register(Arc::new(discord::DiscordSync::new(
            discord::DiscordClient::new(http.clone()),
        )));
        registry.register(Arc::new(figma::FigmaSync::new(figma::FigmaClient::new(
            http,
        ))));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn ProviderSync>) {
        self.providers.insert(provider.slug(), provider);
    }

    pub fn get(&self, slug: &str) -> Option<Arc<dyn ProviderSync>> {
        self.providers.get(slug).cloned()
    }

    pub fn slugs(&self) -> Vec<&'static str> {
        let mut slugs: Vec<_> = self.providers.keys().copied().collect();
        slugs.sort_unstable();
        slugs
    }
}
