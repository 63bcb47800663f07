//! Interval scheduler for sync runs.
//!
//! Each tick lists integrations whose claim is free or stale and starts a run
//! for each, bounded by a semaphore so a large tenant cannot monopolize the
//! pool. The `sync_id` claim is the source of truth for exclusivity; the
//! scheduler merely avoids spawning runs that would obviously lose it.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::repositories::integration::IntegrationRepository;
use crate::sync::orchestrator::SyncOrchestrator;

pub struct SyncScheduler {
    db: sea_orm::DatabaseConnection,
    orchestrator: Arc<SyncOrchestrator>,
    config: SyncConfig,
    permits: Arc<Semaphore>,
}

impl SyncScheduler {
    pub fn new(
        db: sea_orm::DatabaseConnection,
        orchestrator: Arc<SyncOrchestrator>,
        config: SyncConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency as usize));
        Self {
            db,
            orchestrator,
            config,
            permits,
        }
    }

    /// Tick loop until shutdown is requested. Runs started before shutdown
    /// finish on their own tasks.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.tick_seconds));
        info!(
            tick_seconds = self.config.tick_seconds,
            concurrency = self.config.concurrency,
            "sync scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("sync scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "scheduler tick failed");
                    }
                }
            }
        }
    }

    /// Start a run for every claimable integration. Returns how many runs
    /// were spawned this tick.
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let repo = IntegrationRepository::new(&self.db);
        let due = repo.list_claimable(self.config.stale_run_minutes).await?;
        let spawned = due.len();

        for integration in due {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let orchestrator = Arc::clone(&self.orchestrator);

            tokio::spawn(async move {
                let _permit = permit;
                match orchestrator.sync_integration(integration.id).await {
                    Ok(outcome) => {
                        tracing::debug!(
                            integration_id = %integration.id,
                            provider = %integration.provider,
                            ?outcome,
                            "scheduled sync finished"
                        );
                    }
                    Err(err) => {
                        warn!(
                            integration_id = %integration.id,
                            provider = %integration.provider,
                            error = %err,
                            "scheduled sync errored"
                        );
                    }
                }
            });
        }

        Ok(spawned)
    }
}
