//! Sync run orchestration.
//!
//! A run is claimed by conditionally writing `sync_id` on the integration
//! row, then the provider's named steps execute in order. Each step is
//! recorded before it starts so a failed run shows where it stopped, and
//! retried with exponential backoff while the error is retryable. On success
//! a finalize step advances `sync_finished_at` to the run's start time, which
//! becomes the next run's incremental cutoff. Using the start time leaves a
//! small overlap window; upserts and the queue's no-op guards absorb the
//! duplicates.

use std::time::{Duration, Instant};

use chrono::{Duration as TimeDelta, Utc};
use metrics::{counter, histogram};
use rand::{Rng, thread_rng};
use sea_orm::DatabaseConnection;
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::providers::error::{SyncError, SyncErrorKind};
use crate::providers::{ProviderRegistry, ProviderSync, StepContext};
use crate::repositories::RepositoryError;
use crate::repositories::integration::IntegrationRepository;

/// Step name recorded after all provider steps complete.
pub const FINALIZE_STEP: &str = "finalize";

/// Terminal state of one sync attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// All steps ran and the incremental cutoff advanced.
    Completed,
    /// Another run holds the claim and is still making progress.
    ClaimHeld,
    /// A step failed; the error is recorded on the integration row.
    Failed(SyncError),
}

/// Why a step did not complete. Losing the claim is a takeover, not a
/// failure, and must not be recorded on the integration row.
enum StepFailure {
    ClaimLost,
    Step(SyncError),
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("integration {0} not found")]
    IntegrationNotFound(Uuid),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct SyncOrchestrator {
    db: DatabaseConnection,
    registry: ProviderRegistry,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(db: DatabaseConnection, registry: ProviderRegistry, config: SyncConfig) -> Self {
        Self {
            db,
            registry,
            config,
        }
    }

    /// Run one full sync for an integration.
    #[instrument(skip(self), fields(integration_id = %integration_id))]
    pub async fn sync_integration(
        &self,
        integration_id: Uuid,
    ) -> Result<SyncOutcome, OrchestratorError> {
        let repo = IntegrationRepository::new(&self.db);

        let Some(existing) = repo.find_by_id(integration_id).await? else {
            return Err(OrchestratorError::IntegrationNotFound(integration_id));
        };
        let provider_slug = existing.provider.clone();

        let run_id = Uuid::new_v4();
        let run_started_at = Utc::now();
        let started = Instant::now();

        let Some(integration) = repo
            .claim_sync(integration_id, run_id, self.config.stale_run_minutes)
            .await?
        else {
            info!(provider = %provider_slug, "sync claim held by another run, skipping");
            counter!("sync_runs_total", "provider" => provider_slug, "outcome" => "claim_held")
                .increment(1);
            return Ok(SyncOutcome::ClaimHeld);
        };

        let Some(provider) = self.registry.get(&integration.provider) else {
            let error =
                SyncError::permanent(format!("no provider registered: {}", integration.provider));
            repo.fail_sync(integration_id, run_id, &error).await?;
            counter!("sync_runs_total", "provider" => provider_slug, "outcome" => "failed")
                .increment(1);
            return Ok(SyncOutcome::Failed(error));
        };

        // Events strictly newer than the cutoff are fetched. First run covers
        // a bounded lookback window instead of all history.
        let cutoff = integration
            .sync_finished_at
            .unwrap_or(run_started_at - TimeDelta::days(self.config.lookback_days));

        let ctx = StepContext {
            db: &self.db,
            integration: &integration,
            cutoff,
            sync: &self.config,
        };

        for step in provider.steps() {
            if !repo.record_step(integration_id, run_id, step).await? {
                warn!(step, "sync claim lost mid-run, stopping");
                return Ok(SyncOutcome::ClaimHeld);
            }

            match self
                .run_step_with_retry(&repo, provider.as_ref(), step, &ctx, run_id)
                .await
            {
                Ok(()) => {}
                Err(StepFailure::ClaimLost) => {
                    warn!(step, "sync claim lost during retry wait, stopping");
                    return Ok(SyncOutcome::ClaimHeld);
                }
                Err(StepFailure::Step(error)) => {
                    warn!(step, %error, "sync step failed, recording and releasing claim");
                    repo.fail_sync(integration_id, run_id, &error).await?;
                    counter!(
                        "sync_runs_total",
                        "provider" => provider.slug(),
                        "outcome" => "failed"
                    )
                    .increment(1);
                    return Ok(SyncOutcome::Failed(error));
                }
            }
        }

        if !repo.record_step(integration_id, run_id, FINALIZE_STEP).await?
            || !repo
                .finish_sync(integration_id, run_id, run_started_at)
                .await?
        {
            warn!("sync claim lost before finalize");
            return Ok(SyncOutcome::ClaimHeld);
        }

        let elapsed = started.elapsed().as_secs_f64();
        histogram!("sync_run_duration_seconds", "provider" => provider.slug()).record(elapsed);
        counter!("sync_runs_total", "provider" => provider.slug(), "outcome" => "completed")
            .increment(1);
        info!(provider = provider.slug(), elapsed_secs = elapsed, "sync run completed");

        Ok(SyncOutcome::Completed)
    }

    async fn run_step_with_retry(
        &self,
        repo: &IntegrationRepository<'_>,
        provider: &dyn ProviderSync,
        step: &str,
        ctx: &StepContext<'_>,
        run_id: Uuid,
    ) -> Result<(), StepFailure> {
        let mut attempt = 1u32;
        loop {
            match provider.run_step(step, ctx).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retryable() && attempt < self.config.step_max_attempts => {
                    let backoff = self.backoff_seconds(&error, attempt);
                    warn!(
                        step,
                        attempt,
                        backoff_secs = backoff,
                        %error,
                        "sync step failed, retrying"
                    );
                    counter!("sync_step_retries_total", "provider" => provider.slug())
                        .increment(1);
                    sleep(Duration::from_secs_f64(backoff)).await;

                    // Keep the claim out of the staleness window across the wait.
                    let still_held = repo
                        .touch_sync(ctx.integration.id, run_id)
                        .await
                        .map_err(|e| StepFailure::Step(e.into()))?;
                    if !still_held {
                        return Err(StepFailure::ClaimLost);
                    }
                    attempt += 1;
                }
                Err(error) => return Err(StepFailure::Step(error)),
            }
        }
    }

    /// Exponential backoff with jitter. A rate limit hint from the provider
    /// takes precedence when it is longer than the computed delay.
    fn backoff_seconds(&self, error: &SyncError, attempts_completed: u32) -> f64 {
        let base = self.config.backoff_base_seconds as f64;
        let max = self.config.backoff_max_seconds as f64;

        let mut backoff = (base * 2_f64.powi(attempts_completed as i32 - 1)).min(max);

        if let SyncErrorKind::RateLimited {
            retry_after_secs: Some(retry_after),
        } = &error.kind
        {
            backoff = backoff.max(*retry_after as f64);
        }

        let jitter_cap = self.config.jitter_factor * backoff;
        if jitter_cap > 0.0 {
            backoff += thread_rng().gen_range(0.0..jitter_cap);
        }
        backoff
    }

    /// Tear down an integration. The delete claim excludes concurrent syncs;
    /// entities, events and vectors follow via FK cascade.
    #[instrument(skip(self), fields(integration_id = %integration_id))]
    pub async fn delete_integration(
        &self,
        integration_id: Uuid,
    ) -> Result<bool, OrchestratorError> {
        let repo = IntegrationRepository::new(&self.db);

        if repo.find_by_id(integration_id).await?.is_none() {
            return Err(OrchestratorError::IntegrationNotFound(integration_id));
        }

        let run_id = Uuid::new_v4();
        if !repo.claim_delete(integration_id, run_id).await? {
            info!("delete claim unavailable, sync in flight or delete already running");
            return Ok(false);
        }

        match repo.delete(integration_id).await {
            Ok(()) => {
                counter!("integration_deletes_total", "outcome" => "completed").increment(1);
                info!("integration deleted");
                Ok(true)
            }
            Err(error) => {
                repo.fail_delete(integration_id, run_id, &error.to_string())
                    .await?;
                counter!("integration_deletes_total", "outcome" => "failed").increment(1);
                Err(error.into())
            }
        }
    }
}
