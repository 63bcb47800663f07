//! Service entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{Duration as TimeDelta, Utc};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use syncline::ai::openai::OpenAiClient;
use syncline::config::{AppConfig, ConfigLoader};
use syncline::enrichment::worker::EnrichmentWorker;
use syncline::providers::ProviderRegistry;
use syncline::retrieval::ActivityRetriever;
use syncline::retrieval::agent::StatusAgent;
use syncline::scheduler::SyncScheduler;
use syncline::server::run_server;
use syncline::sync::orchestrator::{SyncOrchestrator, SyncOutcome};
use syncline::{db, telemetry};

#[derive(Parser)]
#[command(name = "syncline", version, about = "Activity sync and enrichment service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, enrichment worker and status server.
    Serve,
    /// Run one sync for a single integration and exit.
    Sync {
        #[arg(long)]
        integration: Uuid,
    },
    /// Draft a status update for a member from their enriched activity.
    Status {
        #[arg(long)]
        organization: Uuid,
        #[arg(long)]
        member: Uuid,
        /// Provider to pull activity from: github, discord or figma.
        #[arg(long)]
        provider: String,
        /// Activity window in days, counted back from now.
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Apply pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;

    if let Ok(redacted) = config.redacted_json() {
        info!(profile = %config.profile, configuration = %redacted, "configuration loaded");
    }

    let pool = db::init_pool(&config).await.context("connecting to database")?;

    match cli.command {
        Command::Migrate => {
            Migrator::up(&pool, None).await.context("running migrations")?;
            info!("migrations applied");
            Ok(())
        }
        Command::Sync { integration } => {
            let orchestrator = build_orchestrator(&config, pool)?;
            let outcome = orchestrator.sync_integration(integration).await?;
            match outcome {
                SyncOutcome::Completed => info!("sync completed"),
                SyncOutcome::ClaimHeld => info!("sync skipped, claim held by another run"),
                SyncOutcome::Failed(error) => {
                    anyhow::bail!("sync failed: {}", error);
                }
            }
            Ok(())
        }
        Command::Status {
            organization,
            member,
            provider,
            days,
        } => {
            let ai = Arc::new(OpenAiClient::new(reqwest::Client::new(), &config.ai));
            let agent = StatusAgent::new(
                ai,
                Arc::new(ActivityRetriever::new(pool)),
                config.agent.max_rounds,
            );

            let request = format!(
                "Draft a status update for member {} in organization {} covering their {} \
                 activity from {} to {}.",
                member,
                organization,
                provider,
                (Utc::now() - TimeDelta::days(days)).to_rfc3339(),
                Utc::now().to_rfc3339(),
            );
            let update = agent.compose_status_update(&request).await?;
            println!("{}", update);
            Ok(())
        }
        Command::Serve => serve(config, pool).await,
    }
}

fn provider_http_client(config: &AppConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_millis(config.sync.request_timeout_ms))
        .user_agent("syncline")
        .build()
        .context("building provider HTTP client")
}

fn build_orchestrator(
    config: &AppConfig,
    pool: sea_orm::DatabaseConnection,
) -> anyhow::Result<SyncOrchestrator> {
    let registry = ProviderRegistry::with_defaults(provider_http_client(config)?);
    Ok(SyncOrchestrator::new(pool, registry, config.sync.clone()))
}

async fn serve(config: AppConfig, pool: sea_orm::DatabaseConnection) -> anyhow::Result<()> {
    Migrator::up(&pool, None).await.context("running migrations")?;

    let shutdown = CancellationToken::new();

    let ai = Arc::new(OpenAiClient::new(reqwest::Client::new(), &config.ai));
    let dimension = config.ai.dimension;

    let orchestrator = Arc::new(build_orchestrator(&config, pool.clone())?);
    let scheduler = SyncScheduler::new(pool.clone(), orchestrator, config.sync.clone());
    let worker = EnrichmentWorker::new(
        pool.clone(),
        ai.clone(),
        ai.clone(),
        config.enrichment.clone(),
        dimension,
    );

    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    let worker_shutdown = shutdown.clone();
    let worker_task = tokio::spawn(async move { worker.run(worker_shutdown).await });

    let server_shutdown = shutdown.clone();
    let server_task =
        tokio::spawn(async move { run_server(&config, pool, server_shutdown).await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    shutdown.cancel();

    let (scheduler_result, worker_result, server_result) =
        tokio::join!(scheduler_task, worker_task, server_task);
    scheduler_result.context("scheduler task panicked")?;
    worker_result.context("worker task panicked")?;
    server_result.context("server task panicked")??;

    Ok(())
}
