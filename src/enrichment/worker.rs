//! Enrichment worker: consumes the queue, generates summaries and
//! embeddings, and stores one vector row per event.
//!
//! Processing is idempotent. A redelivered message whose event already has a
//! vector is acked without touching the AI backend, and a message whose
//! event no longer exists is acked as a no-op.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::ai::{Embedder, TextGenerator};
use crate::config::EnrichmentConfig;
use crate::models::enrichment_queue::Model as QueueMessage;
use crate::models::event;
use crate::repositories::event::EventRepository;
use crate::repositories::event_vector::EventVectorRepository;

use super::queue::EnrichmentQueue;

const SUMMARY_INSTRUCTION: &str = "Summarize the following team activity event in one or two \
    plain sentences. Name the actor and what happened. Do not speculate beyond the event data.";

/// Payload JSON is truncated before prompting so one oversized event cannot
/// blow up a request.
const MAX_PROMPT_PAYLOAD_CHARS: usize = 2000;

pub struct EnrichmentWorker {
    db: DatabaseConnection,
    generator: Arc<dyn TextGenerator>,
    embedder: Arc<dyn Embedder>,
    config: EnrichmentConfig,
    dimension: usize,
}

impl EnrichmentWorker {
    pub fn new(
        db: DatabaseConnection,
        generator: Arc<dyn TextGenerator>,
        embedder: Arc<dyn Embedder>,
        config: EnrichmentConfig,
        dimension: usize,
    ) -> Self {
        Self {
            db,
            generator,
            embedder,
            config,
            dimension,
        }
    }

    /// Poll loop: claim a batch each tick until shutdown is requested.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_seconds));
        tracing::info!(
            tick_seconds = self.config.tick_seconds,
            batch_size = self.config.batch_size,
            "enrichment worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("enrichment worker shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        tracing::error!(error = %err, "enrichment tick failed");
                    }
                }
            }
        }
    }

    /// Claim and process one batch. Returns the number of messages handled.
    pub async fn tick(&self) -> anyhow::Result<usize> {
        let queue = EnrichmentQueue::new(&self.db);
        let messages = queue
            .claim_batch(self.config.batch_size, self.config.stale_running_seconds)
            .await?;
        let count = messages.len();

        for message in &messages {
            self.process_message(&queue, message).await;
        }

        Ok(count)
    }

    #[instrument(skip(self, queue, message), fields(message_id = %message.id, payload = %message.payload))]
    async fn process_message(&self, queue: &EnrichmentQueue<'_>, message: &QueueMessage) {
        match self.enrich(message).await {
            Ok(outcome) => {
                if let Err(err) = queue.ack(message.id).await {
                    tracing::error!(error = %err, "failed to ack enrichment message");
                }
                match outcome {
                    EnrichOutcome::Enriched => {
                        metrics::counter!("enrichment_events_enriched_total").increment(1);
                    }
                    EnrichOutcome::AlreadyEnriched | EnrichOutcome::EventMissing => {
                        metrics::counter!("enrichment_noop_total").increment(1);
                    }
                }
            }
            Err(failure) => {
                // Best effort: keep the failure visible on the event row even
                // if the write does not land.
                if let Some(event_id) = failure.event_id {
                    let events = EventRepository::new(&self.db);
                    if let Err(err) = events
                        .set_enrich_error(event_id, Some(failure.message.clone()))
                        .await
                    {
                        tracing::warn!(error = %err, "failed to record enrich_error on event");
                    }
                }

                let ceiling = if failure.retryable {
                    self.config.max_attempts
                } else {
                    0
                };
                if let Err(err) = queue
                    .nack(
                        message,
                        &failure.message,
                        ceiling,
                        self.config.retry_delay_seconds,
                    )
                    .await
                {
                    tracing::error!(error = %err, "failed to nack enrichment message");
                }
                metrics::counter!("enrichment_failures_total").increment(1);
            }
        }
    }

    async fn enrich(&self, message: &QueueMessage) -> Result<EnrichOutcome, EnrichFailure> {
        // Unparseable payloads can never succeed, so they go straight to the
        // dead letter state.
        let event_id = Uuid::parse_str(&message.payload).map_err(|e| EnrichFailure {
            event_id: None,
            message: format!("invalid queue payload: {}", e),
            retryable: false,
        })?;

        let events = EventRepository::new(&self.db);
        let vectors = EventVectorRepository::new(&self.db);

        let Some(event) = events
            .find_by_id(event_id)
            .await
            .map_err(|e| EnrichFailure::retryable(event_id, e.to_string()))?
        else {
            tracing::debug!(%event_id, "event gone, acking as no-op");
            return Ok(EnrichOutcome::EventMissing);
        };

        if vectors
            .exists(event_id)
            .await
            .map_err(|e| EnrichFailure::retryable(event_id, e.to_string()))?
        {
            tracing::debug!(%event_id, "event already enriched, acking as no-op");
            return Ok(EnrichOutcome::AlreadyEnriched);
        }

        let prompt = event_prompt(&event);
        let summary = self
            .generator
            .generate(SUMMARY_INSTRUCTION, &prompt)
            .await
            .map_err(|e| EnrichFailure::retryable(event_id, format!("generation failed: {}", e)))?;

        let summary = summary.trim();
        if summary.is_empty() {
            return Err(EnrichFailure::retryable(
                event_id,
                "generated summary was empty".to_string(),
            ));
        }
        let summary: String = summary.chars().take(self.config.summary_max_chars).collect();

        let embedding = self
            .embedder
            .embed(&summary)
            .await
            .map_err(|e| EnrichFailure::retryable(event_id, format!("embedding failed: {}", e)))?;

        if embedding.len() != self.dimension {
            return Err(EnrichFailure::retryable(
                event_id,
                format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    embedding.len()
                ),
            ));
        }

        vectors
            .insert(event_id, summary, &embedding)
            .await
            .map_err(|e| EnrichFailure::retryable(event_id, e.to_string()))?;

        // Clear a stale failure note from an earlier attempt.
        if event.enrich_error.is_some() {
            if let Err(err) = events.set_enrich_error(event_id, None).await {
                tracing::warn!(error = %err, "failed to clear enrich_error");
            }
        }

        Ok(EnrichOutcome::Enriched)
    }
}

enum EnrichOutcome {
    Enriched,
    AlreadyEnriched,
    EventMissing,
}

struct EnrichFailure {
    event_id: Option<Uuid>,
    message: String,
    retryable: bool,
}

impl EnrichFailure {
    fn retryable(event_id: Uuid, message: String) -> Self {
        Self {
            event_id: Some(event_id),
            message,
            retryable: true,
        }
    }
}

fn event_prompt(event: &event::Model) -> String {
    let payload = serde_json::to_string(&event.payload).unwrap_or_default();
    let payload: String = payload.chars().take(MAX_PROMPT_PAYLOAD_CHARS).collect();

    format!(
        "provider: {}\nkind: {}\nactor: {}\nentity: {}\noccurred_at: {}\npayload: {}",
        event.provider,
        event.kind,
        event.actor_external_id.as_deref().unwrap_or("unknown"),
        event.entity_external_id.as_deref().unwrap_or("none"),
        event.occurred_at.to_rfc3339(),
        payload,
    )
}
