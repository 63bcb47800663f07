//! Database-backed delivery queue for enrichment work.
//!
//! Delivery is at-least-once: a message claimed by a worker that dies mid
//! flight stays `running` only until the staleness window elapses, after
//! which a later claim takes it over. Duplicate deliveries are absorbed by
//! the worker's no-op guards.

use chrono::{Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::models::enrichment_queue::{
    ActiveModel, Column, Entity as QueueMessage, Model, STATUS_DEAD, STATUS_DONE, STATUS_QUEUED,
    STATUS_RUNNING,
};
use crate::repositories::RepositoryError;

pub struct EnrichmentQueue<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> EnrichmentQueue<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// Enqueue one message per event id. Payloads are internal event uuids,
    /// never provider identifiers.
    pub async fn enqueue_events(&self, event_ids: &[Uuid]) -> Result<u64, RepositoryError> {
        if event_ids.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let models = event_ids.iter().map(|event_id| ActiveModel {
            id: Set(Uuid::new_v4()),
            payload: Set(event_id.to_string()),
            status: Set(STATUS_QUEUED.to_string()),
            attempts: Set(0),
            retry_after: Set(None),
            last_error: Set(None),
            enqueued_at: Set(now),
            updated_at: Set(now),
        });

        QueueMessage::insert_many(models)
            .exec_without_returning(self.db)
            .await?;

        metrics::counter!("enrichment_queue_enqueued_total").increment(event_ids.len() as u64);
        Ok(event_ids.len() as u64)
    }

    /// Claim up to `batch_size` deliverable messages.
    ///
    /// Two phases inside one transaction: select candidate ids, then flip
    /// them to `running` only while still deliverable. The conditional update
    /// keeps concurrent claimants from both winning the same row.
    ///
    /// A `running` message whose `updated_at` is older than
    /// `stale_running_seconds` is treated as abandoned by a dead worker and
    /// claimed again. The redelivery bumps `attempts` like any other claim,
    /// so a message that keeps stalling still reaches the dead-letter
    /// ceiling.
    pub async fn claim_batch(
        &self,
        batch_size: u32,
        stale_running_seconds: i64,
    ) -> Result<Vec<Model>, RepositoryError> {
        let now = Utc::now();
        let stale_before = now - Duration::seconds(stale_running_seconds);

        let deliverable = Condition::any()
            .add(
                Condition::all()
                    .add(Column::Status.eq(STATUS_QUEUED))
                    .add(
                        Condition::any()
                            .add(Column::RetryAfter.is_null())
                            .add(Column::RetryAfter.lte(now)),
                    ),
            )
            .add(
                Condition::all()
                    .add(Column::Status.eq(STATUS_RUNNING))
                    .add(Column::UpdatedAt.lte(stale_before)),
            );

        let txn = self.db.begin().await?;

        let candidates: Vec<Uuid> = QueueMessage::find()
            .select_only()
            .column(Column::Id)
            .filter(deliverable.clone())
            .order_by_asc(Column::EnqueuedAt)
            .limit(u64::from(batch_size))
            .into_tuple()
            .all(&txn)
            .await?;

        if candidates.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        QueueMessage::update_many()
            .col_expr(Column::Status, Expr::value(STATUS_RUNNING))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.is_in(candidates.clone()))
            .filter(deliverable)
            .exec(&txn)
            .await?;

        // The updated_at stamp identifies the rows this claim actually won,
        // excluding candidates a concurrent claimant flipped first.
        let claimed = QueueMessage::find()
            .filter(Column::Id.is_in(candidates))
            .filter(Column::Status.eq(STATUS_RUNNING))
            .filter(Column::UpdatedAt.eq(now))
            .order_by_asc(Column::EnqueuedAt)
            .all(&txn)
            .await?;

        txn.commit().await?;

        metrics::counter!("enrichment_queue_claimed_total").increment(claimed.len() as u64);
        Ok(claimed)
    }

    /// Mark a delivery handled. Acking is terminal for the message.
    pub async fn ack(&self, id: Uuid) -> Result<(), RepositoryError> {
        QueueMessage::update_many()
            .col_expr(Column::Status, Expr::value(STATUS_DONE))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(id))
            .exec(self.db)
            .await?;

        metrics::counter!("enrichment_queue_acked_total").increment(1);
        Ok(())
    }

    /// Record a failed delivery: requeue with a delay, or dead-letter once
    /// the attempt ceiling is reached.
    pub async fn nack(
        &self,
        message: &Model,
        error: &str,
        max_attempts: i32,
        retry_delay_seconds: i64,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();

        if message.attempts >= max_attempts {
            QueueMessage::update_many()
                .col_expr(Column::Status, Expr::value(STATUS_DEAD))
                .col_expr(Column::LastError, Expr::value(error))
                .col_expr(Column::UpdatedAt, Expr::value(now))
                .filter(Column::Id.eq(message.id))
                .exec(self.db)
                .await?;

            tracing::warn!(
                message_id = %message.id,
                payload = %message.payload,
                attempts = message.attempts,
                "enrichment message dead-lettered"
            );
            metrics::counter!("enrichment_queue_dead_total").increment(1);
            return Ok(());
        }

        QueueMessage::update_many()
            .col_expr(Column::Status, Expr::value(STATUS_QUEUED))
            .col_expr(
                Column::RetryAfter,
                Expr::value(now + Duration::seconds(retry_delay_seconds)),
            )
            .col_expr(Column::LastError, Expr::value(error))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(message.id))
            .exec(self.db)
            .await?;

        metrics::counter!("enrichment_queue_nacked_total").increment(1);
        Ok(())
    }

    /// Deliverable backlog size, used by the status surface.
    pub async fn queued_count(&self) -> Result<u64, RepositoryError> {
        Ok(QueueMessage::find()
            .filter(Column::Status.eq(STATUS_QUEUED))
            .count(self.db)
            .await?)
    }

    /// Dead-lettered message count, used by the status surface.
    pub async fn dead_count(&self) -> Result<u64, RepositoryError> {
        Ok(QueueMessage::find()
            .filter(Column::Status.eq(STATUS_DEAD))
            .count(self.db)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect sqlite");
        Migrator::up(&db, None).await.expect("run migrations");
        db
    }

    #[tokio::test]
    async fn claim_moves_messages_to_running_and_bumps_attempts() {
        let db = setup_db().await;
        let queue = EnrichmentQueue::new(&db);

        let events = vec![Uuid::new_v4(), Uuid::new_v4()];
        queue.enqueue_events(&events).await.unwrap();

        let claimed = queue.claim_batch(10, 600).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|m| m.status == STATUS_RUNNING));
        assert!(claimed.iter().all(|m| m.attempts == 1));

        // Nothing left to claim while the batch is in flight.
        let second = queue.claim_batch(10, 600).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn nack_requeues_with_delay_until_ceiling() {
        let db = setup_db().await;
        let queue = EnrichmentQueue::new(&db);

        queue.enqueue_events(&[Uuid::new_v4()]).await.unwrap();
        let claimed = queue.claim_batch(1, 600).await.unwrap();
        let message = &claimed[0];

        queue.nack(message, "summary was empty", 5, 60).await.unwrap();

        let stored = QueueMessage::find_by_id(message.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, STATUS_QUEUED);
        assert_eq!(stored.last_error.as_deref(), Some("summary was empty"));
        assert!(stored.retry_after.unwrap() > Utc::now());

        // Not deliverable again until retry_after passes.
        let reclaimed = queue.claim_batch(1, 600).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn nack_at_ceiling_dead_letters() {
        let db = setup_db().await;
        let queue = EnrichmentQueue::new(&db);

        queue.enqueue_events(&[Uuid::new_v4()]).await.unwrap();
        let claimed = queue.claim_batch(1, 600).await.unwrap();
        let mut message = claimed[0].clone();
        message.attempts = 5;

        queue.nack(&message, "still failing", 5, 60).await.unwrap();

        let stored = QueueMessage::find_by_id(message.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, STATUS_DEAD);
        assert_eq!(stored.last_error.as_deref(), Some("still failing"));

        let reclaimed = queue.claim_batch(1, 600).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn ack_is_terminal() {
        let db = setup_db().await;
        let queue = EnrichmentQueue::new(&db);

        queue.enqueue_events(&[Uuid::new_v4()]).await.unwrap();
        let claimed = queue.claim_batch(1, 600).await.unwrap();

        queue.ack(claimed[0].id).await.unwrap();

        let stored = QueueMessage::find_by_id(claimed[0].id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, STATUS_DONE);
        assert!(queue.claim_batch(1, 600).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_enqueue_is_a_no_op() {
        let db = setup_db().await;
        let queue = EnrichmentQueue::new(&db);

        assert_eq!(queue.enqueue_events(&[]).await.unwrap(), 0);
        assert_eq!(queue.queued_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_running_message_is_claimed_again() {
        let db = setup_db().await;
        let queue = EnrichmentQueue::new(&db);

        queue.enqueue_events(&[Uuid::new_v4()]).await.unwrap();
        let claimed = queue.claim_batch(1, 600).await.unwrap();
        let message = claimed[0].clone();

        // Simulate a worker that died after claiming: the message sits in
        // running with an old updated_at and nobody acks or nacks it.
        QueueMessage::update_many()
            .col_expr(
                Column::UpdatedAt,
                Expr::value(Utc::now() - Duration::seconds(3600)),
            )
            .filter(Column::Id.eq(message.id))
            .exec(&db)
            .await
            .unwrap();

        let reclaimed = queue.claim_batch(1, 600).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, message.id);
        assert_eq!(reclaimed[0].status, STATUS_RUNNING);
        // The redelivery counts toward the dead-letter ceiling.
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[tokio::test]
    async fn fresh_running_message_is_not_stolen() {
        let db = setup_db().await;
        let queue = EnrichmentQueue::new(&db);

        queue.enqueue_events(&[Uuid::new_v4()]).await.unwrap();
        let claimed = queue.claim_batch(1, 600).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Still inside the staleness window, so the in-flight delivery wins.
        let second = queue.claim_batch(1, 600).await.unwrap();
        assert!(second.is_empty());
    }
}
