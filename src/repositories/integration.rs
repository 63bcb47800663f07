//! Repository for integrations and their sync/delete lifecycle columns.
//!
//! A sync run is claimed by conditionally writing `sync_id`: the UPDATE only
//! matches when no run is in flight, or when the in-flight run has not made
//! progress inside the staleness window. `rows_affected` decides who won, so
//! concurrent claimants never both proceed.

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter};
use uuid::Uuid;

use super::RepositoryError;
use crate::models::integration::{Column, Entity as Integration, Model};
use crate::providers::error::SyncError;

pub struct IntegrationRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> IntegrationRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, RepositoryError> {
        Ok(Integration::find_by_id(id).one(self.db).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<Model>, RepositoryError> {
        Ok(Integration::find().all(self.db).await?)
    }

    /// Integrations eligible for a scheduled sync: nothing in flight, or the
    /// in-flight run went stale.
    pub async fn list_claimable(
        &self,
        stale_run_minutes: i64,
    ) -> Result<Vec<Model>, RepositoryError> {
        let stale_before = Utc::now() - Duration::minutes(stale_run_minutes);

        let integrations = Integration::find()
            .filter(
                Condition::any()
                    .add(Column::SyncId.is_null())
                    .add(Column::SyncUpdatedAt.lt(stale_before)),
            )
            .filter(Column::DeleteId.is_null())
            .all(self.db)
            .await?;

        Ok(integrations)
    }

    /// Try to claim a sync run. Returns the claimed row, or None when another
    /// run holds the claim and is still making progress.
    pub async fn claim_sync(
        &self,
        integration_id: Uuid,
        run_id: Uuid,
        stale_run_minutes: i64,
    ) -> Result<Option<Model>, RepositoryError> {
        let now = Utc::now();
        let stale_before = now - Duration::minutes(stale_run_minutes);

        let result = Integration::update_many()
            .col_expr(Column::SyncId, Expr::value(run_id))
            .col_expr(Column::SyncStartedAt, Expr::value(now))
            .col_expr(Column::SyncUpdatedAt, Expr::value(now))
            .col_expr(Column::SyncStep, Expr::value(Option::<String>::None))
            .col_expr(Column::SyncError, Expr::value(Option::<String>::None))
            .col_expr(
                Column::SyncErrorAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(Column::Id.eq(integration_id))
            .filter(Column::DeleteId.is_null())
            .filter(
                Condition::any()
                    .add(Column::SyncId.is_null())
                    .add(Column::SyncUpdatedAt.lt(stale_before)),
            )
            .exec(self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }

        self.find_by_id(integration_id).await
    }

    /// Record progress into a named step. Returns false when the claim was
    /// lost to a stale-run takeover, in which case the caller must stop.
    pub async fn record_step(
        &self,
        integration_id: Uuid,
        run_id: Uuid,
        step: &str,
    ) -> Result<bool, RepositoryError> {
        let result = Integration::update_many()
            .col_expr(Column::SyncStep, Expr::value(step))
            .col_expr(Column::SyncUpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(integration_id))
            .filter(Column::SyncId.eq(run_id))
            .exec(self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Touch the progress timestamp without changing the step, keeping a
    /// long-running step out of the staleness window.
    pub async fn touch_sync(
        &self,
        integration_id: Uuid,
        run_id: Uuid,
    ) -> Result<bool, RepositoryError> {
        let result = Integration::update_many()
            .col_expr(Column::SyncUpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(integration_id))
            .filter(Column::SyncId.eq(run_id))
            .exec(self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Complete a run: clear the claim and record the new high-water mark
    /// used as the next incremental cutoff.
    pub async fn finish_sync(
        &self,
        integration_id: Uuid,
        run_id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = Integration::update_many()
            .col_expr(Column::SyncId, Expr::value(Option::<Uuid>::None))
            .col_expr(Column::SyncStep, Expr::value(Option::<String>::None))
            .col_expr(Column::SyncError, Expr::value(Option::<String>::None))
            .col_expr(
                Column::SyncErrorAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(Column::SyncFinishedAt, Expr::value(finished_at))
            .col_expr(Column::SyncUpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(integration_id))
            .filter(Column::SyncId.eq(run_id))
            .exec(self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Fail a run: record the serialized error, release the claim, and leave
    /// sync_finished_at untouched so the next run re-covers the same window.
    pub async fn fail_sync(
        &self,
        integration_id: Uuid,
        run_id: Uuid,
        error: &SyncError,
    ) -> Result<bool, RepositoryError> {
        let serialized =
            serde_json::to_string(error).unwrap_or_else(|_| error.to_string());

        let result = Integration::update_many()
            .col_expr(Column::SyncId, Expr::value(Option::<Uuid>::None))
            .col_expr(Column::SyncError, Expr::value(serialized))
            .col_expr(Column::SyncErrorAt, Expr::value(Utc::now()))
            .col_expr(Column::SyncUpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(integration_id))
            .filter(Column::SyncId.eq(run_id))
            .exec(self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Try to claim a delete run. Delete and sync claims are mutually
    /// exclusive.
    pub async fn claim_delete(
        &self,
        integration_id: Uuid,
        run_id: Uuid,
    ) -> Result<bool, RepositoryError> {
        let result = Integration::update_many()
            .col_expr(Column::DeleteId, Expr::value(run_id))
            .col_expr(Column::DeleteError, Expr::value(Option::<String>::None))
            .filter(Column::Id.eq(integration_id))
            .filter(Column::DeleteId.is_null())
            .filter(Column::SyncId.is_null())
            .exec(self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Remove the integration row; dependent entities and events follow via
    /// FK cascade.
    pub async fn delete(&self, integration_id: Uuid) -> Result<(), RepositoryError> {
        Integration::delete_by_id(integration_id)
            .exec(self.db)
            .await?;

        Ok(())
    }

    /// Record a delete failure and release the delete claim.
    pub async fn fail_delete(
        &self,
        integration_id: Uuid,
        run_id: Uuid,
        message: &str,
    ) -> Result<bool, RepositoryError> {
        let result = Integration::update_many()
            .col_expr(Column::DeleteId, Expr::value(Option::<Uuid>::None))
            .col_expr(Column::DeleteError, Expr::value(message))
            .filter(Column::Id.eq(integration_id))
            .filter(Column::DeleteId.eq(run_id))
            .exec(self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }
}
