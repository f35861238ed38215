//! Postgres VPC state store.

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::Row;
use vnet_reconcile::StateDigest;

use super::locks::lock_held;
use super::DbError;
use crate::locks::LockTarget;
use crate::model::{NetworkingConfig, TaskStatus, VpcKey, VpcRecord, VpcState};
use crate::store::{StoreError, StoreResult, VpcStore, WriteGuard};

/// A row from the vpcs table.
#[derive(Debug, Clone)]
struct VpcRow {
    region: String,
    vpc_id: String,
    account_id: String,
    name: String,
    stack: String,
    state: Option<serde_json::Value>,
    config: serde_json::Value,
    state_digest: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for VpcRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            region: row.try_get("region")?,
            vpc_id: row.try_get("vpc_id")?,
            account_id: row.try_get("account_id")?,
            name: row.try_get("name")?,
            stack: row.try_get("stack")?,
            state: row.try_get("state")?,
            config: row.try_get("config")?,
            state_digest: row.try_get("state_digest")?,
        })
    }
}

impl VpcRow {
    fn into_record(self) -> Result<VpcRecord, DbError> {
        let state = self
            .state
            .map(serde_json::from_value::<VpcState>)
            .transpose()?;
        Ok(VpcRecord {
            key: VpcKey::new(self.region, self.vpc_id),
            account_id: self.account_id,
            name: self.name,
            stack: self.stack,
            state,
            config: serde_json::from_value(self.config)?,
            state_digest: self.state_digest.map(StateDigest::from_stored),
        })
    }
}

const VPC_COLUMNS: &str =
    "region, vpc_id, account_id, name, stack, state, config, state_digest";

#[derive(Clone)]
pub struct PgVpcStore {
    pool: PgPool,
}

impl PgVpcStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Confirms inside `tx` that the guard still owns `key`.
    async fn check_guard(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        guard: WriteGuard<'_>,
        key: &VpcKey,
    ) -> StoreResult<()> {
        let target = LockTarget::vpc(&key.region, &key.vpc_id);
        if guard.locks.is_released()
            || !guard.locks.contains(&target)
            || !lock_held(&mut **tx, guard.locks.holder(), &target).await?
        {
            return Err(StoreError::LockLost { target });
        }

        let status: Option<String> =
            sqlx::query("SELECT status FROM tasks WHERE id = $1 FOR SHARE")
                .bind(guard.task_id.to_string())
                .fetch_optional(&mut **tx)
                .await
                .and_then(|row| row.map(|r| r.try_get("status")).transpose())
                .map_err(DbError::Query)?;
        let status = status
            .as_deref()
            .and_then(TaskStatus::from_str)
            .unwrap_or(TaskStatus::Cancelled);
        if status != TaskStatus::InProgress {
            return Err(StoreError::TaskNotInProgress {
                task_id: *guard.task_id,
                status,
            });
        }
        Ok(())
    }
}

/// Reads one VPC record on `conn`, so callers can do it inside their own
/// transaction.
pub(super) async fn fetch_vpc(
    conn: &mut PgConnection,
    key: &VpcKey,
) -> Result<Option<VpcRecord>, DbError> {
    let row: Option<VpcRow> = sqlx::query_as(&format!(
        "SELECT {VPC_COLUMNS} FROM vpcs WHERE region = $1 AND vpc_id = $2"
    ))
    .bind(&key.region)
    .bind(&key.vpc_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DbError::Query)?;
    row.map(VpcRow::into_record).transpose()
}

#[async_trait]
impl VpcStore for PgVpcStore {
    async fn load(&self, key: &VpcKey) -> StoreResult<Option<VpcRecord>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::Query)?;
        Ok(fetch_vpc(&mut conn, key).await?)
    }

    async fn list(&self) -> StoreResult<Vec<VpcRecord>> {
        let rows: Vec<VpcRow> = sqlx::query_as(&format!(
            "SELECT {VPC_COLUMNS} FROM vpcs ORDER BY region, vpc_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(rows
            .into_iter()
            .map(VpcRow::into_record)
            .collect::<Result<_, _>>()?)
    }

    async fn upsert_vpc(&self, record: &VpcRecord) -> StoreResult<bool> {
        let state = record
            .state
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(DbError::from)?;
        let digest = record
            .state
            .as_ref()
            .map(StateDigest::of)
            .transpose()
            .map_err(DbError::from)?;

        // State and config only change under the VPC lock, through
        // save_state and save_config. A re-registration touches identity only.
        let inserted: bool = sqlx::query(
            r#"
            INSERT INTO vpcs (region, vpc_id, account_id, name, stack, state, config, state_digest)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (region, vpc_id) DO UPDATE SET
                account_id = EXCLUDED.account_id,
                name = EXCLUDED.name,
                stack = EXCLUDED.stack,
                updated_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.key.region)
        .bind(&record.key.vpc_id)
        .bind(&record.account_id)
        .bind(&record.name)
        .bind(&record.stack)
        .bind(state)
        .bind(serde_json::to_value(&record.config).map_err(DbError::from)?)
        .bind(digest.as_ref().map(StateDigest::as_str))
        .fetch_one(&self.pool)
        .await
        .and_then(|row| row.try_get("inserted"))
        .map_err(DbError::Query)?;
        Ok(inserted)
    }

    async fn save_state(
        &self,
        guard: WriteGuard<'_>,
        key: &VpcKey,
        state: &VpcState,
    ) -> StoreResult<bool> {
        let digest = StateDigest::of(state).map_err(DbError::from)?;
        let json = serde_json::to_value(state).map_err(DbError::from)?;

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        Self::check_guard(&mut tx, guard, key).await?;

        let stored: Option<Option<String>> = sqlx::query(
            "SELECT state_digest FROM vpcs WHERE region = $1 AND vpc_id = $2 FOR UPDATE",
        )
        .bind(&key.region)
        .bind(&key.vpc_id)
        .fetch_optional(&mut *tx)
        .await
        .and_then(|row| row.map(|r| r.try_get("state_digest")).transpose())
        .map_err(DbError::Query)?;

        let Some(stored) = stored else {
            return Err(StoreError::NotFound(key.clone()));
        };
        if stored.as_deref() == Some(digest.as_str()) {
            tx.commit().await.map_err(DbError::Query)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE vpcs SET state = $3, state_digest = $4, updated_at = now()
            WHERE region = $1 AND vpc_id = $2
            "#,
        )
        .bind(&key.region)
        .bind(&key.vpc_id)
        .bind(json)
        .bind(digest.as_str())
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        tx.commit().await.map_err(DbError::Query)?;
        Ok(true)
    }

    async fn save_config(
        &self,
        guard: WriteGuard<'_>,
        key: &VpcKey,
        config: &NetworkingConfig,
    ) -> StoreResult<()> {
        let json = serde_json::to_value(config).map_err(DbError::from)?;

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        Self::check_guard(&mut tx, guard, key).await?;

        let updated = sqlx::query(
            r#"
            UPDATE vpcs SET config = $3, updated_at = now()
            WHERE region = $1 AND vpc_id = $2
            "#,
        )
        .bind(&key.region)
        .bind(&key.vpc_id)
        .bind(json)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.clone()));
        }
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }
}
