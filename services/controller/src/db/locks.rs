//! Named locks in the `task_lock` table.

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::Row;
use vnet_id::ReservationId;

use super::DbError;
use crate::locks::{canonical, LockError, LockManager, LockSet, LockTarget};

/// Insert lock rows for `targets` in order. Returns the first target that was
/// already taken; the caller must roll back its transaction in that case.
pub(crate) async fn insert_locks(
    conn: &mut PgConnection,
    holder: &ReservationId,
    targets: &[LockTarget],
) -> Result<Option<LockTarget>, DbError> {
    for target in targets {
        let inserted = sqlx::query(
            r#"
            INSERT INTO task_lock (target, holder)
            VALUES ($1, $2)
            ON CONFLICT (target) DO NOTHING
            "#,
        )
        .bind(target.as_str())
        .bind(holder.to_string())
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;

        if inserted.rows_affected() == 0 {
            return Ok(Some(target.clone()));
        }
    }
    Ok(None)
}

pub(crate) async fn delete_locks(
    conn: &mut PgConnection,
    holder: &ReservationId,
) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM task_lock WHERE holder = $1")
        .bind(holder.to_string())
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;
    Ok(result.rows_affected())
}

pub(crate) async fn lock_held(
    conn: &mut PgConnection,
    holder: &ReservationId,
    target: &LockTarget,
) -> Result<bool, DbError> {
    let row = sqlx::query(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM task_lock WHERE target = $1 AND holder = $2
        ) AS held
        "#,
    )
    .bind(target.as_str())
    .bind(holder.to_string())
    .fetch_one(&mut *conn)
    .await
    .map_err(DbError::Query)?;
    row.try_get("held").map_err(DbError::Query)
}

/// Postgres-backed [`LockManager`].
#[derive(Clone)]
pub struct PgLockManager {
    pool: PgPool,
}

impl PgLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    async fn acquire_all(
        &self,
        holder: &ReservationId,
        targets: &[LockTarget],
    ) -> Result<LockSet, LockError> {
        let targets = canonical(targets.iter().cloned());
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        if let Some(target) = insert_locks(&mut tx, holder, &targets).await? {
            tx.rollback().await.map_err(DbError::Query)?;
            return Err(LockError::AlreadyLocked { target });
        }

        tx.commit().await.map_err(DbError::Query)?;
        Ok(LockSet::new(*holder, targets))
    }

    async fn release_all(&self, locks: &LockSet) -> Result<(), LockError> {
        if locks.is_released() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await.map_err(DbError::Query)?;
        delete_locks(&mut conn, locks.holder()).await?;
        locks.mark_released();
        Ok(())
    }

    async fn holds(&self, locks: &LockSet, target: &LockTarget) -> Result<bool, LockError> {
        if locks.is_released() || !locks.contains(target) {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await.map_err(DbError::Query)?;
        Ok(lock_held(&mut conn, locks.holder(), target).await?)
    }
}
