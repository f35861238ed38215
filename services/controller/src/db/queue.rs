//! Postgres task queue.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use vnet_id::{BatchTaskId, ReservationId, TaskId};

use super::locks::{delete_locks, insert_locks};
use super::vpcs::fetch_vpc;
use super::DbError;
use crate::locks::{LockSet, LockTarget};
use crate::model::{LogEntry, NewTask, Task, TaskData, TaskFilter, TaskStats, TaskStatus};
use crate::queue::{select_reservable, Candidate, QueueError, QueueResult, Reservation, TaskQueue};

/// Channel `enqueue` notifies on.
pub const NEW_TASK_CHANNEL: &str = "new_task";

/// Queued tasks considered per reservation attempt.
const RESERVATION_SCAN_LIMIT: i64 = 500;

const TASK_COLUMNS: &str =
    "id, status, description, data, lock_targets, prerequisite_id, batch_id, added_at";

// ===== Database Row Types =====

/// A row from the tasks table, before decoding.
#[derive(Debug, Clone)]
struct TaskRow {
    id: String,
    status: String,
    description: String,
    data: serde_json::Value,
    lock_targets: Vec<String>,
    prerequisite_id: Option<String>,
    batch_id: Option<String>,
    added_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            description: row.try_get("description")?,
            data: row.try_get("data")?,
            lock_targets: row.try_get("lock_targets")?,
            prerequisite_id: row.try_get("prerequisite_id")?,
            batch_id: row.try_get("batch_id")?,
            added_at: row.try_get("added_at")?,
        })
    }
}

impl TaskRow {
    fn into_task(self) -> Result<Task, DbError> {
        Ok(Task {
            id: TaskId::parse(&self.id).map_err(|e| DbError::invalid("id", e))?,
            status: TaskStatus::from_str(&self.status)
                .ok_or_else(|| DbError::invalid("status", &self.status))?,
            description: self.description,
            data: serde_json::from_value::<TaskData>(self.data)?,
            lock_targets: self
                .lock_targets
                .into_iter()
                .map(LockTarget::from_stored)
                .collect(),
            prerequisite: self
                .prerequisite_id
                .as_deref()
                .map(TaskId::parse)
                .transpose()
                .map_err(|e| DbError::invalid("prerequisite_id", e))?,
            batch: self
                .batch_id
                .as_deref()
                .map(BatchTaskId::parse)
                .transpose()
                .map_err(|e| DbError::invalid("batch_id", e))?,
            added_at: self.added_at,
            log: Vec::new(),
        })
    }
}

struct CandidateRow {
    id: String,
    lock_targets: Vec<String>,
    prerequisite_done: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for CandidateRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            lock_targets: row.try_get("lock_targets")?,
            prerequisite_done: row.try_get("prerequisite_done")?,
        })
    }
}

// ===== Queue =====

/// Postgres-backed [`TaskQueue`].
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_task(
        conn: &mut PgConnection,
        task: &NewTask,
        batch: Option<&BatchTaskId>,
    ) -> Result<TaskId, DbError> {
        let id = TaskId::new();
        let vpc = task.data.vpc();
        // Connections recorded on the VPC are locked too.
        let recorded = match &task.data {
            TaskData::UpdateNetworking(_) => fetch_vpc(&mut *conn, &vpc).await?,
            _ => None,
        };
        let targets: Vec<String> = task
            .lock_targets(&id, recorded.as_ref())
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, description, data, lock_targets, prerequisite_id, batch_id, region, vpc_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id.to_string())
        .bind(&task.description)
        .bind(serde_json::to_value(&task.data)?)
        .bind(&targets)
        .bind(task.prerequisite.map(|p| p.to_string()))
        .bind(batch.map(|b| b.to_string()))
        .bind(&vpc.region)
        .bind(&vpc.vpc_id)
        .execute(&mut *conn)
        .await
        .map_err(DbError::Query)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NEW_TASK_CHANNEL)
            .bind(id.to_string())
            .execute(&mut *conn)
            .await
            .map_err(DbError::Query)?;

        Ok(id)
    }

    async fn fetch_task(conn: &mut PgConnection, id: &TaskId) -> Result<Option<Task>, DbError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.to_string())
                .fetch_optional(&mut *conn)
                .await
                .map_err(DbError::Query)?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn log_in(conn: &mut PgConnection, id: &TaskId, message: &str) -> Result<(), DbError> {
        sqlx::query("INSERT INTO task_log (task_id, message) VALUES ($1, $2)")
            .bind(id.to_string())
            .bind(message)
            .execute(&mut *conn)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: NewTask) -> QueueResult<TaskId> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        let id = Self::insert_task(&mut tx, &task, None).await?;
        tx.commit().await.map_err(DbError::Query)?;

        info!(task_id = %id, kind = task.data.kind(), "Task enqueued");
        Ok(id)
    }

    async fn enqueue_batch(
        &self,
        description: &str,
        tasks: Vec<NewTask>,
    ) -> QueueResult<(BatchTaskId, Vec<TaskId>)> {
        let batch_id = BatchTaskId::new();
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        sqlx::query("INSERT INTO batch_tasks (id, description) VALUES ($1, $2)")
            .bind(batch_id.to_string())
            .bind(description)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        let mut ids = Vec::with_capacity(tasks.len());
        for task in &tasks {
            ids.push(Self::insert_task(&mut tx, task, Some(&batch_id)).await?);
        }
        tx.commit().await.map_err(DbError::Query)?;

        info!(batch_id = %batch_id, tasks = ids.len(), "Batch enqueued");
        Ok((batch_id, ids))
    }

    async fn reserve_next(&self, worker: &str) -> QueueResult<Option<Reservation>> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let allowed: bool = sqlx::query(
            r#"
            INSERT INTO workers (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET last_seen = now()
            RETURNING allow_tasks
            "#,
        )
        .bind(worker)
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("allow_tasks"))
        .map_err(DbError::Query)?;

        if !allowed {
            tx.commit().await.map_err(DbError::Query)?;
            debug!(worker, "Worker is not allowed to take tasks");
            return Ok(None);
        }

        sqlx::query("LOCK TABLE task_reservation IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        let held: HashSet<LockTarget> = sqlx::query("SELECT target FROM task_lock")
            .fetch_all(&mut *tx)
            .await
            .map_err(DbError::Query)?
            .iter()
            .map(|row| row.try_get::<String, _>("target").map(LockTarget::from_stored))
            .collect::<Result<_, _>>()
            .map_err(DbError::Query)?;

        let rows: Vec<CandidateRow> = sqlx::query_as(
            r#"
            SELECT t.id, t.lock_targets,
                   (t.prerequisite_id IS NULL
                    OR p.status IN ('successful', 'failed', 'cancelled')) AS prerequisite_done
            FROM tasks t
            LEFT JOIN tasks p ON p.id = t.prerequisite_id
            WHERE t.status = 'queued'
            ORDER BY t.seq
            LIMIT $1
            "#,
        )
        .bind(RESERVATION_SCAN_LIMIT)
        .fetch_all(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        let candidates = rows
            .into_iter()
            .map(|row| {
                Ok(Candidate {
                    id: TaskId::parse(&row.id).map_err(|e| DbError::invalid("id", e))?,
                    lock_targets: row
                        .lock_targets
                        .into_iter()
                        .map(LockTarget::from_stored)
                        .collect(),
                    prerequisite_done: row.prerequisite_done,
                })
            })
            .collect::<Result<Vec<_>, DbError>>()?;

        let Some(picked) = select_reservable(&candidates, &held) else {
            tx.commit().await.map_err(DbError::Query)?;
            return Ok(None);
        };

        let reservation_id = ReservationId::new();
        if let Some(target) = insert_locks(&mut tx, &reservation_id, &picked.lock_targets).await? {
            // Taken outside the reservation path since we read task_lock.
            tx.rollback().await.map_err(DbError::Query)?;
            debug!(task_id = %picked.id, target = %target, "Lock raced; retrying later");
            return Ok(None);
        }

        sqlx::query(
            r#"
            INSERT INTO task_reservation (task_id, reservation_id, reserved_by)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(picked.id.to_string())
        .bind(reservation_id.to_string())
        .bind(worker)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        sqlx::query(
            "UPDATE tasks SET status = 'in_progress', updated_at = now() WHERE id = $1",
        )
        .bind(picked.id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        Self::log_in(&mut tx, &picked.id, &format!("Reserved by worker {worker}")).await?;

        let task = Self::fetch_task(&mut tx, &picked.id)
            .await?
            .ok_or(QueueError::NotFound(picked.id))?;
        tx.commit().await.map_err(DbError::Query)?;

        let locks = LockSet::new(reservation_id, task.lock_targets.iter().cloned());
        Ok(Some(Reservation {
            id: reservation_id,
            task,
            locks,
        }))
    }

    async fn task(&self, id: &TaskId) -> QueueResult<Option<Task>> {
        let mut conn = self.pool.acquire().await.map_err(DbError::Query)?;
        let Some(mut task) = Self::fetch_task(&mut conn, id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(
            "SELECT logged_at, message FROM task_log WHERE task_id = $1 ORDER BY id",
        )
        .bind(id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::Query)?;

        task.log = rows
            .iter()
            .map(|row| {
                Ok(LogEntry {
                    time: row.try_get("logged_at")?,
                    message: row.try_get("message")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(DbError::Query)?;

        Ok(Some(task))
    }

    async fn list(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>> {
        let limit = (filter.limit > 0).then_some(i64::from(filter.limit));
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR batch_id = $2)
              AND ($3::text IS NULL OR (region = $3 AND vpc_id = $4))
            ORDER BY seq DESC
            LIMIT $5
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.batch.map(|b| b.to_string()))
        .bind(filter.vpc.as_ref().map(|v| v.region.as_str()))
        .bind(filter.vpc.as_ref().map(|v| v.vpc_id.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<_, _>>()?)
    }

    async fn set_status(&self, id: &TaskId, status: TaskStatus) -> QueueResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let current: Option<String> =
            sqlx::query("SELECT status FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .and_then(|row| row.map(|r| r.try_get("status")).transpose())
                .map_err(DbError::Query)?;
        let current = current.ok_or(QueueError::NotFound(*id))?;
        let current =
            TaskStatus::from_str(&current).ok_or_else(|| DbError::invalid("status", &current))?;

        if !current.can_transition_to(status) {
            return Err(QueueError::InvalidTransition {
                id: *id,
                from: current,
                to: status,
            });
        }

        sqlx::query("UPDATE tasks SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id.to_string())
            .bind(status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }

    async fn append_log(&self, id: &TaskId, message: &str) -> QueueResult<()> {
        let mut conn = self.pool.acquire().await.map_err(DbError::Query)?;
        Self::log_in(&mut conn, id, message).await?;
        Ok(())
    }

    async fn release(&self, reservation: &Reservation) -> QueueResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        sqlx::query("DELETE FROM task_reservation WHERE reservation_id = $1")
            .bind(reservation.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        if !reservation.locks.is_released() {
            delete_locks(&mut tx, &reservation.id).await?;
        }

        tx.commit().await.map_err(DbError::Query)?;
        reservation.locks.mark_released();
        Ok(())
    }

    async fn cancel(&self, ids: &[TaskId]) -> QueueResult<u64> {
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let result = sqlx::query(
            r#"
            WITH cancelled AS (
                UPDATE tasks SET status = 'cancelled', updated_at = now()
                WHERE id = ANY($1) AND status IN ('queued', 'in_progress')
                RETURNING id
            )
            INSERT INTO task_log (task_id, message)
            SELECT id, 'Cancelled by operator' FROM cancelled
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }

    async fn fail_in_progress(&self, reason: &str) -> QueueResult<u64> {
        let failed: i64 = sqlx::query(
            r#"
            WITH failed AS (
                UPDATE tasks SET status = 'failed', updated_at = now()
                WHERE status = 'in_progress'
                RETURNING id
            ),
            logged AS (
                INSERT INTO task_log (task_id, message)
                SELECT id, $1 FROM failed
            ),
            dropped AS (
                DELETE FROM task_reservation r
                USING failed f
                WHERE r.task_id = f.id
                RETURNING r.reservation_id
            ),
            unlocked AS (
                DELETE FROM task_lock l
                USING dropped d
                WHERE l.holder = d.reservation_id
            )
            SELECT count(*) AS failed FROM failed
            "#,
        )
        .bind(reason)
        .fetch_one(&self.pool)
        .await
        .and_then(|row| row.try_get("failed"))
        .map_err(DbError::Query)?;
        Ok(failed as u64)
    }

    async fn set_worker_allowed(&self, worker: &str, allowed: bool) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (name, allow_tasks) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET allow_tasks = EXCLUDED.allow_tasks
            "#,
        )
        .bind(worker)
        .bind(allowed)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    async fn stats(&self, batch: Option<&BatchTaskId>) -> QueueResult<TaskStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, count(*) AS n
            FROM tasks
            WHERE ($1::text IS NULL OR batch_id = $1)
            GROUP BY status
            "#,
        )
        .bind(batch.map(|b| b.to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(DbError::Query)?;
            let n: i64 = row.try_get("n").map_err(DbError::Query)?;
            let status =
                TaskStatus::from_str(&status).ok_or_else(|| DbError::invalid("status", &status))?;
            stats.count(status, n as u64);
        }
        Ok(stats)
    }
}
