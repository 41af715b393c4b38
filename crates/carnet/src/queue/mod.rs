//! Durable task queue backed by the `tasks` table.
//!
//! Delivery is at-least-once: a consumer claims a task, and a task whose
//! claim is neither completed nor failed within the unit timeout is put
//! back for another consumer. Everything that consumes from the queue must
//! therefore tolerate replays.

pub mod task;

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

use crate::db::{task_repo, Database, DatabaseError};
pub use task::{Task, TaskCounts, TaskKind, TaskPayload, TaskStatus, WorkItem};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Handle on one named queue.
#[derive(Clone)]
pub struct TaskQueue {
    db: Database,
    name: String,
    max_attempts: u32,
}

impl TaskQueue {
    pub fn new(db: Database, name: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            db,
            name: name.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueue(&self, payload: &TaskPayload) -> Result<i64, QueueError> {
        self.db.with_conn(|conn| self.enqueue_in(conn, payload))
    }

    /// Enqueues on a connection the caller already holds, so the task
    /// becomes visible only when the caller's transaction commits.
    pub fn enqueue_in(&self, conn: &Connection, payload: &TaskPayload) -> Result<i64, QueueError> {
        let id = task_repo::insert(conn, &self.name, payload, self.max_attempts, Utc::now())?;
        log::debug!(
            "Enqueued {} task {} for batch {}",
            payload.kind().as_str(),
            id,
            payload.session_id()
        );
        Ok(id)
    }

    /// Whether a pending or running task of `kind` matches `predicate`.
    pub fn exists<P>(&self, kind: TaskKind, predicate: P) -> Result<bool, QueueError>
    where
        P: Fn(&TaskPayload) -> bool,
    {
        self.db
            .with_conn(|conn| Ok(task_repo::exists(conn, kind, predicate)?))
    }

    /// Same as [`TaskQueue::exists`], on the caller's connection.
    pub fn exists_in<P>(
        &self,
        conn: &Connection,
        kind: TaskKind,
        predicate: P,
    ) -> Result<bool, QueueError>
    where
        P: Fn(&TaskPayload) -> bool,
    {
        Ok(task_repo::exists(conn, kind, predicate)?)
    }

    pub fn claim_next(&self) -> Result<Option<Task>, QueueError> {
        self.db
            .with_immediate_tx(|conn| Ok(task_repo::claim_next(conn, &self.name, Utc::now())?))
    }

    /// Returns false if the claim was stale (the task was re-queued meanwhile).
    pub fn complete(&self, task: &Task) -> Result<bool, QueueError> {
        let done = self
            .db
            .with_conn(|conn| task_repo::complete(conn, task.id, task.attempt, Utc::now()))?;
        if !done {
            log::debug!("Task {} attempt {} was no longer current", task.id, task.attempt);
        }
        Ok(done)
    }

    /// Records a failed attempt. With `retry` the task is re-queued while
    /// attempts remain.
    pub fn fail(
        &self,
        task: &Task,
        error: &str,
        retry: bool,
    ) -> Result<Option<TaskStatus>, QueueError> {
        let status = self.db.with_conn(|conn| {
            task_repo::fail(conn, task.id, task.attempt, error, retry, Utc::now())
        })?;
        match status {
            Some(TaskStatus::Pending) => log::warn!(
                "Task {} failed on attempt {}/{}, re-queued: {}",
                task.id,
                task.attempt,
                task.max_attempts,
                error
            ),
            Some(_) => log::error!(
                "Task {} failed permanently after {} attempt(s): {}",
                task.id,
                task.attempt,
                error
            ),
            None => log::debug!("Task {} attempt {} was no longer current", task.id, task.attempt),
        }
        Ok(status)
    }

    /// Re-queues tasks whose claim is older than `timeout`. Returns
    /// `(requeued, failed)`.
    pub fn requeue_expired(&self, timeout: Duration) -> Result<(u64, u64), QueueError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let (requeued, failed) = self
            .db
            .with_immediate_tx(|conn| task_repo::requeue_expired(conn, cutoff, now))?;
        if requeued > 0 || failed > 0 {
            log::warn!(
                "Expired task claims: {} re-queued, {} failed",
                requeued,
                failed
            );
        }
        Ok((requeued, failed))
    }

    /// Deletes finished tasks of this queue older than `retention`.
    pub fn purge_finished(&self, retention: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| now.checked_sub_signed(r))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self
            .db
            .with_conn(|conn| task_repo::purge_finished(conn, &self.name, cutoff))?;
        if removed > 0 {
            log::info!("Purged {} finished task(s) from '{}'", removed, self.name);
        }
        Ok(removed)
    }

    pub fn counts_for(&self, session_id: &str) -> Result<TaskCounts, QueueError> {
        Ok(self
            .db
            .with_conn(|conn| task_repo::counts_for(conn, session_id))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> TaskQueue {
        TaskQueue::new(Database::open_in_memory().unwrap(), "carnets", 2)
    }

    fn item(driver_id: i64) -> TaskPayload {
        TaskPayload::RenderCard(WorkItem {
            session_id: "batch".to_string(),
            driver_id,
            template_id: 1,
        })
    }

    #[test]
    fn test_enqueue_and_claim() {
        let q = queue();
        q.enqueue(&item(1)).unwrap();
        let task = q.claim_next().unwrap().unwrap();
        assert_eq!(task.kind(), TaskKind::RenderCard);
        assert_eq!(task.session_id(), "batch");
        assert!(q.complete(&task).unwrap());
        assert!(q.claim_next().unwrap().is_none());
    }

    #[test]
    fn test_retry_then_give_up() {
        let q = queue();
        q.enqueue(&item(1)).unwrap();

        let first = q.claim_next().unwrap().unwrap();
        assert_eq!(q.fail(&first, "locked", true).unwrap(), Some(TaskStatus::Pending));
        let second = q.claim_next().unwrap().unwrap();
        assert_eq!(q.fail(&second, "locked", true).unwrap(), Some(TaskStatus::Failed));

        let counts = q.counts_for("batch").unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.in_flight(), 0);
    }

    #[test]
    fn test_requeue_expired_with_zero_timeout() {
        let q = queue();
        q.enqueue(&item(1)).unwrap();
        let task = q.claim_next().unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let (requeued, failed) = q.requeue_expired(Duration::ZERO).unwrap();
        assert_eq!((requeued, failed), (1, 0));
        assert!(!q.complete(&task).unwrap());

        let again = q.claim_next().unwrap().unwrap();
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn test_exists_matches_payload() {
        let q = queue();
        q.enqueue(&item(4)).unwrap();

        let for_driver = |driver_id: i64| {
            move |p: &TaskPayload| matches!(p, TaskPayload::RenderCard(w) if w.driver_id == driver_id)
        };
        assert!(q.exists(TaskKind::RenderCard, for_driver(4)).unwrap());
        assert!(!q.exists(TaskKind::RenderCard, for_driver(5)).unwrap());
        assert!(!q.exists(TaskKind::Finalize, for_driver(4)).unwrap());
    }

    #[test]
    fn test_purge_keeps_recent_and_unfinished_tasks() {
        let q = queue();
        q.enqueue(&item(1)).unwrap();
        q.enqueue(&item(2)).unwrap();
        let task = q.claim_next().unwrap().unwrap();
        q.complete(&task).unwrap();

        assert_eq!(q.purge_finished(Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(q.purge_finished(Duration::ZERO).unwrap(), 1);

        let counts = q.counts_for("batch").unwrap();
        assert_eq!(counts.done, 0);
        assert_eq!(counts.pending, 1);
    }

    #[test]
    fn test_enqueue_in_rolls_back_with_transaction() {
        let db = Database::open_in_memory().unwrap();
        let q = TaskQueue::new(db.clone(), "carnets", 3);

        let result: Result<(), QueueError> = db.with_immediate_tx(|conn| {
            q.enqueue_in(conn, &item(1))?;
            Err(QueueError::Database(DatabaseError::Corrupt {
                reason: "abort".to_string(),
            }))
        });
        assert!(result.is_err());
        assert!(q.claim_next().unwrap().is_none());
    }
}
