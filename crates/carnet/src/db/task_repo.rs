//! Task repository: the persisted work queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{format_timestamp, DatabaseError};
use crate::queue::task::{Task, TaskCounts, TaskKind, TaskPayload, TaskStatus};

fn decode_payload(raw: &str) -> Result<TaskPayload, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Corrupt {
        reason: format!("invalid task payload: {}", e),
    })
}

/// Inserts a pending task and returns its id.
pub fn insert(
    conn: &Connection,
    queue: &str,
    payload: &TaskPayload,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    let raw = serde_json::to_string(payload).map_err(|e| DatabaseError::Corrupt {
        reason: format!("unserializable task payload: {}", e),
    })?;
    conn.execute(
        "INSERT INTO tasks (queue, kind, session_id, payload, status, max_attempts, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
        params![
            queue,
            payload.kind().as_str(),
            payload.session_id(),
            raw,
            max_attempts,
            format_timestamp(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Whether any pending or running task of `kind` has a payload matching
/// `predicate`.
pub fn exists<P>(conn: &Connection, kind: TaskKind, predicate: P) -> Result<bool, DatabaseError>
where
    P: Fn(&TaskPayload) -> bool,
{
    let mut stmt = conn.prepare(
        "SELECT payload FROM tasks WHERE kind = ?1 AND status IN ('pending', 'running')",
    )?;
    let raws = stmt
        .query_map(params![kind.as_str()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for raw in raws {
        if predicate(&decode_payload(&raw)?) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Moves the oldest pending task of `queue` to `running`. Must run inside
/// an immediate transaction so two consumers never claim the same row.
pub fn claim_next(
    conn: &Connection,
    queue: &str,
    now: DateTime<Utc>,
) -> Result<Option<Task>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, payload, attempts, max_attempts FROM tasks
             WHERE queue = ?1 AND status = 'pending' ORDER BY id LIMIT 1",
            params![queue],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((id, raw, attempts, max_attempts)) = row else {
        return Ok(None);
    };

    conn.execute(
        "UPDATE tasks SET status = 'running', attempts = attempts + 1, started_at = ?2
         WHERE id = ?1 AND status = 'pending'",
        params![id, format_timestamp(now)],
    )?;

    Ok(Some(Task {
        id,
        queue: queue.to_string(),
        payload: decode_payload(&raw)?,
        attempt: attempts + 1,
        max_attempts,
    }))
}

/// Marks the claim identified by `(id, attempt)` as done.
pub fn complete(
    conn: &Connection,
    id: i64,
    attempt: u32,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'done', finished_at = ?3
         WHERE id = ?1 AND attempts = ?2 AND status = 'running'",
        params![id, attempt, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// Records a failed claim. When `retry` is set and attempts remain the
/// task goes back to `pending`; otherwise it becomes terminally `failed`.
/// Returns the resulting status, or `None` if the claim was stale.
pub fn fail(
    conn: &Connection,
    id: i64,
    attempt: u32,
    error: &str,
    retry: bool,
    now: DateTime<Utc>,
) -> Result<Option<TaskStatus>, DatabaseError> {
    let changed = conn.execute(
        "UPDATE tasks SET
            status = CASE WHEN ?4 AND attempts < max_attempts THEN 'pending' ELSE 'failed' END,
            started_at = CASE WHEN ?4 AND attempts < max_attempts THEN NULL ELSE started_at END,
            finished_at = CASE WHEN ?4 AND attempts < max_attempts THEN NULL ELSE ?5 END,
            last_error = ?3
         WHERE id = ?1 AND attempts = ?2 AND status = 'running'",
        params![id, attempt, error, retry, format_timestamp(now)],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    let status: String =
        conn.query_row("SELECT status FROM tasks WHERE id = ?1", params![id], |r| {
            r.get(0)
        })?;
    Ok(TaskStatus::parse(&status))
}

/// Tasks running since before `cutoff` are presumed lost (crashed or hung
/// consumer). They are re-queued while attempts remain, otherwise failed.
/// Returns `(requeued, failed)`.
pub fn requeue_expired(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(u64, u64), DatabaseError> {
    let cutoff = format_timestamp(cutoff);
    let failed = conn.execute(
        "UPDATE tasks SET status = 'failed', finished_at = ?2, last_error = 'timed out'
         WHERE status = 'running' AND started_at < ?1 AND attempts >= max_attempts",
        params![cutoff, format_timestamp(now)],
    )?;
    let requeued = conn.execute(
        "UPDATE tasks SET status = 'pending', started_at = NULL, last_error = 'timed out'
         WHERE status = 'running' AND started_at < ?1 AND attempts < max_attempts",
        params![cutoff],
    )?;
    Ok((requeued as u64, failed as u64))
}

/// Deletes `done` and `failed` tasks of `queue` that finished before
/// `cutoff`. Returns the number removed.
pub fn purge_finished(
    conn: &Connection,
    queue: &str,
    cutoff: DateTime<Utc>,
) -> Result<u64, DatabaseError> {
    let removed = conn.execute(
        "DELETE FROM tasks
         WHERE queue = ?1 AND status IN ('done', 'failed') AND finished_at < ?2",
        params![queue, format_timestamp(cutoff)],
    )?;
    Ok(removed as u64)
}

/// Task counts by status for one batch.
pub fn counts_for(conn: &Connection, session_id: &str) -> Result<TaskCounts, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM tasks WHERE session_id = ?1 GROUP BY status")?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = TaskCounts::default();
    for (status, count) in rows {
        match TaskStatus::parse(&status) {
            Some(TaskStatus::Pending) => counts.pending = count,
            Some(TaskStatus::Running) => counts.running = count,
            Some(TaskStatus::Done) => counts.done = count,
            Some(TaskStatus::Failed) => counts.failed = count,
            None => log::warn!("Unknown task status '{}' for batch {}", status, session_id),
        }
    }
    Ok(counts)
}
