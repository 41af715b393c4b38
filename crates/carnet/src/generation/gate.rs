//! Exactly-once admission of the finalize step.
//!
//! Workers finishing the last units of a batch race each other here. The
//! whole decision runs inside one `BEGIN IMMEDIATE` transaction, which
//! holds SQLite's write lock from the first read: the completion check,
//! the look-up of an in-flight finalize task, the claim flag and the
//! enqueue all commit together or not at all. Every later caller sees the
//! claim, the queued task, or a state past `running`.

use serde_json::json;
use tracing::info_span;

use super::record::{GenerationState, LogEntry};
use super::GenerationError;
use crate::db::{generation_repo, Database};
use crate::queue::{TaskKind, TaskPayload, TaskQueue};

/// What the gate decided for one caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Units are still outstanding.
    Pending { processed: u64, total: u64 },
    /// This caller scheduled the finalize task.
    Scheduled { task_id: i64 },
    /// Another caller already did.
    AlreadyScheduled,
    /// The batch is no longer running.
    Closed(GenerationState),
}

#[derive(Clone)]
pub struct CompletionGate {
    db: Database,
    queue: TaskQueue,
    log_capacity: usize,
}

impl CompletionGate {
    pub fn new(db: Database, queue: TaskQueue, log_capacity: usize) -> Self {
        Self {
            db,
            queue,
            log_capacity,
        }
    }

    pub fn evaluate(&self, session_id: &str) -> Result<GateDecision, GenerationError> {
        let _span = info_span!("completion_gate", session = session_id).entered();

        let decision = self.db.with_immediate_tx(|conn| {
            let record = generation_repo::find(conn, session_id)?
                .ok_or_else(|| GenerationError::NotFound(format!("batch {}", session_id)))?;

            if record.state != GenerationState::Running {
                return Ok(GateDecision::Closed(record.state));
            }
            if record.processed < record.total {
                return Ok(GateDecision::Pending {
                    processed: record.processed,
                    total: record.total,
                });
            }

            let in_flight = self.queue.exists_in(conn, TaskKind::Finalize, |payload| {
                payload.session_id() == session_id
            })?;
            if in_flight || !generation_repo::claim_finalization(conn, session_id)? {
                return Ok(GateDecision::AlreadyScheduled);
            }

            let task_id = self.queue.enqueue_in(
                conn,
                &TaskPayload::Finalize {
                    session_id: session_id.to_string(),
                },
            )?;
            generation_repo::append_log(
                conn,
                session_id,
                &LogEntry::info(
                    format!(
                        "All {} unit(s) processed, finalization scheduled",
                        record.total
                    ),
                    json!({
                        "task_id": task_id,
                        "succeeded": record.succeeded,
                        "failed": record.failed_count,
                    }),
                ),
                self.log_capacity,
            )?;
            Ok::<_, GenerationError>(GateDecision::Scheduled { task_id })
        })?;

        if let GateDecision::Scheduled { task_id } = &decision {
            log::info!(
                "Batch {} complete, finalize task {} scheduled",
                session_id,
                task_id
            );
        }
        Ok(decision)
    }
}
