use serde::Serialize;

use crate::generation::{CardWorker, FinalizeOutcome, Finalizer, GenerationError};
use crate::queue::{QueueError, Task, TaskKind, TaskPayload, TaskQueue, TaskStatus};

/// Result of running one claimed task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: i64,
    pub kind: TaskKind,
    pub session_id: String,
    pub attempt: u32,
    pub success: bool,
    pub error: Option<String>,
    /// The task went back to the queue for another attempt.
    pub requeued: bool,
}

/// Dispatches claimed tasks to the card worker or the finalizer and
/// settles them on the queue.
pub struct TaskExecutor {
    queue: TaskQueue,
    worker: CardWorker,
    finalizer: Finalizer,
}

impl TaskExecutor {
    pub fn new(queue: TaskQueue, worker: CardWorker, finalizer: Finalizer) -> Self {
        Self {
            queue,
            worker,
            finalizer,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Runs a claimed task and records its result on the queue.
    pub fn execute(&self, task: &Task) -> TaskReport {
        let result = match &task.payload {
            TaskPayload::RenderCard(item) => self.worker.process(item).map(|report| {
                log::debug!(
                    "Unit {}/{} done: success={} counted={} gate={:?}",
                    report.session_id,
                    report.driver_id,
                    report.outcome.is_success(),
                    report.counted,
                    report.gate
                );
            }),
            TaskPayload::Finalize { session_id } => {
                self.finalizer.run(session_id).map(|outcome| match outcome {
                    FinalizeOutcome::Completed {
                        included, pruned, ..
                    } => log::debug!(
                        "Batch {} archived {} card(s), pruned {} archive(s)",
                        session_id,
                        included,
                        pruned.removed.len()
                    ),
                    FinalizeOutcome::Skipped { state } => {
                        log::debug!("Finalize of {} skipped, batch is {}", session_id, state)
                    }
                })
            }
        };

        let mut report = TaskReport {
            task_id: task.id,
            kind: task.kind(),
            session_id: task.session_id().to_string(),
            attempt: task.attempt,
            success: result.is_ok(),
            error: None,
            requeued: false,
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.queue.complete(task) {
                    log::error!("Failed to complete task {}: {}", task.id, e);
                }
            }
            Err(e) => {
                let error = e.to_string();
                match self.queue.fail(task, &error, retry_policy(&e)) {
                    Ok(status) => report.requeued = status == Some(TaskStatus::Pending),
                    Err(qe) => log::error!("Failed to record failure of task {}: {}", task.id, qe),
                }
                report.error = Some(error);
            }
        }
        report
    }

    /// Claims and runs the next task, if any.
    pub fn run_next(&self) -> Result<Option<TaskReport>, QueueError> {
        let Some(task) = self.queue.claim_next()? else {
            return Ok(None);
        };
        Ok(Some(self.execute(&task)))
    }

    /// Runs tasks on the calling thread until the queue has nothing
    /// pending, including finalize tasks scheduled along the way.
    pub fn run_until_idle(&self) -> Result<Vec<TaskReport>, QueueError> {
        let mut reports = Vec::new();
        while let Some(report) = self.run_next()? {
            reports.push(report);
        }
        Ok(reports)
    }
}

/// Only infrastructure faults are worth another attempt; every other
/// error would fail the same way again.
fn retry_policy(error: &GenerationError) -> bool {
    error.is_infrastructure()
}
