use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use super::record::LogEntry;
use super::GenerationError;
use crate::db::{generation_repo, Database};

/// Fails batches that have been `running` for longer than the stall
/// timeout, typically because a unit was lost and never retried.
pub struct Watchdog {
    db: Database,
    stall_timeout: Duration,
    log_capacity: usize,
}

impl Watchdog {
    pub fn new(db: Database, stall_timeout: Duration, log_capacity: usize) -> Self {
        Self {
            db,
            stall_timeout,
            log_capacity,
        }
    }

    /// Returns the session ids that were failed by this sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>, GenerationError> {
        let Some(cutoff) = chrono::Duration::from_std(self.stall_timeout)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
        else {
            return Ok(Vec::new());
        };

        let candidates = self
            .db
            .with_conn(|conn| generation_repo::running_started_before(conn, cutoff))?;

        let mut failed = Vec::new();
        for session_id in candidates {
            let closed = self.db.with_immediate_tx(|conn| {
                let Some(record) = generation_repo::find(conn, &session_id)? else {
                    return Ok(false);
                };
                let message = format!(
                    "Failed: stalled at {}/{} after {}s without completing",
                    record.processed,
                    record.total,
                    self.stall_timeout.as_secs()
                );
                // Guarded on state: a batch finalized meanwhile stays completed.
                if !generation_repo::mark_failed(conn, &session_id, &message, now)? {
                    return Ok(false);
                }
                generation_repo::append_log(
                    conn,
                    &session_id,
                    &LogEntry::error(
                        message,
                        json!({
                            "processed": record.processed,
                            "total": record.total,
                            "stall_timeout_secs": self.stall_timeout.as_secs(),
                        }),
                    ),
                    self.log_capacity,
                )?;
                Ok::<_, GenerationError>(true)
            })?;

            if closed {
                log::warn!("Watchdog failed stalled batch {}", session_id);
                failed.push(session_id);
            }
        }
        Ok(failed)
    }
}
