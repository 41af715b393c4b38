//! Read side of the pipeline: what callers poll.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::record::{GenerationKind, GenerationRecord, GenerationState, LogEntry};
use super::GenerationError;
use crate::db::{generation_repo, Database};

/// Snapshot returned to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStatus {
    pub session_id: String,
    pub kind: GenerationKind,
    pub state: GenerationState,
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub message: String,
    pub log: Vec<LogEntry>,
    pub archive_reference: Option<String>,
    /// Seconds since the batch started, up to completion.
    pub elapsed_secs: Option<i64>,
    /// Extrapolated from the mean time per processed unit; only while running.
    pub estimated_remaining_secs: Option<i64>,
}

impl GenerationStatus {
    pub fn from_record(record: GenerationRecord, now: DateTime<Utc>) -> Self {
        let elapsed = elapsed(&record, now);
        let estimated_remaining = elapsed.and_then(|e| estimate_remaining(&record, e));
        Self {
            session_id: record.session_id,
            kind: record.kind,
            state: record.state,
            total: record.total,
            processed: record.processed,
            succeeded: record.succeeded,
            failed: record.failed_count,
            message: record.message,
            log: record.log,
            archive_reference: record.archive_reference,
            elapsed_secs: elapsed.map(|d| d.num_seconds()),
            estimated_remaining_secs: estimated_remaining.map(|d| d.num_seconds()),
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.processed.min(self.total) * 100) / self.total) as u8
    }
}

fn elapsed(record: &GenerationRecord, now: DateTime<Utc>) -> Option<Duration> {
    let started = record.started_at?;
    let end = record.completed_at.unwrap_or(now);
    Some((end - started).max(Duration::zero()))
}

fn estimate_remaining(record: &GenerationRecord, elapsed: Duration) -> Option<Duration> {
    if record.state != GenerationState::Running || record.processed == 0 {
        return None;
    }
    let remaining = record.total.saturating_sub(record.processed);
    let per_unit_ms = elapsed.num_milliseconds() / record.processed as i64;
    Some(Duration::milliseconds(per_unit_ms * remaining as i64))
}

pub struct StatusService {
    db: Database,
    log_capacity: usize,
}

impl StatusService {
    pub fn new(db: Database, log_capacity: usize) -> Self {
        Self { db, log_capacity }
    }

    pub fn status(&self, session_id: &str) -> Result<GenerationStatus, GenerationError> {
        let record = self
            .db
            .with_conn(|conn| generation_repo::find_with_log(conn, session_id, self.log_capacity))?
            .ok_or_else(|| GenerationError::NotFound(format!("batch {}", session_id)))?;
        Ok(GenerationStatus::from_record(record, Utc::now()))
    }

    /// Archive bytes of a completed batch.
    pub fn download(&self, session_id: &str) -> Result<Vec<u8>, GenerationError> {
        let reference = self
            .db
            .with_conn(|conn| generation_repo::find(conn, session_id))?
            .ok_or_else(|| GenerationError::NotFound(format!("batch {}", session_id)))?
            .archive_reference
            .ok_or_else(|| {
                GenerationError::NotFound(format!("batch {} has no archive", session_id))
            })?;

        match std::fs::read(Path::new(&reference)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GenerationError::NotFound(
                format!("archive of batch {} is no longer on disk", session_id),
            )),
            Err(e) => Err(crate::error::StorageError::Read {
                path: reference.into(),
                source: e,
            }
            .into()),
        }
    }

    /// Most recent batches, newest first, without their logs.
    pub fn history(
        &self,
        owner: Option<&str>,
        limit: u64,
    ) -> Result<Vec<GenerationStatus>, GenerationError> {
        let now = Utc::now();
        let records = self
            .db
            .with_conn(|conn| generation_repo::list_recent(conn, owner, limit))?;
        Ok(records
            .into_iter()
            .map(|r| GenerationStatus::from_record(r, now))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::record::NewGeneration;

    fn record(state: GenerationState, total: u64, processed: u64) -> GenerationRecord {
        let started = Utc::now() - Duration::seconds(100);
        GenerationRecord {
            session_id: "s".to_string(),
            owner: None,
            kind: GenerationKind::Bulk,
            state,
            template_id: None,
            total,
            processed,
            succeeded: processed,
            failed_count: 0,
            message: String::new(),
            log: Vec::new(),
            archive_reference: None,
            finalize_claimed: false,
            created_at: started,
            started_at: Some(started),
            completed_at: None,
        }
    }

    #[test]
    fn test_estimate_while_running() {
        let r = record(GenerationState::Running, 10, 5);
        let now = r.started_at.unwrap() + Duration::seconds(100);
        let status = GenerationStatus::from_record(r, now);
        assert_eq!(status.elapsed_secs, Some(100));
        assert_eq!(status.estimated_remaining_secs, Some(100));
        assert_eq!(status.percent(), 50);
    }

    #[test]
    fn test_no_estimate_before_first_unit_or_when_terminal() {
        let fresh = GenerationStatus::from_record(record(GenerationState::Running, 10, 0), Utc::now());
        assert_eq!(fresh.estimated_remaining_secs, None);

        let mut done = record(GenerationState::Completed, 2, 2);
        done.completed_at = Some(done.started_at.unwrap() + Duration::seconds(30));
        let status = GenerationStatus::from_record(done, Utc::now());
        assert_eq!(status.elapsed_secs, Some(30));
        assert_eq!(status.estimated_remaining_secs, None);
    }

    #[test]
    fn test_download_requires_archive() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            generation_repo::insert(
                conn,
                &NewGeneration {
                    session_id: "d1".to_string(),
                    owner: Some("ops".to_string()),
                    kind: GenerationKind::Single,
                    template_id: None,
                },
                Utc::now(),
            )
        })
        .unwrap();
        let service = StatusService::new(db, 20);

        assert!(matches!(
            service.download("d1"),
            Err(GenerationError::NotFound(_))
        ));
        assert!(matches!(
            service.download("missing"),
            Err(GenerationError::NotFound(_))
        ));

        let status = service.status("d1").unwrap();
        assert_eq!(status.state, GenerationState::Pending);
        assert_eq!(status.elapsed_secs, None);

        let history = service.history(Some("ops"), 10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(service.history(Some("nobody"), 10).unwrap().is_empty());
    }
}
