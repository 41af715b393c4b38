//! Generation repository: the `generations`, `generation_units` and
//! `generation_log` tables.
//!
//! Every mutation of a shared counter is a single SQL statement
//! (`SET processed = processed + 1`), never a read-modify-write in Rust.
//! State transitions carry their precondition in the `WHERE` clause and
//! report whether they applied.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, parse_timestamp, DatabaseError};
use crate::generation::record::{
    GenerationKind, GenerationRecord, GenerationState, LogEntry, NewGeneration, ProducedCard,
    Severity, UnitOutcome,
};

const SELECT_GENERATION: &str = "SELECT session_id, owner, kind, state, template_id, total,
    processed, succeeded, failed_count, message, archive_reference, finalize_claimed,
    created_at, started_at, completed_at FROM generations";

fn corrupt(reason: String) -> DatabaseError {
    DatabaseError::Corrupt { reason }
}

fn parse_optional_timestamp(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_timestamp).transpose()
}

/// Raw column values, decoded into a `GenerationRecord` outside the row
/// callback so that decoding errors keep their own type.
struct GenerationRow {
    session_id: String,
    owner: Option<String>,
    kind: String,
    state: String,
    template_id: Option<i64>,
    total: i64,
    processed: i64,
    succeeded: i64,
    failed_count: i64,
    message: String,
    archive_reference: Option<String>,
    finalize_claimed: bool,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl GenerationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            session_id: row.get("session_id")?,
            owner: row.get("owner")?,
            kind: row.get("kind")?,
            state: row.get("state")?,
            template_id: row.get("template_id")?,
            total: row.get("total")?,
            processed: row.get("processed")?,
            succeeded: row.get("succeeded")?,
            failed_count: row.get("failed_count")?,
            message: row.get("message")?,
            archive_reference: row.get("archive_reference")?,
            finalize_claimed: row.get("finalize_claimed")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn into_record(self) -> Result<GenerationRecord, DatabaseError> {
        let kind = GenerationKind::parse(&self.kind)
            .ok_or_else(|| corrupt(format!("unknown generation kind '{}'", self.kind)))?;
        let state = GenerationState::parse(&self.state)
            .ok_or_else(|| corrupt(format!("unknown generation state '{}'", self.state)))?;

        Ok(GenerationRecord {
            session_id: self.session_id,
            owner: self.owner,
            kind,
            state,
            template_id: self.template_id,
            total: self.total.max(0) as u64,
            processed: self.processed.max(0) as u64,
            succeeded: self.succeeded.max(0) as u64,
            failed_count: self.failed_count.max(0) as u64,
            message: self.message,
            log: Vec::new(),
            archive_reference: self.archive_reference,
            finalize_claimed: self.finalize_claimed,
            created_at: parse_timestamp(&self.created_at)?,
            started_at: parse_optional_timestamp(self.started_at)?,
            completed_at: parse_optional_timestamp(self.completed_at)?,
        })
    }
}

/// Inserts a new batch in the `pending` state with no total yet.
pub fn insert(
    conn: &Connection,
    generation: &NewGeneration,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO generations (session_id, owner, kind, state, template_id, message, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, 'Preparing', ?5)",
        params![
            generation.session_id,
            generation.owner,
            generation.kind.as_str(),
            generation.template_id,
            format_timestamp(now),
        ],
    )?;
    Ok(())
}

/// `pending -> running`, fixing `total`. Returns false if the batch was not pending.
pub fn promote_to_running(
    conn: &Connection,
    session_id: &str,
    total: u64,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE generations SET state = 'running', total = ?2, started_at = ?3,
         message = 'Generating ' || ?2 || ' cards'
         WHERE session_id = ?1 AND state = 'pending'",
        params![session_id, total as i64, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// Loads a batch without its log.
pub fn find(conn: &Connection, session_id: &str) -> Result<Option<GenerationRecord>, DatabaseError> {
    let sql = format!("{} WHERE session_id = ?1", SELECT_GENERATION);
    let row = conn
        .query_row(&sql, params![session_id], GenerationRow::from_row)
        .optional()?;
    row.map(GenerationRow::into_record).transpose()
}

/// Loads a batch together with its most recent `log_limit` log entries.
pub fn find_with_log(
    conn: &Connection,
    session_id: &str,
    log_limit: usize,
) -> Result<Option<GenerationRecord>, DatabaseError> {
    let Some(mut record) = find(conn, session_id)? else {
        return Ok(None);
    };
    record.log = recent_log(conn, session_id, log_limit)?;
    Ok(Some(record))
}

/// Records one unit outcome and bumps the counters, in the caller's
/// transaction.
///
/// The counters move only when the `(session_id, driver_id)` row is new,
/// so a unit replayed by the scheduler after a crash is never counted
/// twice. Returns whether this call counted the unit.
pub fn record_unit(
    conn: &Connection,
    session_id: &str,
    driver_id: i64,
    outcome: &UnitOutcome,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let (status, artifact, error) = match outcome {
        UnitOutcome::Succeeded { artifact } => {
            ("succeeded", Some(artifact.to_string_lossy().to_string()), None)
        }
        UnitOutcome::Failed { error } => ("failed", None, Some(error.clone())),
    };

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO generation_units
         (session_id, driver_id, status, artifact_path, error, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session_id,
            driver_id,
            status,
            artifact,
            error,
            format_timestamp(now)
        ],
    )?;
    if inserted == 0 {
        return Ok(false);
    }

    let (succeeded, failed) = if outcome.is_success() { (1, 0) } else { (0, 1) };
    conn.execute(
        "UPDATE generations SET processed = processed + 1,
         succeeded = succeeded + ?2, failed_count = failed_count + ?3,
         message = 'Processed ' || (processed + 1) || ' of ' || total
         WHERE session_id = ?1",
        params![session_id, succeeded, failed],
    )?;
    Ok(true)
}

/// The outcome already on the ledger for a unit, if any.
pub fn find_unit(
    conn: &Connection,
    session_id: &str,
    driver_id: i64,
) -> Result<Option<UnitOutcome>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT status, artifact_path, error FROM generation_units
             WHERE session_id = ?1 AND driver_id = ?2",
            params![session_id, driver_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((status, artifact, error)) = row else {
        return Ok(None);
    };
    match (status.as_str(), artifact) {
        ("succeeded", Some(artifact)) => Ok(Some(UnitOutcome::Succeeded {
            artifact: PathBuf::from(artifact),
        })),
        ("failed", _) => Ok(Some(UnitOutcome::Failed {
            error: error.unwrap_or_default(),
        })),
        _ => Err(corrupt(format!(
            "unit {}/{} has inconsistent status '{}'",
            session_id, driver_id, status
        ))),
    }
}

/// Appends a log entry and drops the oldest entries beyond `capacity`.
pub fn append_log(
    conn: &Connection,
    session_id: &str,
    entry: &LogEntry,
    capacity: usize,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO generation_log (session_id, logged_at, severity, text, data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            session_id,
            format_timestamp(entry.timestamp),
            entry.severity.as_str(),
            entry.text,
            entry.data.to_string(),
        ],
    )?;
    conn.execute(
        "DELETE FROM generation_log WHERE session_id = ?1 AND id NOT IN (
            SELECT id FROM generation_log WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
         )",
        params![session_id, capacity as i64],
    )?;
    Ok(())
}

/// Returns up to `limit` most recent log entries, oldest first.
pub fn recent_log(
    conn: &Connection,
    session_id: &str,
    limit: usize,
) -> Result<Vec<LogEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT logged_at, severity, text, data FROM generation_log
         WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![session_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut entries = rows
        .into_iter()
        .map(|(logged_at, severity, text, data)| {
            Ok(LogEntry {
                timestamp: parse_timestamp(&logged_at)?,
                severity: Severity::parse(&severity)
                    .ok_or_else(|| corrupt(format!("unknown severity '{}'", severity)))?,
                text,
                data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
            })
        })
        .collect::<Result<Vec<_>, DatabaseError>>()?;
    entries.reverse();
    Ok(entries)
}

/// Compare-and-swap on the finalization flag. Succeeds for exactly one
/// caller per batch, and only while the batch is running with every unit
/// processed.
pub fn claim_finalization(conn: &Connection, session_id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE generations SET finalize_claimed = 1
         WHERE session_id = ?1 AND state = 'running' AND finalize_claimed = 0
           AND processed >= total",
        params![session_id],
    )?;
    Ok(changed == 1)
}

/// `running -> completed`, setting the archive reference in the same statement.
pub fn mark_completed(
    conn: &Connection,
    session_id: &str,
    archive_reference: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE generations SET state = 'completed', archive_reference = ?2, message = ?3,
         completed_at = ?4
         WHERE session_id = ?1 AND state = 'running'",
        params![session_id, archive_reference, message, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// `{pending | running} -> failed`. Never touches a terminal batch.
pub fn mark_failed(
    conn: &Connection,
    session_id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE generations SET state = 'failed', message = ?2, completed_at = ?3
         WHERE session_id = ?1 AND state IN ('pending', 'running')",
        params![session_id, message, format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

/// Successful units in the order they were recorded.
pub fn produced_cards(
    conn: &Connection,
    session_id: &str,
) -> Result<Vec<ProducedCard>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT driver_id, artifact_path FROM generation_units
         WHERE session_id = ?1 AND status = 'succeeded' AND artifact_path IS NOT NULL
         ORDER BY recorded_at, driver_id",
    )?;
    let cards = stmt
        .query_map(params![session_id], |row| {
            Ok(ProducedCard {
                driver_id: row.get(0)?,
                artifact: PathBuf::from(row.get::<_, String>(1)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cards)
}

/// Most recent batches, newest first, optionally restricted to one owner.
pub fn list_recent(
    conn: &Connection,
    owner: Option<&str>,
    limit: u64,
) -> Result<Vec<GenerationRecord>, DatabaseError> {
    let sql = format!(
        "{} WHERE (?1 IS NULL OR owner = ?1) ORDER BY pk DESC LIMIT ?2",
        SELECT_GENERATION
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![owner, limit as i64], GenerationRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(GenerationRow::into_record).collect()
}

/// Session ids of running batches started before `cutoff`.
pub fn running_started_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT session_id FROM generations
         WHERE state = 'running' AND started_at < ?1 ORDER BY pk",
    )?;
    let ids = stmt
        .query_map(params![format_timestamp(cutoff)], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn new_generation(session_id: &str) -> NewGeneration {
        NewGeneration {
            session_id: session_id.to_string(),
            owner: Some("supervisor@coop".to_string()),
            kind: GenerationKind::Bulk,
            template_id: Some(1),
        }
    }

    fn running(db: &Database, session_id: &str, total: u64) {
        db.with_conn(|conn| {
            insert(conn, &new_generation(session_id), Utc::now())?;
            assert!(promote_to_running(conn, session_id, total, Utc::now())?);
            Ok::<_, DatabaseError>(())
        })
        .unwrap();
    }

    fn load(db: &Database, session_id: &str) -> GenerationRecord {
        db.with_conn(|conn| find(conn, session_id)).unwrap().unwrap()
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        db.with_conn(|conn| insert(conn, &new_generation("g1"), Utc::now()))
            .unwrap();

        let record = load(&db, "g1");
        assert_eq!(record.state, GenerationState::Pending);
        assert_eq!(record.kind, GenerationKind::Bulk);
        assert_eq!(record.total, 0);
        assert!(record.started_at.is_none());
        assert!(record.archive_reference.is_none());
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        let found = db.with_conn(|conn| find(conn, "missing")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_promote_only_from_pending() {
        let db = test_db();
        running(&db, "g2", 4);
        let again = db
            .with_conn(|conn| promote_to_running(conn, "g2", 9, Utc::now()))
            .unwrap();
        assert!(!again);
        assert_eq!(load(&db, "g2").total, 4);
    }

    #[test]
    fn test_record_unit_counts_once_per_driver() {
        let db = test_db();
        running(&db, "g3", 2);
        let ok = UnitOutcome::Succeeded {
            artifact: PathBuf::from("/cards/1.pdf"),
        };

        let first = db
            .with_conn(|conn| record_unit(conn, "g3", 1, &ok, Utc::now()))
            .unwrap();
        let replay = db
            .with_conn(|conn| record_unit(conn, "g3", 1, &ok, Utc::now()))
            .unwrap();
        assert!(first);
        assert!(!replay);
        assert_eq!(
            db.with_conn(|conn| find_unit(conn, "g3", 1)).unwrap(),
            Some(ok.clone())
        );
        assert!(db.with_conn(|conn| find_unit(conn, "g3", 2)).unwrap().is_none());

        let failed = UnitOutcome::Failed {
            error: "render".to_string(),
        };
        db.with_conn(|conn| record_unit(conn, "g3", 2, &failed, Utc::now()))
            .unwrap();

        let record = load(&db, "g3");
        assert_eq!(record.processed, 2);
        assert_eq!(record.succeeded, 1);
        assert_eq!(record.failed_count, 1);
        assert_eq!(record.message, "Processed 2 of 2");
    }

    #[test]
    fn test_log_is_capped_to_newest_entries() {
        let db = test_db();
        running(&db, "g4", 1);
        db.with_conn(|conn| {
            for i in 0..8 {
                append_log(
                    conn,
                    "g4",
                    &LogEntry::info(format!("entry {}", i), serde_json::json!({ "i": i })),
                    5,
                )?;
            }
            Ok::<_, DatabaseError>(())
        })
        .unwrap();

        let log = db.with_conn(|conn| recent_log(conn, "g4", 100)).unwrap();
        assert_eq!(log.len(), 5);
        assert_eq!(log.first().unwrap().text, "entry 3");
        assert_eq!(log.last().unwrap().text, "entry 7");
        assert_eq!(log.last().unwrap().data["i"], 7);
    }

    #[test]
    fn test_claim_finalization_is_single_shot() {
        let db = test_db();
        running(&db, "g5", 1);

        let early = db.with_conn(|conn| claim_finalization(conn, "g5")).unwrap();
        assert!(!early, "claim must wait for processed >= total");

        let ok = UnitOutcome::Succeeded {
            artifact: PathBuf::from("/cards/9.pdf"),
        };
        db.with_conn(|conn| record_unit(conn, "g5", 9, &ok, Utc::now()))
            .unwrap();

        let first = db.with_conn(|conn| claim_finalization(conn, "g5")).unwrap();
        let second = db.with_conn(|conn| claim_finalization(conn, "g5")).unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn test_terminal_transitions_move_forward_only() {
        let db = test_db();
        running(&db, "g6", 0);

        let completed = db
            .with_conn(|conn| mark_completed(conn, "g6", "/a/carnets_g6.zip", "done", Utc::now()))
            .unwrap();
        assert!(completed);

        let failed = db
            .with_conn(|conn| mark_failed(conn, "g6", "late failure", Utc::now()))
            .unwrap();
        assert!(!failed);

        let record = load(&db, "g6");
        assert_eq!(record.state, GenerationState::Completed);
        assert_eq!(record.archive_reference.as_deref(), Some("/a/carnets_g6.zip"));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_completed_requires_running() {
        let db = test_db();
        db.with_conn(|conn| insert(conn, &new_generation("g7"), Utc::now()))
            .unwrap();
        let completed = db
            .with_conn(|conn| mark_completed(conn, "g7", "/a.zip", "done", Utc::now()))
            .unwrap();
        assert!(!completed);
        assert!(load(&db, "g7").archive_reference.is_none());
    }

    #[test]
    fn test_produced_cards_lists_successes_only() {
        let db = test_db();
        running(&db, "g8", 3);
        db.with_conn(|conn| {
            record_unit(
                conn,
                "g8",
                1,
                &UnitOutcome::Succeeded {
                    artifact: PathBuf::from("/cards/1.pdf"),
                },
                Utc::now(),
            )?;
            record_unit(
                conn,
                "g8",
                2,
                &UnitOutcome::Failed {
                    error: "boom".to_string(),
                },
                Utc::now(),
            )?;
            record_unit(
                conn,
                "g8",
                3,
                &UnitOutcome::Succeeded {
                    artifact: PathBuf::from("/cards/3.pdf"),
                },
                Utc::now(),
            )?;
            Ok::<_, DatabaseError>(())
        })
        .unwrap();

        let cards = db.with_conn(|conn| produced_cards(conn, "g8")).unwrap();
        let ids: Vec<i64> = cards.iter().map(|c| c.driver_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_list_recent_filters_by_owner() {
        let db = test_db();
        db.with_conn(|conn| {
            insert(conn, &new_generation("a"), Utc::now())?;
            insert(conn, &new_generation("b"), Utc::now())?;
            let mut other = new_generation("c");
            other.owner = Some("auditor".to_string());
            insert(conn, &other, Utc::now())?;
            Ok::<_, DatabaseError>(())
        })
        .unwrap();

        let mine = db
            .with_conn(|conn| list_recent(conn, Some("supervisor@coop"), 10))
            .unwrap();
        let ids: Vec<&str> = mine.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        let everyone = db.with_conn(|conn| list_recent(conn, None, 2)).unwrap();
        assert_eq!(everyone.len(), 2);
        assert_eq!(everyone[0].session_id, "c");
    }

    #[test]
    fn test_running_started_before() {
        let db = test_db();
        running(&db, "old", 1);
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let stale = db
            .with_conn(|conn| running_started_before(conn, cutoff))
            .unwrap();
        assert_eq!(stale, vec!["old".to_string()]);

        let none = db
            .with_conn(|conn| running_started_before(conn, Utc::now() - chrono::Duration::hours(1)))
            .unwrap();
        assert!(none.is_empty());
    }
}
