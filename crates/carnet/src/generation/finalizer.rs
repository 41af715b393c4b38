use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::{info_span, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::record::{GenerationRecord, GenerationState, LogEntry, ProducedCard};
use super::retention::{prune_archives, PruneReport};
use super::GenerationError;
use crate::db::{generation_repo, Database};
use crate::error::StorageError;
use crate::sanitize;
use crate::storage::ArtifactStore;

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Completed {
        archive: PathBuf,
        included: usize,
        skipped: usize,
        pruned: PruneReport,
    },
    /// Nothing to do: the batch is terminal or still has units outstanding.
    Skipped { state: GenerationState },
}

/// Assembles the batch archive and closes the record.
pub struct Finalizer {
    db: Database,
    store: ArtifactStore,
    log_capacity: usize,
    retention_keep: usize,
}

struct Assembled {
    archive: PathBuf,
    included: usize,
    skipped: usize,
}

impl Finalizer {
    pub fn new(db: Database, store: ArtifactStore, log_capacity: usize, retention_keep: usize) -> Self {
        Self {
            db,
            store,
            log_capacity,
            retention_keep,
        }
    }

    /// Finalizes a batch whose units have all reported.
    ///
    /// Errors other than infrastructure faults mark the batch `failed`
    /// before being returned. Infrastructure faults leave it `running` so
    /// the queue can retry the task.
    pub fn run(&self, session_id: &str) -> Result<FinalizeOutcome, GenerationError> {
        let _span = info_span!("finalize", session = session_id).entered();

        let record = self
            .db
            .with_conn(|conn| generation_repo::find(conn, session_id))?
            .ok_or_else(|| GenerationError::NotFound(format!("batch {}", session_id)))?;

        if !record.ready_for_finalization() {
            log::info!(
                "Batch {} is {} with {}/{} processed, nothing to finalize",
                session_id,
                record.state,
                record.processed,
                record.total
            );
            return Ok(FinalizeOutcome::Skipped {
                state: record.state,
            });
        }

        let assembled = match self.assemble(&record) {
            Ok(assembled) => assembled,
            Err(e) if e.is_infrastructure() => return Err(e),
            Err(e) => {
                self.fail(&record, &e)?;
                return Err(e);
            }
        };

        let message = format!(
            "Completed: {} card(s) archived, {} failed",
            assembled.included, record.failed_count
        );
        let reference = assembled.archive.to_string_lossy().to_string();
        let completed = self.db.with_immediate_tx(|conn| {
            if !generation_repo::mark_completed(conn, session_id, &reference, &message, Utc::now())?
            {
                return Ok(false);
            }
            generation_repo::append_log(
                conn,
                session_id,
                &LogEntry::info(
                    message.clone(),
                    json!({
                        "archive": sanitize::redact_path(&assembled.archive),
                        "included": assembled.included,
                        "skipped": assembled.skipped,
                        "succeeded": record.succeeded,
                        "failed": record.failed_count,
                    }),
                ),
                self.log_capacity,
            )?;
            Ok::<_, GenerationError>(true)
        })?;

        if !completed {
            // Closed by someone else (the watchdog) while we were zipping.
            log::warn!(
                "Batch {} was closed during finalization, discarding archive",
                session_id
            );
            remove_quietly(&assembled.archive);
            let state = self
                .db
                .with_conn(|conn| generation_repo::find(conn, session_id))?
                .map(|r| r.state)
                .unwrap_or(GenerationState::Failed);
            return Ok(FinalizeOutcome::Skipped { state });
        }

        log::info!("Batch {}: {}", session_id, message);
        self.store.clear_session_work(session_id);

        let pruned = {
            let _step = info_span!("prune_archives").entered();
            prune_archives(self.store.archive_root(), self.retention_keep)
        };

        Ok(FinalizeOutcome::Completed {
            archive: assembled.archive,
            included: assembled.included,
            skipped: assembled.skipped,
            pruned,
        })
    }

    fn assemble(&self, record: &GenerationRecord) -> Result<Assembled, GenerationError> {
        let session_id = &record.session_id;
        if record.succeeded == 0 {
            return Err(GenerationError::NoOutput {
                session_id: session_id.clone(),
            });
        }

        let cards = self
            .db
            .with_conn(|conn| generation_repo::produced_cards(conn, session_id))?;

        self.store.ensure_archive_root()?;
        let archive = self.store.archive_path(session_id);
        let partial = archive.with_extension("zip.part");

        let (included, skipped) = {
            let _step = info_span!("write_archive", archive = %sanitize::redact_path(&archive)).entered();
            match write_archive(&partial, &cards) {
                Ok(counts) => counts,
                Err(e) => {
                    remove_quietly(&partial);
                    return Err(e.into());
                }
            }
        };

        if included == 0 {
            remove_quietly(&partial);
            return Err(GenerationError::EmptyArchive {
                session_id: session_id.clone(),
                expected: record.succeeded,
            });
        }

        std::fs::rename(&partial, &archive).map_err(|e| StorageError::MoveFile {
            from: partial.clone(),
            to: archive.clone(),
            source: e,
        })?;

        Ok(Assembled {
            archive,
            included,
            skipped,
        })
    }

    fn fail(&self, record: &GenerationRecord, error: &GenerationError) -> Result<(), GenerationError> {
        let session_id = &record.session_id;
        let message = format!("Failed: {}", error);
        log::error!("Batch {} failed during finalization: {}", session_id, error);

        self.db.with_immediate_tx(|conn| {
            if generation_repo::mark_failed(conn, session_id, &message, Utc::now())? {
                generation_repo::append_log(
                    conn,
                    session_id,
                    &LogEntry::error(
                        message.clone(),
                        json!({
                            "error": error.to_string(),
                            "succeeded": record.succeeded,
                            "failed": record.failed_count,
                        }),
                    ),
                    self.log_capacity,
                )?;
            }
            Ok::<_, GenerationError>(())
        })
    }
}

/// Writes every card that still exists into a new zip at `path`. Returns
/// `(included, skipped)`.
fn write_archive(path: &Path, cards: &[ProducedCard]) -> Result<(usize, usize), StorageError> {
    let file = File::create(path).map_err(|e| StorageError::WriteArchive {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let zip_err = |e: zip::result::ZipError| StorageError::Zip {
        path: path.to_path_buf(),
        source: e,
    };

    let mut included = 0;
    let mut skipped = 0;
    for card in cards {
        let mut source = match File::open(&card.artifact) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    driver_id = card.driver_id,
                    file = %sanitize::redact_path(&card.artifact),
                    "Card vanished before archiving, skipping"
                );
                skipped += 1;
                continue;
            }
            Err(e) => {
                return Err(StorageError::Read {
                    path: card.artifact.clone(),
                    source: e,
                })
            }
        };

        // Sanitized document numbers can collide, driver ids cannot.
        let name = format!("{}/{}", card.driver_id, sanitize::redact_path(&card.artifact));
        zip.start_file(name, options).map_err(zip_err)?;
        std::io::copy(&mut source, &mut zip).map_err(|e| StorageError::WriteArchive {
            path: path.to_path_buf(),
            source: e,
        })?;
        included += 1;
    }

    let write_err = |e: std::io::Error| StorageError::WriteArchive {
        path: path.to_path_buf(),
        source: e,
    };
    let file = zip
        .finish()
        .map_err(zip_err)?
        .into_inner()
        .map_err(|e| write_err(e.into_error()))?;
    file.sync_all().map_err(write_err)?;
    Ok((included, skipped))
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
