use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info_span, warn};

use super::gate::{CompletionGate, GateDecision};
use super::record::{LogEntry, UnitOutcome};
use super::GenerationError;
use crate::db::{generation_repo, Database};
use crate::queue::WorkItem;
use crate::registry::{Driver, EntityStore};
use crate::render::CardRenderer;
use crate::sanitize;
use crate::storage::ArtifactStore;

/// What one unit of work ended in.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub session_id: String,
    pub driver_id: i64,
    pub outcome: UnitOutcome,
    /// False when the unit had already been recorded by an earlier attempt.
    pub counted: bool,
    pub gate: GateDecision,
}

/// Renders, stores and records one driver's card.
pub struct CardWorker {
    db: Database,
    entities: Arc<dyn EntityStore>,
    renderer: Arc<dyn CardRenderer>,
    store: ArtifactStore,
    gate: CompletionGate,
    log_capacity: usize,
}

impl CardWorker {
    pub fn new(
        db: Database,
        entities: Arc<dyn EntityStore>,
        renderer: Arc<dyn CardRenderer>,
        store: ArtifactStore,
        gate: CompletionGate,
        log_capacity: usize,
    ) -> Self {
        Self {
            db,
            entities,
            renderer,
            store,
            gate,
            log_capacity,
        }
    }

    /// Processes one unit.
    ///
    /// Failures of the unit itself (missing driver, render or move
    /// failure) are recorded on the batch and returned as a `Failed`
    /// outcome. Only infrastructure errors are returned as `Err`, leaving
    /// the unit uncounted so the queue can retry it.
    pub fn process(&self, item: &WorkItem) -> Result<UnitReport, GenerationError> {
        let _span = info_span!(
            "render_unit",
            session = %item.session_id,
            driver_id = item.driver_id,
        )
        .entered();

        let recorded = self.db.with_conn(|conn| {
            if generation_repo::find(conn, &item.session_id)?.is_none() {
                return Err(GenerationError::NotFound(format!(
                    "batch {}",
                    item.session_id
                )));
            }
            Ok(generation_repo::find_unit(
                conn,
                &item.session_id,
                item.driver_id,
            )?)
        })?;

        if let Some(outcome) = recorded {
            // Replayed after the outcome was committed; only the gate may
            // still be outstanding.
            debug!("Unit already recorded, re-checking completion");
            let gate = self.gate.evaluate(&item.session_id)?;
            return Ok(UnitReport {
                session_id: item.session_id.clone(),
                driver_id: item.driver_id,
                outcome,
                counted: false,
                gate,
            });
        }

        let mut driver = None;
        let outcome = match self.produce(item, &mut driver) {
            Ok(artifact) => UnitOutcome::Succeeded { artifact },
            Err(e) if e.is_infrastructure() => return Err(e),
            Err(e) => {
                warn!(
                    driver_id = item.driver_id,
                    document_number = driver.as_ref().map(|d| d.document_number.as_str()),
                    full_name = driver.as_ref().map(|d| d.full_name.as_str()),
                    error = %e,
                    "Card generation failed"
                );
                UnitOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        let counted = self.record(item, driver.as_ref(), &outcome)?;
        let gate = self.gate.evaluate(&item.session_id)?;

        Ok(UnitReport {
            session_id: item.session_id.clone(),
            driver_id: item.driver_id,
            outcome,
            counted,
            gate,
        })
    }

    /// Steps up to and including the latest-card pointer. The work
    /// directory is removed when this returns, on every path.
    fn produce(
        &self,
        item: &WorkItem,
        driver_slot: &mut Option<Driver>,
    ) -> Result<PathBuf, GenerationError> {
        let driver = {
            let _step = info_span!("load_entities").entered();
            self.entities
                .driver(item.driver_id)?
                .ok_or(GenerationError::MissingEntity {
                    entity: "driver",
                    id: item.driver_id,
                })?
        };
        let driver = driver_slot.insert(driver);
        let template = self
            .entities
            .template(item.template_id)?
            .ok_or(GenerationError::MissingEntity {
                entity: "template",
                id: item.template_id,
            })?;

        let work = self.store.work_dir(&item.session_id, item.driver_id)?;

        let rendered = {
            let _step = info_span!("render").entered();
            self.renderer.render(driver, &template, work.path())?
        };

        let stored = {
            let _step = info_span!("persist", file = %sanitize::redact_path(&rendered)).entered();
            self.store
                .persist(&rendered, &item.session_id, item.driver_id)?
        };

        if !self.entities.set_latest_card(driver.id, &stored)? {
            return Err(GenerationError::MissingEntity {
                entity: "driver",
                id: driver.id,
            });
        }

        Ok(stored)
    }

    /// Counts the outcome and logs it on the batch in one transaction.
    fn record(
        &self,
        item: &WorkItem,
        driver: Option<&Driver>,
        outcome: &UnitOutcome,
    ) -> Result<bool, GenerationError> {
        let _step = info_span!("record_outcome").entered();

        let entry = match outcome {
            UnitOutcome::Succeeded { artifact } => LogEntry::info(
                format!(
                    "Card generated for {}",
                    driver.map(|d| d.full_name.as_str()).unwrap_or("driver")
                ),
                json!({
                    "driver_id": item.driver_id,
                    "document_number": driver.map(|d| d.document_number.clone()),
                    "file": sanitize::redact_path(artifact),
                }),
            ),
            UnitOutcome::Failed { error } => LogEntry::error(
                format!("Card failed for driver {}", item.driver_id),
                json!({
                    "driver_id": item.driver_id,
                    "document_number": driver.map(|d| d.document_number.clone()),
                    "full_name": driver.map(|d| d.full_name.clone()),
                    "error": error,
                }),
            ),
        };

        let counted = self.db.with_immediate_tx(|conn| {
            let counted = generation_repo::record_unit(
                conn,
                &item.session_id,
                item.driver_id,
                outcome,
                Utc::now(),
            )?;
            if counted {
                generation_repo::append_log(conn, &item.session_id, &entry, self.log_capacity)?;
            }
            Ok::<_, GenerationError>(counted)
        })?;

        if !counted {
            debug!("Outcome was recorded concurrently by another attempt");
        }
        Ok(counted)
    }
}
