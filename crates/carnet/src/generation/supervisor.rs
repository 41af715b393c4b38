use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::info_span;

use super::record::{GenerationKind, LogEntry, NewGeneration};
use super::GenerationError;
use crate::db::{generation_repo, Database};
use crate::queue::{TaskPayload, TaskQueue, WorkItem};
use crate::registry::{CardTemplate, EntityStore};

/// Which drivers a batch covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverSelection {
    /// Every active driver.
    All,
    /// Exactly these drivers; unknown ids are dropped.
    Ids(Vec<i64>),
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub selection: DriverSelection,
    /// Template to render with; the active template when `None`.
    pub template_id: Option<i64>,
    pub owner: Option<String>,
}

impl GenerationRequest {
    pub fn bulk(selection: DriverSelection) -> Self {
        Self {
            kind: GenerationKind::Bulk,
            selection,
            template_id: None,
            owner: None,
        }
    }

    pub fn single(driver_id: i64) -> Self {
        Self {
            kind: GenerationKind::Single,
            selection: DriverSelection::Ids(vec![driver_id]),
            template_id: None,
            owner: None,
        }
    }

    /// Re-renders every active driver with a newly activated template.
    pub fn template_change(template_id: i64) -> Self {
        Self {
            kind: GenerationKind::TemplateChange,
            selection: DriverSelection::All,
            template_id: Some(template_id),
            owner: None,
        }
    }

    pub fn with_template(mut self, template_id: i64) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Validates requests, creates the batch record and fans out one task
/// per driver.
pub struct Supervisor {
    db: Database,
    queue: TaskQueue,
    entities: Arc<dyn EntityStore>,
    log_capacity: usize,
}

impl Supervisor {
    pub fn new(
        db: Database,
        queue: TaskQueue,
        entities: Arc<dyn EntityStore>,
        log_capacity: usize,
    ) -> Self {
        Self {
            db,
            queue,
            entities,
            log_capacity,
        }
    }

    /// Starts a batch and returns its session id without waiting for any
    /// unit to run.
    ///
    /// Setup errors (`NoConfiguration`, `NoWork`) are raised before
    /// anything is written. Enqueue failures after the record exists are
    /// logged on the batch and not rolled back.
    pub fn start(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let _span = info_span!("supervise", kind = request.kind.as_str()).entered();

        let template = self.resolve_template(request.template_id)?;
        let (driver_ids, unknown_ids) = self.resolve_drivers(&request.selection)?;
        if driver_ids.is_empty() {
            log::info!("Generation request matched no drivers");
            return Err(GenerationError::NoWork);
        }

        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let total = driver_ids.len() as u64;
        let generation = NewGeneration {
            session_id: session_id.clone(),
            owner: request.owner.clone(),
            kind: request.kind,
            template_id: Some(template.id),
        };

        self.db.with_immediate_tx(|conn| {
            let now = Utc::now();
            generation_repo::insert(conn, &generation, now)?;
            generation_repo::promote_to_running(conn, &session_id, total, now)?;
            generation_repo::append_log(
                conn,
                &session_id,
                &LogEntry::info(
                    format!("Generating {} card(s) with template '{}'", total, template.name),
                    json!({
                        "template_id": template.id,
                        "template_name": template.name,
                        "total": total,
                        "kind": request.kind.as_str(),
                        "unknown_driver_ids": unknown_ids,
                    }),
                ),
                self.log_capacity,
            )?;
            Ok::<_, GenerationError>(())
        })?;

        log::info!(
            "Batch {} started: {} card(s), template {}",
            session_id,
            total,
            template.id
        );

        let mut failed = Vec::new();
        for driver_id in &driver_ids {
            let payload = TaskPayload::RenderCard(WorkItem {
                session_id: session_id.clone(),
                driver_id: *driver_id,
                template_id: template.id,
            });
            if let Err(e) = self.queue.enqueue(&payload) {
                log::error!(
                    "Failed to enqueue driver {} for batch {}: {}",
                    driver_id,
                    session_id,
                    e
                );
                failed.push((*driver_id, e.to_string()));
            }
        }

        if !failed.is_empty() {
            let entry = LogEntry::warning(
                format!(
                    "{} of {} unit(s) could not be enqueued; the batch cannot reach its total",
                    failed.len(),
                    total
                ),
                json!({
                    "driver_ids": failed.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
                    "first_error": failed.first().map(|(_, e)| e.clone()),
                }),
            );
            if let Err(e) = self.db.with_conn(|conn| {
                generation_repo::append_log(conn, &session_id, &entry, self.log_capacity)
            }) {
                log::error!("Failed to log enqueue failures for {}: {}", session_id, e);
            }
        }

        Ok(session_id)
    }

    fn resolve_template(&self, explicit: Option<i64>) -> Result<CardTemplate, GenerationError> {
        let template = match explicit {
            Some(id) => self.entities.template(id)?.filter(|t| t.active),
            None => self.entities.active_template()?,
        };
        template.ok_or(GenerationError::NoConfiguration)
    }

    /// Returns the drivers to render and the requested ids that matched
    /// no driver.
    fn resolve_drivers(
        &self,
        selection: &DriverSelection,
    ) -> Result<(Vec<i64>, Vec<i64>), GenerationError> {
        match selection {
            DriverSelection::All => Ok((self.entities.active_driver_ids()?, Vec::new())),
            DriverSelection::Ids(ids) => {
                let mut requested = ids.clone();
                requested.sort_unstable();
                requested.dedup();

                let existing = self.entities.existing_driver_ids(&requested)?;
                let unknown: Vec<i64> = requested
                    .into_iter()
                    .filter(|id| !existing.contains(id))
                    .collect();
                if !unknown.is_empty() {
                    log::warn!("Ignoring unknown driver id(s): {:?}", unknown);
                }
                Ok((existing, unknown))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::record::GenerationState;
    use crate::queue::TaskKind;
    use crate::registry::{NewDriver, SqliteEntityStore};

    struct Fixture {
        db: Database,
        store: SqliteEntityStore,
        queue: TaskQueue,
        supervisor: Supervisor,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.clone());
        let queue = TaskQueue::new(db.clone(), "carnets", 3);
        let supervisor = Supervisor::new(db.clone(), queue.clone(), Arc::new(store.clone()), 50);
        Fixture {
            db,
            store,
            queue,
            supervisor,
        }
    }

    fn seed_drivers(store: &SqliteEntityStore, n: usize) -> Vec<i64> {
        (0..n)
            .map(|i| {
                store
                    .insert_driver(&NewDriver::new(format!("D{}", i), format!("Driver {}", i)))
                    .unwrap()
            })
            .collect()
    }

    fn count_generations(db: &Database) -> u32 {
        db.with_conn(|conn| {
            Ok::<_, crate::db::DatabaseError>(conn.query_row(
                "SELECT COUNT(*) FROM generations",
                [],
                |r| r.get(0),
            )?)
        })
        .unwrap()
    }

    #[test]
    fn test_start_creates_running_record_and_tasks() {
        let f = fixture();
        seed_drivers(&f.store, 3);
        let template = f.store.insert_template("standard", "{}").unwrap();
        f.store.activate_template(template).unwrap();

        let session_id = f
            .supervisor
            .start(&GenerationRequest::bulk(DriverSelection::All).owned_by("admin"))
            .unwrap();

        let record = f
            .db
            .with_conn(|conn| generation_repo::find_with_log(conn, &session_id, 10))
            .unwrap()
            .unwrap();
        assert_eq!(record.state, GenerationState::Running);
        assert_eq!(record.total, 3);
        assert_eq!(record.processed, 0);
        assert_eq!(record.owner.as_deref(), Some("admin"));
        assert_eq!(record.template_id, Some(template));
        assert_eq!(record.log.len(), 1);
        assert_eq!(record.log[0].data["total"], 3);
        assert_eq!(record.log[0].data["template_name"], "standard");

        assert_eq!(f.queue.counts_for(&session_id).unwrap().pending, 3);
        let task = f.queue.claim_next().unwrap().unwrap();
        assert_eq!(task.kind(), TaskKind::RenderCard);
    }

    #[test]
    fn test_no_active_template_is_no_configuration() {
        let f = fixture();
        seed_drivers(&f.store, 2);
        f.store.insert_template("draft", "{}").unwrap();

        let result = f.supervisor.start(&GenerationRequest::bulk(DriverSelection::All));
        assert!(matches!(result, Err(GenerationError::NoConfiguration)));
        assert_eq!(count_generations(&f.db), 0);
    }

    #[test]
    fn test_inactive_explicit_template_is_no_configuration() {
        let f = fixture();
        seed_drivers(&f.store, 1);
        let active = f.store.insert_template("current", "{}").unwrap();
        let old = f.store.insert_template("old", "{}").unwrap();
        f.store.activate_template(active).unwrap();

        let request = GenerationRequest::bulk(DriverSelection::All).with_template(old);
        let result = f.supervisor.start(&request);
        assert!(matches!(result, Err(GenerationError::NoConfiguration)));
    }

    #[test]
    fn test_empty_selection_is_no_work() {
        let f = fixture();
        let template = f.store.insert_template("standard", "{}").unwrap();
        f.store.activate_template(template).unwrap();

        let all = f.supervisor.start(&GenerationRequest::bulk(DriverSelection::All));
        assert!(matches!(all, Err(GenerationError::NoWork)));

        let unknown = f
            .supervisor
            .start(&GenerationRequest::bulk(DriverSelection::Ids(vec![41, 42])));
        assert!(matches!(unknown, Err(GenerationError::NoWork)));
        assert_eq!(count_generations(&f.db), 0);
    }

    #[test]
    fn test_duplicate_ids_are_not_unknown() {
        let f = fixture();
        let ids = seed_drivers(&f.store, 2);
        let template = f.store.insert_template("standard", "{}").unwrap();
        f.store.activate_template(template).unwrap();

        let session_id = f
            .supervisor
            .start(&GenerationRequest::bulk(DriverSelection::Ids(vec![
                ids[0], ids[0], 77, ids[1], 77,
            ])))
            .unwrap();

        let record = f
            .db
            .with_conn(|conn| generation_repo::find_with_log(conn, &session_id, 10))
            .unwrap()
            .unwrap();
        assert_eq!(record.total, 2);
        assert_eq!(record.log[0].data["unknown_driver_ids"], json!([77]));
        assert_eq!(f.queue.counts_for(&session_id).unwrap().pending, 2);
    }

    #[test]
    fn test_single_and_template_change_kinds() {
        let f = fixture();
        let ids = seed_drivers(&f.store, 2);
        let template = f.store.insert_template("2026", "{}").unwrap();
        f.store.activate_template(template).unwrap();

        let single = f.supervisor.start(&GenerationRequest::single(ids[1])).unwrap();
        let change = f
            .supervisor
            .start(&GenerationRequest::template_change(template))
            .unwrap();

        let load = |id: &str| {
            f.db.with_conn(|conn| generation_repo::find(conn, id))
                .unwrap()
                .unwrap()
        };
        assert_eq!(load(&single).kind, GenerationKind::Single);
        assert_eq!(load(&single).total, 1);
        assert_eq!(load(&change).kind, GenerationKind::TemplateChange);
        assert_eq!(load(&change).total, 2);
    }
}
