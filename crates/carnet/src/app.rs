//! Wiring of the pipeline components over one database and data directory.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::config::CarnetConfig;
use crate::db::{entity_repo, Database};
use crate::error::CarnetError;
use crate::generation::{
    prune_archives, CardWorker, CompletionGate, Finalizer, GenerationError, GenerationRequest,
    GenerationStatus, PruneReport, StatusService, Supervisor, Watchdog,
};
use crate::queue::{QueueError, TaskQueue};
use crate::registry::{EntityStore, SqliteEntityStore};
use crate::render::{CardRenderer, PdfCardRenderer};
use crate::storage::ArtifactStore;
use crate::worker::{PoolSettings, Reaper, TaskExecutor, TaskReport, WorkerPool};

/// Minimum period between reaper passes.
const MIN_REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a maintenance pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Expired tasks put back in the queue.
    pub requeued: u64,
    /// Expired tasks that had no attempts left.
    pub abandoned: u64,
    /// Batches failed by the watchdog.
    pub failed_batches: Vec<String>,
    /// Finished tasks deleted from the queue.
    pub purged: u64,
}

pub struct Carnet {
    config: CarnetConfig,
    db: Database,
    store: ArtifactStore,
    queue: TaskQueue,
    supervisor: Supervisor,
    executor: Arc<TaskExecutor>,
    status: StatusService,
}

impl Carnet {
    /// Opens the configured database and builds the production components.
    pub fn from_config(config: &CarnetConfig) -> Result<Self, CarnetError> {
        let db = Database::open(&config.database_path)?;
        let entities: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(db.clone()));
        let renderer: Arc<dyn CardRenderer> = Arc::new(PdfCardRenderer::new());
        Ok(Self::with_components(config, db, entities, renderer))
    }

    pub fn with_components(
        config: &CarnetConfig,
        db: Database,
        entities: Arc<dyn EntityStore>,
        renderer: Arc<dyn CardRenderer>,
    ) -> Self {
        let store = ArtifactStore::new(
            config.work_directory(),
            config.cards_directory(),
            config.archive_directory(),
        );
        let queue = TaskQueue::new(db.clone(), config.queue.clone(), config.max_attempts);

        let supervisor = Supervisor::new(
            db.clone(),
            queue.clone(),
            Arc::clone(&entities),
            config.log_capacity,
        );
        let gate = CompletionGate::new(db.clone(), queue.clone(), config.log_capacity);
        let worker = CardWorker::new(
            db.clone(),
            entities,
            renderer,
            store.clone(),
            gate,
            config.log_capacity,
        );
        let finalizer = Finalizer::new(
            db.clone(),
            store.clone(),
            config.log_capacity,
            config.retention_keep,
        );
        let executor = Arc::new(TaskExecutor::new(queue.clone(), worker, finalizer));
        let status = StatusService::new(db.clone(), config.log_capacity);

        Self {
            config: config.clone(),
            db,
            store,
            queue,
            supervisor,
            executor,
            status,
        }
    }

    pub fn config(&self) -> &CarnetConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Starts a batch and returns its session id.
    pub fn start(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.supervisor.start(request)
    }

    pub fn status(&self, session_id: &str) -> Result<GenerationStatus, GenerationError> {
        self.status.status(session_id)
    }

    pub fn download(&self, session_id: &str) -> Result<Vec<u8>, GenerationError> {
        self.status.download(session_id)
    }

    pub fn history(
        &self,
        owner: Option<&str>,
        limit: u64,
    ) -> Result<Vec<GenerationStatus>, GenerationError> {
        self.status.history(owner, limit)
    }

    /// Makes `template_id` the only active card template.
    pub fn activate_template(&self, template_id: i64) -> Result<(), GenerationError> {
        let activated = self
            .db
            .with_immediate_tx(|conn| entity_repo::activate_template(conn, template_id))?;
        if !activated {
            return Err(GenerationError::NotFound(format!("template {}", template_id)));
        }
        log::info!("Card template {} is now active", template_id);
        Ok(())
    }

    /// Claims and runs one task on the calling thread.
    pub fn run_next(&self) -> Result<Option<TaskReport>, QueueError> {
        self.executor.run_next()
    }

    /// Drains the queue on the calling thread.
    pub fn run_until_idle(&self) -> Result<Vec<TaskReport>, QueueError> {
        self.executor.run_until_idle()
    }

    /// Starts `worker_count` consumers plus the reaper.
    pub fn start_pool(&self) -> WorkerPool {
        let settings = PoolSettings {
            worker_count: self.config.worker_count,
            poll_interval: self.config.poll_interval(),
            reaper_interval: (self.config.unit_timeout() / 4).max(MIN_REAPER_INTERVAL),
        };
        WorkerPool::start(Arc::clone(&self.executor), self.reaper(), settings)
    }

    /// Applies the retention policy to the archive directory.
    pub fn prune(&self) -> PruneReport {
        prune_archives(self.store.archive_root(), self.config.retention_keep)
    }

    /// Re-queues expired tasks, fails stalled batches and purges old
    /// finished tasks.
    pub fn sweep(&self) -> Result<SweepReport, CarnetError> {
        let (requeued, abandoned) = self.queue.requeue_expired(self.config.unit_timeout())?;
        let failed_batches = self.watchdog().sweep(Utc::now())?;
        let purged = self.queue.purge_finished(self.config.task_retention())?;
        Ok(SweepReport {
            requeued,
            abandoned,
            failed_batches,
            purged,
        })
    }

    fn watchdog(&self) -> Watchdog {
        Watchdog::new(
            self.db.clone(),
            self.config.stall_timeout(),
            self.config.log_capacity,
        )
    }

    fn reaper(&self) -> Reaper {
        Reaper::new(
            self.queue.clone(),
            self.watchdog(),
            self.config.unit_timeout(),
            self.config.task_retention(),
        )
    }
}
