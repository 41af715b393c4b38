//! The bulk card generation pipeline.
//!
//! A batch moves through four roles, all coordinating only through the
//! `generations` row and the task queue:
//!
//! - [`Supervisor`] validates a request, creates the record and fans out
//!   one `render_card` task per driver.
//! - [`CardWorker`] renders, stores and records one card, then consults
//!   the [`CompletionGate`].
//! - [`CompletionGate`] admits exactly one `finalize` task per batch.
//! - [`Finalizer`] zips the produced cards, closes the record and prunes
//!   old archives.

pub mod finalizer;
pub mod gate;
pub mod record;
pub mod retention;
pub mod status;
pub mod supervisor;
pub mod watchdog;
pub mod worker;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::{RenderError, StorageError};
use crate::queue::QueueError;

pub use finalizer::{FinalizeOutcome, Finalizer};
pub use gate::{CompletionGate, GateDecision};
pub use record::{
    GenerationKind, GenerationRecord, GenerationState, LogEntry, NewGeneration, Severity,
    UnitOutcome,
};
pub use retention::{prune_archives, select_for_removal, ArchiveEntry, PruneReport};
pub use status::{GenerationStatus, StatusService};
pub use supervisor::{DriverSelection, GenerationRequest, Supervisor};
pub use watchdog::Watchdog;
pub use worker::{CardWorker, UnitReport};

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("No active card template is configured")]
    NoConfiguration,

    #[error("No drivers matched the request")]
    NoWork,

    #[error("{entity} {id} no longer exists")]
    MissingEntity { entity: &'static str, id: i64 },

    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Batch {session_id} produced no cards")]
    NoOutput { session_id: String },

    #[error("Batch {session_id} recorded {expected} card(s) but none were found on disk")]
    EmptyArchive { session_id: String, expected: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl GenerationError {
    /// Infrastructure faults abort the task so the queue retries it; every
    /// other error is a recorded outcome.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            GenerationError::Database(_) | GenerationError::Queue(_)
        )
    }
}
