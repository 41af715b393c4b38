//! Read access to the entities cards are generated for, plus the one write
//! the pipeline performs on them (the latest-card pointer).

mod sqlite;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::db::DatabaseError;
pub use sqlite::SqliteEntityStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Driver {
    pub id: i64,
    pub document_number: String,
    pub full_name: String,
    pub vehicle_plate: Option<String>,
    pub cooperative_code: Option<String>,
    pub photo_path: Option<PathBuf>,
    pub active: bool,
    pub latest_card_path: Option<PathBuf>,
}

/// Fields accepted when registering a driver.
#[derive(Debug, Clone)]
pub struct NewDriver {
    pub document_number: String,
    pub full_name: String,
    pub vehicle_plate: Option<String>,
    pub cooperative_code: Option<String>,
    pub photo_path: Option<PathBuf>,
    pub active: bool,
}

impl NewDriver {
    pub fn new(document_number: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            document_number: document_number.into(),
            full_name: full_name.into(),
            vehicle_plate: None,
            cooperative_code: None,
            photo_path: None,
            active: true,
        }
    }
}

/// A card rendering configuration. `layout` is the raw JSON document the
/// renderer interprets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardTemplate {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub layout: String,
}

/// Entity store consumed by the pipeline.
pub trait EntityStore: Send + Sync {
    /// The template new batches use when none is named explicitly.
    fn active_template(&self) -> Result<Option<CardTemplate>, DatabaseError>;

    fn template(&self, id: i64) -> Result<Option<CardTemplate>, DatabaseError>;

    fn driver(&self, id: i64) -> Result<Option<Driver>, DatabaseError>;

    fn active_driver_ids(&self) -> Result<Vec<i64>, DatabaseError>;

    /// Filters `ids` down to drivers that exist.
    fn existing_driver_ids(&self, ids: &[i64]) -> Result<Vec<i64>, DatabaseError>;

    /// Points the driver at its newest card. Returns false if the driver is gone.
    fn set_latest_card(&self, driver_id: i64, path: &Path) -> Result<bool, DatabaseError>;
}
