//! Builders for test drivers and a renderer with scripted failures.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use carnet::db::DatabaseError;
use carnet::error::RenderError;
use carnet::registry::{CardTemplate, Driver, EntityStore, NewDriver, SqliteEntityStore};
use carnet::render::{CardRenderer, PdfCardRenderer};

pub const DEFAULT_LAYOUT: &str =
    r#"{ "title": "Carnet de Conductor", "fields": ["full_name", "document_number", "vehicle_plate"] }"#;

/// Builder for `NewDriver` records with predictable document numbers.
pub struct DriverBuilder {
    driver: NewDriver,
}

impl DriverBuilder {
    pub fn numbered(n: usize) -> Self {
        let mut driver = NewDriver::new(format!("DOC-{:04}", n), format!("Conductor {}", n));
        driver.vehicle_plate = Some(format!("ABC-{:03}", n));
        driver.cooperative_code = Some("COOP-01".to_string());
        Self { driver }
    }

    pub fn document(mut self, document_number: impl Into<String>) -> Self {
        self.driver.document_number = document_number.into();
        self
    }

    pub fn photo(mut self, path: impl Into<PathBuf>) -> Self {
        self.driver.photo_path = Some(path.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.driver.active = false;
        self
    }

    pub fn build(self) -> NewDriver {
        self.driver
    }
}

/// Renders with `PdfCardRenderer` except for the listed document numbers,
/// which fail as if their photo were missing.
pub struct SelectiveRenderer {
    inner: PdfCardRenderer,
    failing: HashSet<String>,
}

impl SelectiveRenderer {
    pub fn failing<I, S>(documents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: PdfCardRenderer::new(),
            failing: documents.into_iter().map(Into::into).collect(),
        }
    }
}

impl CardRenderer for SelectiveRenderer {
    fn render(
        &self,
        driver: &Driver,
        template: &CardTemplate,
        destination: &Path,
    ) -> Result<PathBuf, RenderError> {
        if self.failing.contains(&driver.document_number) {
            return Err(RenderError::MissingAsset {
                driver_id: driver.id,
                asset: "photo".to_string(),
            });
        }
        self.inner.render(driver, template, destination)
    }
}

/// Entity store whose first `failures` driver lookups fail as if the
/// database were unavailable.
pub struct FlakyEntities {
    inner: SqliteEntityStore,
    remaining: AtomicUsize,
}

impl FlakyEntities {
    pub fn failing_first(inner: SqliteEntityStore, failures: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(failures),
        }
    }
}

impl EntityStore for FlakyEntities {
    fn active_template(&self) -> Result<Option<CardTemplate>, DatabaseError> {
        self.inner.active_template()
    }

    fn template(&self, id: i64) -> Result<Option<CardTemplate>, DatabaseError> {
        self.inner.template(id)
    }

    fn driver(&self, id: i64) -> Result<Option<Driver>, DatabaseError> {
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DatabaseError::LockPoisoned);
        }
        self.inner.driver(id)
    }

    fn active_driver_ids(&self) -> Result<Vec<i64>, DatabaseError> {
        self.inner.active_driver_ids()
    }

    fn existing_driver_ids(&self, ids: &[i64]) -> Result<Vec<i64>, DatabaseError> {
        self.inner.existing_driver_ids(ids)
    }

    fn set_latest_card(&self, driver_id: i64, path: &Path) -> Result<bool, DatabaseError> {
        self.inner.set_latest_card(driver_id, path)
    }
}
