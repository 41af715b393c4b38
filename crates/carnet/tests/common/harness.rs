//! Test harness for isolated pipeline runs.
//!
//! Each `TestHarness` owns a temporary data directory holding the SQLite
//! file and the `work/`, `cards/` and `archives/` trees, so independent
//! `Carnet` instances opened on it share state the way separate worker
//! processes would.

#![allow(dead_code)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use carnet::config::CarnetConfig;
use carnet::db::{generation_repo, Database};
use carnet::generation::GenerationRecord;
use carnet::registry::{EntityStore, SqliteEntityStore};
use carnet::render::{CardRenderer, PdfCardRenderer};
use carnet::Carnet;

use super::builders::{DriverBuilder, DEFAULT_LAYOUT};

pub struct TestHarness {
    temp_dir: TempDir,
    pub config: CarnetConfig,
    pub db: Database,
    pub entities: SqliteEntityStore,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = CarnetConfig::rooted_at(temp_dir.path().join("data"));
        config.worker_count = 2;
        config.poll_interval_ms = 10;
        config.log_capacity = 50;

        let db = Database::open(&config.database_path).expect("Failed to open database");
        let entities = SqliteEntityStore::new(db.clone());

        Self {
            temp_dir,
            config,
            db,
            entities,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Pipeline over the harness database with the real PDF renderer.
    pub fn carnet(&self) -> Carnet {
        self.carnet_with_renderer(Arc::new(PdfCardRenderer::new()))
    }

    pub fn carnet_with_renderer(&self, renderer: Arc<dyn CardRenderer>) -> Carnet {
        let entities: Arc<dyn EntityStore> = Arc::new(self.entities.clone());
        Carnet::with_components(&self.config, self.db.clone(), entities, renderer)
    }

    pub fn carnet_with_entities(&self, entities: Arc<dyn EntityStore>) -> Carnet {
        Carnet::with_components(
            &self.config,
            self.db.clone(),
            entities,
            Arc::new(PdfCardRenderer::new()),
        )
    }

    /// Pipeline over its own connection to the same database file.
    pub fn independent_carnet(&self) -> Carnet {
        let db = Database::open(&self.config.database_path).expect("Failed to open database");
        let entities: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(db.clone()));
        Carnet::with_components(&self.config, db, entities, Arc::new(PdfCardRenderer::new()))
    }

    /// Inserts and activates a template with the default layout.
    pub fn seed_template(&self, name: &str) -> i64 {
        self.seed_template_with_layout(name, DEFAULT_LAYOUT)
    }

    pub fn seed_template_with_layout(&self, name: &str, layout: &str) -> i64 {
        let id = self
            .entities
            .insert_template(name, layout)
            .expect("Failed to insert template");
        assert!(self.entities.activate_template(id).unwrap());
        id
    }

    /// Inserts `count` active drivers numbered from 1.
    pub fn seed_drivers(&self, count: usize) -> Vec<i64> {
        (1..=count)
            .map(|n| {
                self.entities
                    .insert_driver(&DriverBuilder::numbered(n).build())
                    .expect("Failed to insert driver")
            })
            .collect()
    }

    pub fn record(&self, session_id: &str) -> GenerationRecord {
        self.db
            .with_conn(|conn| generation_repo::find(conn, session_id))
            .expect("Failed to read record")
            .expect("Record does not exist")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.config.archive_directory()
    }

    /// File names in the archive directory, sorted.
    pub fn list_archives(&self) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(self.archive_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// Writes a placeholder archive into the archive directory.
    pub fn write_archive(&self, name: &str) -> PathBuf {
        std::fs::create_dir_all(self.archive_dir()).expect("Failed to create archive dir");
        let path = self.archive_dir().join(name);
        std::fs::write(&path, b"PK").expect("Failed to write archive");
        path
    }

    /// Entry names and sizes of a zip archive.
    pub fn archive_entries(&self, path: &Path) -> Vec<(String, usize)> {
        let file = std::fs::File::open(path).expect("Failed to open archive");
        let mut archive = zip::ZipArchive::new(file).expect("Not a zip archive");
        let mut entries = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).expect("Failed to read entry");
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).expect("Failed to read entry");
            entries.push((entry.name().to_string(), bytes.len()));
        }
        entries.sort();
        entries
    }

    /// Number of finalize tasks ever enqueued for a batch.
    pub fn finalize_task_count(&self, session_id: &str) -> i64 {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE kind = 'finalize' AND session_id = ?1",
                    [session_id],
                    |row| row.get(0),
                )
                .map_err(carnet::db::DatabaseError::from)
            })
            .expect("Failed to count tasks")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_opens_database() {
        let harness = TestHarness::new();
        assert!(harness.config.database_path.exists());
        assert!(harness.list_archives().is_empty());
    }
}
