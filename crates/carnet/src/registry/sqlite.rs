use std::path::Path;

use chrono::Utc;

use super::{CardTemplate, Driver, EntityStore, NewDriver};
use crate::db::{entity_repo, Database, DatabaseError};

/// `EntityStore` over the shared SQLite database.
#[derive(Clone)]
pub struct SqliteEntityStore {
    db: Database,
}

impl SqliteEntityStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert_driver(&self, driver: &NewDriver) -> Result<i64, DatabaseError> {
        self.db
            .with_conn(|conn| entity_repo::insert_driver(conn, driver, Utc::now()))
    }

    pub fn delete_driver(&self, id: i64) -> Result<bool, DatabaseError> {
        self.db.with_conn(|conn| entity_repo::delete_driver(conn, id))
    }

    pub fn set_driver_active(&self, id: i64, active: bool) -> Result<bool, DatabaseError> {
        self.db
            .with_conn(|conn| entity_repo::set_driver_active(conn, id, active))
    }

    /// Registers an inactive template.
    pub fn insert_template(&self, name: &str, layout: &str) -> Result<i64, DatabaseError> {
        self.db
            .with_conn(|conn| entity_repo::insert_template(conn, name, layout, Utc::now()))
    }

    /// Makes `id` the single active template. Returns false if it does not exist.
    pub fn activate_template(&self, id: i64) -> Result<bool, DatabaseError> {
        let activated = self
            .db
            .with_immediate_tx(|conn| entity_repo::activate_template(conn, id))?;
        if activated {
            log::info!("Card template {} is now active", id);
        }
        Ok(activated)
    }
}

impl EntityStore for SqliteEntityStore {
    fn active_template(&self) -> Result<Option<CardTemplate>, DatabaseError> {
        self.db.with_conn(entity_repo::active_template)
    }

    fn template(&self, id: i64) -> Result<Option<CardTemplate>, DatabaseError> {
        self.db.with_conn(|conn| entity_repo::find_template(conn, id))
    }

    fn driver(&self, id: i64) -> Result<Option<Driver>, DatabaseError> {
        self.db.with_conn(|conn| entity_repo::find_driver(conn, id))
    }

    fn active_driver_ids(&self) -> Result<Vec<i64>, DatabaseError> {
        self.db.with_conn(entity_repo::active_driver_ids)
    }

    fn existing_driver_ids(&self, ids: &[i64]) -> Result<Vec<i64>, DatabaseError> {
        self.db
            .with_conn(|conn| entity_repo::existing_driver_ids(conn, ids))
    }

    fn set_latest_card(&self, driver_id: i64, path: &Path) -> Result<bool, DatabaseError> {
        self.db
            .with_conn(|conn| entity_repo::set_latest_card(conn, driver_id, path, Utc::now()))
    }
}
