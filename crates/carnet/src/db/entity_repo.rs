//! Entity repository: `drivers` and `card_templates`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_timestamp, DatabaseError};
use crate::registry::{CardTemplate, Driver, NewDriver};

fn driver_from_row(row: &Row<'_>) -> Result<Driver, rusqlite::Error> {
    Ok(Driver {
        id: row.get("id")?,
        document_number: row.get("document_number")?,
        full_name: row.get("full_name")?,
        vehicle_plate: row.get("vehicle_plate")?,
        cooperative_code: row.get("cooperative_code")?,
        photo_path: row.get::<_, Option<String>>("photo_path")?.map(PathBuf::from),
        active: row.get("active")?,
        latest_card_path: row
            .get::<_, Option<String>>("latest_card_path")?
            .map(PathBuf::from),
    })
}

fn template_from_row(row: &Row<'_>) -> Result<CardTemplate, rusqlite::Error> {
    Ok(CardTemplate {
        id: row.get("id")?,
        name: row.get("name")?,
        active: row.get("active")?,
        layout: row.get("layout")?,
    })
}

pub fn insert_driver(
    conn: &Connection,
    driver: &NewDriver,
    now: DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO drivers (document_number, full_name, vehicle_plate, cooperative_code,
         photo_path, active, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            driver.document_number,
            driver.full_name,
            driver.vehicle_plate,
            driver.cooperative_code,
            driver
                .photo_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            driver.active,
            format_timestamp(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_driver(conn: &Connection, id: i64) -> Result<Option<Driver>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM drivers WHERE id = ?1",
            params![id],
            driver_from_row,
        )
        .optional()?)
}

pub fn delete_driver(conn: &Connection, id: i64) -> Result<bool, DatabaseError> {
    Ok(conn.execute("DELETE FROM drivers WHERE id = ?1", params![id])? == 1)
}

pub fn set_driver_active(conn: &Connection, id: i64, active: bool) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE drivers SET active = ?2 WHERE id = ?1",
        params![id, active],
    )?;
    Ok(changed == 1)
}

pub fn active_driver_ids(conn: &Connection) -> Result<Vec<i64>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT id FROM drivers WHERE active = 1 ORDER BY id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// The subset of `ids` that exist, in ascending order without duplicates.
pub fn existing_driver_ids(conn: &Connection, ids: &[i64]) -> Result<Vec<i64>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT 1 FROM drivers WHERE id = ?1")?;
    let mut found = Vec::with_capacity(ids.len());
    for &id in ids {
        if stmt.exists(params![id])? {
            found.push(id);
        }
    }
    found.sort_unstable();
    found.dedup();
    Ok(found)
}

pub fn set_latest_card(
    conn: &Connection,
    driver_id: i64,
    path: &Path,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE drivers SET latest_card_path = ?2, updated_at = ?3 WHERE id = ?1",
        params![driver_id, path.to_string_lossy(), format_timestamp(now)],
    )?;
    Ok(changed == 1)
}

pub fn insert_template(
    conn: &Connection,
    name: &str,
    layout: &str,
    now: DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO card_templates (name, layout, active, created_at) VALUES (?1, ?2, 0, ?3)",
        params![name, layout, format_timestamp(now)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Makes `id` the only active template. Caller provides the transaction.
pub fn activate_template(conn: &Connection, id: i64) -> Result<bool, DatabaseError> {
    let exists = conn
        .prepare("SELECT 1 FROM card_templates WHERE id = ?1")?
        .exists(params![id])?;
    if !exists {
        return Ok(false);
    }
    conn.execute("UPDATE card_templates SET active = (id = ?1)", params![id])?;
    Ok(true)
}

pub fn find_template(conn: &Connection, id: i64) -> Result<Option<CardTemplate>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT id, name, active, layout FROM card_templates WHERE id = ?1",
            params![id],
            template_from_row,
        )
        .optional()?)
}

pub fn active_template(conn: &Connection) -> Result<Option<CardTemplate>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT id, name, active, layout FROM card_templates
             WHERE active = 1 ORDER BY id DESC LIMIT 1",
            [],
            template_from_row,
        )
        .optional()?)
}
