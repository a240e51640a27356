mod contacts;
mod messages;

use directories::ProjectDirs;
use log::{debug, warn};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bumping this drops and recreates both tables on the next open.
pub const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("could not serialize contact: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no data directory available")]
    NoDataDir,
    #[error("could not create data directory: {0}")]
    Io(#[from] std::io::Error),
}

pub fn default_db_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("com", "example", "ContactRelay")?;
    Some(proj.data_dir().join("messaging.sqlite"))
}

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Local store holding the `contacts` and `messages` tables.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        ensure_dir(path)?;
        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Journal mode {}", mode);
        debug!("Opened database at {}", path.display());
        Self::init(conn)
    }

    pub fn open_default() -> Result<Self, StoreError> {
        let path = default_db_path().ok_or(StoreError::NoDataDir)?;
        Self::open(&path)
    }

    pub fn open_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version != 0 && version != SCHEMA_VERSION {
            warn!("Upgrading database from version {} to {}, existing rows are dropped", version, SCHEMA_VERSION);
            conn.execute_batch(
                r#"
                DROP TABLE IF EXISTS contacts;
                DROP TABLE IF EXISTS messages;
                "#,
            )?;
        }
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                json_data TEXT NOT NULL,
                search_index TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                recipient TEXT NOT NULL,
                recipient_type TEXT NOT NULL,
                sent_date INTEGER NOT NULL,
                status TEXT NOT NULL,
                send_count INTEGER DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS messages_sent_date ON messages (sent_date);
            "#,
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(Self { conn })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopening_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.sqlite");
        {
            let db = Database::open(&path).unwrap();
            let mut c = crate::models::Contact::new();
            c.set_field("Name", "Ann");
            db.save_contact(&mut c).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.all_contacts().unwrap().len(), 1);
    }

    #[test]
    fn schema_version_mismatch_recreates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        {
            let db = Database::open(&path).unwrap();
            let mut c = crate::models::Contact::new();
            c.set_field("Name", "Ann");
            db.save_contact(&mut c).unwrap();
            db.conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert!(db.all_contacts().unwrap().is_empty());
        let version: i32 = db.conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
