//! Recent Rooms Database
//!
//! SQLite-Datenbank für zuletzt benutzte Räume.
//! Ein Eintrag pro (Raum, Server, Port); jeder Anruf zählt `use_count` hoch.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Could not determine app data directory")]
    NoDataDirectory,

    #[error("Recent room not found: {0}")]
    RoomNotFound(i64),
}

// ============================================================================
// RECENT ROOM STRUCT
// ============================================================================

/// Ein zuletzt benutzter Raum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentRoom {
    pub id: i64,
    pub room: String,
    pub host: String,
    pub port: u16,
    pub relay: bool,
    pub use_count: i64,
    pub last_used_at: String,
}

/// Neuer Eintrag ohne ID (für INSERT)
#[derive(Debug, Clone)]
pub struct NewRecentRoom {
    pub room: String,
    pub host: String,
    pub port: u16,
    pub relay: bool,
}

const SELECT_COLUMNS: &str = "SELECT id, room, host, port, relay, use_count, last_used_at FROM recent_rooms";

impl RecentRoom {
    fn from_row(row: &Row<'_>) -> SqliteResult<Self> {
        Ok(RecentRoom {
            id: row.get(0)?,
            room: row.get(1)?,
            host: row.get(2)?,
            port: row.get(3)?,
            relay: row.get(4)?,
            use_count: row.get(5)?,
            last_used_at: row.get(6)?,
        })
    }
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Datenbank für Raum-Historie (Thread-safe durch Mutex)
pub struct RecentRoomsDatabase {
    conn: Mutex<Connection>,
}

impl RecentRoomsDatabase {
    /// Öffnet oder erstellt die Datenbank im Daten-Verzeichnis der App
    pub fn open() -> Result<Self, DatabaseError> {
        let db_path = Self::database_path()?;
        Self::open_at(&db_path)
    }

    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open_at(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening database at {:?}", path);

        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// In-Memory Datenbank für Tests
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    fn database_path() -> Result<PathBuf, DatabaseError> {
        let proj_dirs = directories::ProjectDirs::from("com", "roomcall", "roomcall")
            .ok_or(DatabaseError::NoDataDirectory)?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("history.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS recent_rooms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                relay INTEGER NOT NULL DEFAULT 0,
                use_count INTEGER NOT NULL DEFAULT 1,
                last_used_at TEXT NOT NULL,
                UNIQUE(room, host, port)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_recent_rooms_last_used ON recent_rooms(last_used_at)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Vermerkt die Nutzung eines Raums
    ///
    /// Existiert der Eintrag schon, werden `use_count`, `relay` und
    /// `last_used_at` aktualisiert.
    pub fn record(&self, room: NewRecentRoom) -> Result<RecentRoom, DatabaseError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO recent_rooms (room, host, port, relay, use_count, last_used_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5)
            ON CONFLICT(room, host, port) DO UPDATE SET
                relay = excluded.relay,
                use_count = use_count + 1,
                last_used_at = excluded.last_used_at
            "#,
            params![room.room, room.host, room.port, room.relay, now],
        )?;

        let recorded = conn.query_row(
            &format!("{} WHERE room = ?1 AND host = ?2 AND port = ?3", SELECT_COLUMNS),
            params![room.room, room.host, room.port],
            RecentRoom::from_row,
        )?;

        tracing::debug!(
            "Recorded room use #{} for {}:{}",
            recorded.use_count,
            recorded.host,
            recorded.port
        );
        Ok(recorded)
    }

    /// Die zuletzt benutzten Räume, neueste zuerst
    pub fn recent(&self, limit: usize) -> Result<Vec<RecentRoom>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY last_used_at DESC, id DESC LIMIT ?1",
            SELECT_COLUMNS
        ))?;

        let rooms = stmt
            .query_map(params![limit as i64], RecentRoom::from_row)?
            .collect::<SqliteResult<Vec<RecentRoom>>>()?;

        Ok(rooms)
    }

    /// Löscht einen Eintrag
    pub fn delete(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM recent_rooms WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DatabaseError::RoomNotFound(id));
        }
        Ok(())
    }

    /// Löscht die komplette Historie und gibt die Anzahl der Einträge zurück
    pub fn clear(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM recent_rooms", [])?;
        Ok(deleted)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn garden(relay: bool) -> NewRecentRoom {
        NewRecentRoom {
            room: "garden".to_string(),
            host: "signal.example.org".to_string(),
            port: 4000,
            relay,
        }
    }

    #[test]
    fn test_record_and_list() {
        let db = RecentRoomsDatabase::open_in_memory().unwrap();

        let room = db.record(garden(false)).unwrap();
        assert_eq!(room.room, "garden");
        assert_eq!(room.port, 4000);
        assert_eq!(room.use_count, 1);
        assert!(!room.relay);

        assert_eq!(db.recent(10).unwrap(), vec![room]);
    }

    #[test]
    fn test_record_again_bumps_use_count() {
        let db = RecentRoomsDatabase::open_in_memory().unwrap();

        let first = db.record(garden(false)).unwrap();
        let second = db.record(garden(true)).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.use_count, 2);
        assert!(second.relay);
        assert!(second.last_used_at >= first.last_used_at);
        assert_eq!(db.recent(10).unwrap().len(), 1);
    }

    #[test]
    fn test_same_room_on_other_server_is_separate() {
        let db = RecentRoomsDatabase::open_in_memory().unwrap();

        db.record(garden(false)).unwrap();
        db.record(NewRecentRoom {
            port: 4001,
            ..garden(false)
        })
        .unwrap();

        assert_eq!(db.recent(10).unwrap().len(), 2);
    }

    #[test]
    fn test_recent_is_newest_first_and_limited() {
        let db = RecentRoomsDatabase::open_in_memory().unwrap();

        for name in ["attic", "cellar", "porch"] {
            db.record(NewRecentRoom {
                room: name.to_string(),
                ..garden(false)
            })
            .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        // Erneute Nutzung schiebt den Raum nach vorne
        db.record(NewRecentRoom {
            room: "attic".to_string(),
            ..garden(false)
        })
        .unwrap();

        let rooms: Vec<String> = db.recent(2).unwrap().into_iter().map(|r| r.room).collect();
        assert_eq!(rooms, vec!["attic", "porch"]);
    }

    #[test]
    fn test_delete_and_clear() {
        let db = RecentRoomsDatabase::open_in_memory().unwrap();

        let room = db.record(garden(false)).unwrap();
        db.record(NewRecentRoom {
            room: "attic".to_string(),
            ..garden(false)
        })
        .unwrap();

        db.delete(room.id).unwrap();
        assert!(matches!(
            db.delete(room.id),
            Err(DatabaseError::RoomNotFound(id)) if id == room.id
        ));
        assert_eq!(db.recent(10).unwrap().len(), 1);

        assert_eq!(db.clear().unwrap(), 1);
        assert!(db.recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_open_at_creates_directories() {
        let dir = std::env::temp_dir()
            .join(format!("roomcall-test-{}", uuid::Uuid::new_v4()))
            .join("nested");
        let path = dir.join("history.db");

        {
            let db = RecentRoomsDatabase::open_at(&path).unwrap();
            db.record(garden(false)).unwrap();
        }

        let reopened = RecentRoomsDatabase::open_at(&path).unwrap();
        assert_eq!(reopened.recent(5).unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(dir.parent().unwrap());
    }
}
