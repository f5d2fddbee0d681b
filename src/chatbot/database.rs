//! Persistent SQLite storage for conversation sessions.
//!
//! Each row is one sender's full session, serialized as JSON, plus the
//! timestamps needed to expire it without deserializing.

use crate::chatbot::session::Session;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Session database. All writes are single statements, so a row is either
/// the previous session or the new one, never a mix.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create a new in-memory database.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let db = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        db.init_schema()?;
        Ok(db)
    }

    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let db = Self { conn: Mutex::new(Connection::open(path)?) };
        db.init_schema()?;
        info!("Opened session database {:?} ({} sessions)", path, db.count()?);
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves nothing half-written; keep serving.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                sender_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                data TEXT NOT NULL,
                last_activity INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at);
        "#,
        )
    }

    /// Fetch a live session. Rows past their expiry are deleted and reported
    /// as absent, as are rows that no longer deserialize.
    pub fn get(&self, sender_id: &str, now: DateTime<Utc>) -> Result<Option<Session>, rusqlite::Error> {
        let conn = self.conn();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT data, expires_at FROM sessions WHERE sender_id = ?1",
                params![sender_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((data, expires_at)) = row else {
            return Ok(None);
        };

        if expires_at < now.timestamp_millis() {
            debug!("Session for {} expired, dropping", sender_id);
            conn.execute("DELETE FROM sessions WHERE sender_id = ?1", params![sender_id])?;
            return Ok(None);
        }

        match serde_json::from_str::<Session>(&data) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("Discarding unreadable session for {}: {e}", sender_id);
                conn.execute("DELETE FROM sessions WHERE sender_id = ?1", params![sender_id])?;
                Ok(None)
            }
        }
    }

    /// Store a session, replacing whatever was there.
    pub fn set(&self, session: &Session, expires_at: DateTime<Utc>) -> Result<(), rusqlite::Error> {
        let data = serde_json::to_string(session)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn().execute(
            "INSERT OR REPLACE INTO sessions (sender_id, state, data, last_activity, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.sender_id,
                session.state.as_str(),
                data,
                session.last_activity.timestamp_millis(),
                expires_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, sender_id: &str) -> Result<bool, rusqlite::Error> {
        let n = self.conn().execute("DELETE FROM sessions WHERE sender_id = ?1", params![sender_id])?;
        Ok(n > 0)
    }

    /// Delete every session whose expiry lies before `now`.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        self.conn().execute(
            "DELETE FROM sessions WHERE expires_at < ?1",
            params![now.timestamp_millis()],
        )
    }

    /// Total stored sessions, including expired rows not yet swept.
    pub fn count(&self) -> Result<usize, rusqlite::Error> {
        let n: i64 = self.conn().query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
