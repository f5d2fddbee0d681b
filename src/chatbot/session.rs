//! Per-sender conversation state and the store that serializes access to it.
//!
//! A caller must hold a [`SessionLease`] to read-modify-write a session. A
//! second event for the same sender waits for the lease up to the configured
//! lock wait and is then rejected with [`SessionError::Busy`].

use crate::chatbot::database::Database;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    AwaitingCrop,
    AwaitingRegion,
    /// Only ever observed within a turn; sessions are saved back as `Idle`.
    Complete,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::AwaitingCrop => "AWAITING_CROP",
            Self::AwaitingRegion => "AWAITING_REGION",
            Self::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Varieties,
    Regions,
    SowingTime,
}

/// A required parameter of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Crop,
    Region,
}

impl Slot {
    pub fn awaiting_state(self) -> SessionState {
        match self {
            Slot::Crop => SessionState::AwaitingCrop,
            Slot::Region => SessionState::AwaitingRegion,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Crop => f.write_str("crop"),
            Slot::Region => f.write_str("region"),
        }
    }
}

/// A query being assembled across turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuery {
    pub kind: QueryKind,
    pub crop: Option<String>,
    pub region: Option<String>,
}

impl PendingQuery {
    pub fn new(kind: QueryKind) -> Self {
        Self { kind, crop: None, region: None }
    }

    pub fn with_crop(mut self, crop: impl Into<String>) -> Self {
        self.crop = Some(crop.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// The first required slot still empty, crop before region.
    pub fn missing(&self) -> Option<Slot> {
        if self.crop.is_none() {
            return Some(Slot::Crop);
        }
        if self.kind == QueryKind::SowingTime && self.region.is_none() {
            return Some(Slot::Region);
        }
        None
    }

    /// Fill empty slots from an earlier partial query.
    pub fn merge_from(&mut self, earlier: &PendingQuery) {
        if self.crop.is_none() {
            self.crop = earlier.crop.clone();
        }
        if self.kind == QueryKind::SowingTime && self.region.is_none() {
            self.region = earlier.region.clone();
        }
    }
}

/// One sender's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub sender_id: String,
    pub state: SessionState,
    pub pending_query: Option<PendingQuery>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Inbound events applied to this session.
    pub turns: u64,
}

impl Session {
    pub fn new(sender_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            state: SessionState::Idle,
            pending_query: None,
            created_at: now,
            last_activity: now,
            turns: 0,
        }
    }

    /// Back to `Idle` with nothing pending.
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.pending_query = None;
    }

    /// Saturates at the end of representable time for very long TTLs.
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.last_activity.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// Another event for this sender held the session for the whole wait.
    Busy { sender_id: String, waited: Duration },
    /// The backing database failed.
    Storage(rusqlite::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy { sender_id, waited } => {
                write!(f, "session for {} still busy after {:?}", sender_id, waited)
            }
            Self::Storage(e) => write!(f, "session storage error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Busy { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e)
    }
}

/// Durable session store with per-sender mutual exclusion.
pub struct SessionStore {
    db: Database,
    ttl: Duration,
    lock_wait: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(db: Database, ttl: Duration, lock_wait: Duration) -> Self {
        Self {
            db,
            ttl,
            lock_wait,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take exclusive access to one sender's session.
    pub async fn acquire(&self, sender_id: &str) -> Result<SessionLease<'_>, SessionError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(sender_id.to_string()).or_default().clone()
        };

        match tokio::time::timeout(self.lock_wait, lock.lock_owned()).await {
            Ok(guard) => Ok(SessionLease {
                store: self,
                sender_id: sender_id.to_string(),
                _guard: guard,
            }),
            Err(_) => {
                warn!("Session for {} busy for {:?}, rejecting event", sender_id, self.lock_wait);
                Err(SessionError::Busy {
                    sender_id: sender_id.to_string(),
                    waited: self.lock_wait,
                })
            }
        }
    }

    /// Read a session without taking the lease. For inspection only.
    pub fn peek(&self, sender_id: &str, now: DateTime<Utc>) -> Result<Option<Session>, SessionError> {
        Ok(self.db.get(sender_id, now)?)
    }

    /// Remove every session idle for longer than the TTL, and forget lock
    /// entries nobody holds.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize, SessionError> {
        let removed = self.db.expire(now)?;
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        if removed > 0 {
            info!("Expired {} stale session(s)", removed);
        }
        Ok(removed)
    }

    pub fn session_count(&self) -> Result<usize, SessionError> {
        Ok(self.db.count()?)
    }
}

/// Exclusive access to one sender's session, released on drop.
pub struct SessionLease<'a> {
    store: &'a SessionStore,
    sender_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease<'_> {
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Load the live session, or start a fresh one if there is none (or the
    /// old one outlived its TTL).
    pub fn get_or_create(&self, now: DateTime<Utc>) -> Result<Session, SessionError> {
        match self.store.db.get(&self.sender_id, now)? {
            Some(session) => Ok(session),
            None => {
                debug!("New session for {}", self.sender_id);
                Ok(Session::new(&self.sender_id, now))
            }
        }
    }

    /// Replace the stored session with `session`.
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        debug_assert_eq!(session.sender_id, self.sender_id, "lease used for a different sender");
        self.store.db.set(session, session.expires_at(self.store.ttl))?;
        Ok(())
    }

    pub fn delete(&self) -> Result<bool, SessionError> {
        Ok(self.store.db.delete(&self.sender_id)?)
    }
}
