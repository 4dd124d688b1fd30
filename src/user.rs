//! User record cache and fetch rate limiting.
//!
//! Comment frames only carry a user id; display names and icons come from
//! the profile API. Resolved records are kept in a small file-backed
//! key-value store so restarts do not re-fetch everyone, and profile
//! lookups are throttled with a rolling-window limiter so a burst of
//! unknown commenters cannot hammer the API.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// A cached viewer profile, keyed by user id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    /// Platform user id. Registered ids are decimal; anonymous (184) ids
    /// are opaque hashes.
    pub id: String,
    /// Display name. Empty until resolved.
    pub name: String,
    /// Avatar URL.
    #[serde(default)]
    pub thumbnail_url: String,
    /// When the record was created locally.
    pub create_time: chrono::DateTime<chrono::Utc>,
    /// True for anonymous (184) commenters.
    pub is_anonymous: bool,
}

impl UserRecord {
    /// Placeholder record for an anonymous commenter; no network involved.
    pub fn anonymous(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: String::new(),
            thumbnail_url: String::new(),
            create_time: chrono::Utc::now(),
            is_anonymous: true,
        }
    }
}

/// File-backed user record store.
///
/// The whole map is held in memory and rewritten on mutation; the cache is
/// small (one entry per distinct commenter) so this stays cheap.
#[derive(Debug)]
pub struct UserStore {
    path: PathBuf,
    records: HashMap<String, UserRecord>,
}

impl UserStore {
    /// Opens the store at `path`, loading existing records if present.
    pub fn open(path: PathBuf) -> Result<Self> {
        let records = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self { path, records })
    }

    /// Looks up a record by user id.
    pub fn get(&self, id: &str) -> Result<&UserRecord, HubError> {
        self.records
            .get(id)
            .ok_or_else(|| HubError::RecordNotFound(id.to_string()))
    }

    /// Inserts or replaces a record and persists the store.
    pub fn set(&mut self, record: UserRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record);
        self.flush()
    }

    /// Updates just the display name of an existing record.
    pub fn set_name(&mut self, id: &str, name: &str) -> Result<(), HubError> {
        let rec = self
            .records
            .get_mut(id)
            .ok_or_else(|| HubError::RecordNotFound(id.to_string()))?;
        rec.name = name.to_string();
        self.flush()
            .map_err(|e| HubError::Transport(format!("user store write: {e}")))
    }

    /// Removes a record and persists the store.
    pub fn delete(&mut self, id: &str) -> Result<(), HubError> {
        if self.records.remove(id).is_none() {
            return Err(HubError::RecordNotFound(id.to_string()));
        }
        self.flush()
            .map_err(|e| HubError::Transport(format!("user store write: {e}")))
    }

    fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.records)?)?;
        Ok(())
    }
}

/// Rolling-window call limiter.
///
/// Allows at most `limit` calls within any window of `window` length.
/// Timestamps of granted calls are kept in a deque; expired ones are
/// dropped on each check.
#[derive(Debug)]
pub struct RollingLimiter {
    limit: usize,
    window: Duration,
    granted: VecDeque<Instant>,
}

impl RollingLimiter {
    /// Creates a limiter granting `limit` calls per `window`.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            granted: VecDeque::new(),
        }
    }

    /// Tries to take one call slot at time `now`.
    ///
    /// Returns `RateLimited` when `limit` calls were already granted inside
    /// the window; the caller must not perform the guarded operation.
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), HubError> {
        while let Some(&front) = self.granted.front() {
            if now.duration_since(front) >= self.window {
                self.granted.pop_front();
            } else {
                break;
            }
        }
        if self.granted.len() >= self.limit {
            return Err(HubError::RateLimited(format!(
                "{} calls in {:?}",
                self.limit, self.window
            )));
        }
        self.granted.push_back(now);
        Ok(())
    }

    /// [`Self::try_acquire_at`] with the current time.
    pub fn try_acquire(&mut self) -> Result<(), HubError> {
        self.try_acquire_at(Instant::now())
    }
}
