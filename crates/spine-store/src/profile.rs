//! SQLite persistence for final per-session UWSM profiles, with
//! retention-based pruning.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use spine_core::{Dimension, DimensionState};

use crate::error::{Result, StoreError};
use crate::schema;

pub const DATA_DIR_ENV: &str = "SPINE_DATA_DIR";
pub const PROFILE_DB_NAME: &str = "profiles.db";

/// Default base directory for spine storage: `SPINE_DATA_DIR`, else `~/.spine`.
pub fn default_base_dir() -> PathBuf {
    if let Ok(dir) = env::var(DATA_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs_home().join(".spine")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

pub fn default_db_path() -> PathBuf {
    default_base_dir().join(PROFILE_DB_NAME)
}

/// Fixed-width UTC text so stored timestamps compare lexicographically.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{raw}': {e}")))
}

fn mean_confidence(dimensions: &BTreeMap<Dimension, DimensionState>) -> f64 {
    if dimensions.is_empty() {
        return 0.0;
    }
    dimensions.values().map(|d| d.confidence).sum::<f64>() / dimensions.len() as f64
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredProfile {
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
    pub mean_confidence: f64,
    pub dimensions: BTreeMap<Dimension, DimensionState>,
}

pub struct ProfileStore {
    conn: Connection,
}

impl ProfileStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Save ---

    /// Replace the stored profile for `session_id`.
    pub fn save(
        &self,
        session_id: &str,
        dimensions: &BTreeMap<Dimension, DimensionState>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM uwsm_dimensions WHERE session_id = ?1",
            [session_id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO uwsm_profiles (session_id, updated_at, mean_confidence)
             VALUES (?1, ?2, ?3)",
            params![session_id, ts(updated_at), mean_confidence(dimensions)],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO uwsm_dimensions
                 (session_id, dimension, value, confidence, samples, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (dimension, state) in dimensions {
                insert.execute(params![
                    session_id,
                    dimension.as_str(),
                    state.value,
                    state.confidence,
                    state.samples,
                    state.last_updated.map(ts),
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(session_id, dimensions = dimensions.len(), "saved uwsm profile");
        Ok(())
    }

    // --- Load ---

    pub fn load(&self, session_id: &str) -> Result<Option<StoredProfile>> {
        let header = self
            .conn
            .query_row(
                "SELECT updated_at, mean_confidence FROM uwsm_profiles WHERE session_id = ?1",
                [session_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;
        let Some((updated_at, mean_confidence)) = header else {
            return Ok(None);
        };

        Ok(Some(StoredProfile {
            session_id: session_id.to_string(),
            updated_at: parse_ts(&updated_at)?,
            mean_confidence,
            dimensions: self.load_dimensions(session_id)?,
        }))
    }

    fn load_dimensions(&self, session_id: &str) -> Result<BTreeMap<Dimension, DimensionState>> {
        let mut stmt = self.conn.prepare(
            "SELECT dimension, value, confidence, samples, last_updated
             FROM uwsm_dimensions WHERE session_id = ?1",
        )?;
        let rows: Vec<(String, f64, f64, u32, Option<String>)> = stmt
            .query_map([session_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut dimensions = BTreeMap::new();
        for (name, value, confidence, samples, last_updated) in rows {
            let dimension = Dimension::parse(&name)
                .ok_or_else(|| StoreError::InvalidData(format!("unknown dimension '{name}'")))?;
            let last_updated = last_updated.as_deref().map(parse_ts).transpose()?;
            dimensions.insert(
                dimension,
                DimensionState {
                    value,
                    confidence,
                    samples,
                    last_updated,
                },
            );
        }
        Ok(dimensions)
    }

    /// Every stored profile, oldest update first.
    pub fn list(&self) -> Result<Vec<StoredProfile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT session_id FROM uwsm_profiles ORDER BY updated_at, session_id")?;
        let ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut profiles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(profile) = self.load(&id)? {
                profiles.push(profile);
            }
        }
        Ok(profiles)
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM uwsm_profiles", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // --- Retention ---

    /// Delete profiles not updated within `retention_days` of `now`.
    pub fn prune_expired(&self, retention_days: u32, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - TimeDelta::days(i64::from(retention_days));
        let removed = self.conn.execute(
            "DELETE FROM uwsm_profiles WHERE updated_at < ?1",
            [ts(cutoff)],
        )?;
        if removed > 0 {
            tracing::info!(removed, retention_days, "pruned expired uwsm profiles");
        }
        Ok(removed)
    }
}
