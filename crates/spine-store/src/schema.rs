//! Profile database layout. The `metadata` table records which layout a
//! file was written with; a file from a newer build is refused rather than
//! silently downgraded.

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    if let Some(found) = stored_version(conn)?
        && found > SCHEMA_VERSION
    {
        return Err(StoreError::InvalidData(format!(
            "profile database has schema v{found}, this build supports up to v{SCHEMA_VERSION}"
        )));
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS uwsm_profiles (
            session_id      TEXT PRIMARY KEY,
            updated_at      TEXT NOT NULL,
            mean_confidence REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS uwsm_dimensions (
            session_id   TEXT NOT NULL REFERENCES uwsm_profiles(session_id) ON DELETE CASCADE,
            dimension    TEXT NOT NULL,
            value        REAL NOT NULL,
            confidence   REAL NOT NULL,
            samples      INTEGER NOT NULL DEFAULT 0,
            last_updated TEXT,
            PRIMARY KEY (session_id, dimension)
        );

        CREATE INDEX IF NOT EXISTS idx_profiles_updated ON uwsm_profiles(updated_at);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Layout version recorded in `metadata`, `None` for a fresh file.
pub fn stored_version(conn: &Connection) -> Result<Option<i64>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|v| {
        v.trim()
            .parse::<i64>()
            .map_err(|_| StoreError::InvalidData(format!("bad schema_version '{v}' in metadata")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();

        for table in &["metadata", "uwsm_profiles", "uwsm_dimensions"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert!(count >= 0, "{table} missing");
        }
        assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_newer_schema_refused() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn.execute(
            "UPDATE metadata SET value = ?1 WHERE key = 'schema_version'",
            [(SCHEMA_VERSION + 1).to_string()],
        )
        .unwrap();

        let err = initialize(&conn).unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
        assert!(err.to_string().contains(&format!("v{}", SCHEMA_VERSION + 1)));
        // the stored version is left alone
        assert_eq!(stored_version(&conn).unwrap(), Some(SCHEMA_VERSION + 1));
    }

    #[test]
    fn test_garbage_schema_version_is_invalid() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn.execute(
            "UPDATE metadata SET value = 'one' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        assert!(stored_version(&conn).is_err());
    }
}
