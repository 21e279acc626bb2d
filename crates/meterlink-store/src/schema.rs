//! Database schema and migrations.
//!
//! Each entry of [`MIGRATIONS`] moves the schema up by one version. Fresh
//! databases run all of them in order.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::{Error, Result};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

const MIGRATIONS: &[(i32, &str)] = &[
    (
        1,
        r#"
        -- Devices seen by the synchronizer
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL
        );

        -- Profile records read from meters
        CREATE TABLE IF NOT EXISTS profile_rows (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL REFERENCES devices(id),
            profile_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            synced_at INTEGER NOT NULL,
            row_values TEXT NOT NULL,
            UNIQUE(device_id, profile_id, timestamp)
        );

        -- Resume positions per (device, profile)
        CREATE TABLE IF NOT EXISTS profile_cursors (
            device_id TEXT NOT NULL REFERENCES devices(id),
            profile_id TEXT NOT NULL,
            last_timestamp INTEGER NOT NULL,
            period_amount INTEGER NOT NULL,
            period_unit TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (device_id, profile_id)
        );
        "#,
    ),
    (
        2,
        r#"
        ALTER TABLE devices ADD COLUMN model TEXT;
        CREATE INDEX IF NOT EXISTS idx_profile_rows_synced
            ON profile_rows(synced_at);
        "#,
    ),
];

/// Bring the database up to [`SCHEMA_VERSION`].
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );",
    )?;

    let version = get_schema_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    for (target, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > version) {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        set_schema_version(&tx, *target)?;
        tx.commit()?;
        info!("Migrated database schema to version {}", target);
    }

    Ok(())
}

/// Get the current schema version (0 for a fresh database).
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}
