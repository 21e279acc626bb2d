//! Main store implementation.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use time::OffsetDateTime;
use tracing::{debug, info};

use meterlink_types::{CapturePeriod, ProfileCursor, ProfileId, ProfileRow, SyncOutcome};

use crate::error::{Error, Result};
use crate::models::{StoredCursor, StoredDevice, StoredRow};
use crate::queries::RowQuery;
use crate::schema;

/// SQLite-based store for profile rows and sync cursors.
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }
}

// === Device registry ===

const DEVICE_COLUMNS: &str = "id, model, first_seen, last_seen";

impl Store {
    /// Record a device, refreshing `last_seen` and, when given, its model.
    pub fn upsert_device(&self, device_id: &str, model: Option<&str>) -> Result<StoredDevice> {
        touch_device(&self.conn, device_id, model)?;
        self.get_device(device_id)?
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
    }

    /// Get a device by serial.
    pub fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?", DEVICE_COLUMNS),
                [device_id],
                RawDevice::from_row,
            )
            .optional()?;
        raw.map(RawDevice::into_device).transpose()
    }

    /// List all devices, most recently seen first.
    pub fn list_devices(&self) -> Result<Vec<StoredDevice>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM devices ORDER BY last_seen DESC, id ASC",
            DEVICE_COLUMNS
        ))?;
        let raw = stmt
            .query_map([], RawDevice::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawDevice::into_device).collect()
    }
}

// === Profile rows ===

impl Store {
    /// Insert the rows that are not stored yet and advance the cursor.
    ///
    /// Duplicates are detected by (device, profile, timestamp). The cursor
    /// moves to the later of its previous value and the newest incoming
    /// timestamp, inside the same transaction as the inserts.
    pub fn save_batch_and_advance_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        rows: &[ProfileRow],
        capture_period: CapturePeriod,
    ) -> Result<SyncOutcome> {
        let tx = self.conn.unchecked_transaction()?;
        touch_device(&tx, device_id, None)?;
        let previous = read_cursor(&tx, device_id, profile_id)?.map(|c| c.last_timestamp);

        let synced_at = OffsetDateTime::now_utc().unix_timestamp();
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO profile_rows
                 (device_id, profile_id, timestamp, synced_at, row_values)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                let values = serde_json::to_string(&row.values)?;
                inserted += stmt.execute(params![
                    device_id,
                    profile_id.as_str(),
                    row.timestamp.unix_timestamp(),
                    synced_at,
                    values,
                ])?;
            }
        }

        let timestamps: Vec<OffsetDateTime> = rows.iter().map(|r| r.timestamp).collect();
        let outcome = SyncOutcome::compute(previous, &timestamps, inserted);
        if let Some(advance_to) = outcome.advance_to {
            write_cursor(&tx, device_id, profile_id, advance_to, capture_period)?;
        }
        tx.commit()?;

        debug!(
            incoming = outcome.total_incoming,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            "Saved batch of {} for {}",
            profile_id,
            device_id
        );
        Ok(outcome)
    }

    /// Query rows with filters.
    pub fn query_rows(&self, query: &RowQuery) -> Result<Vec<StoredRow>> {
        let sql = query.build_sql();
        let (_, params) = query.build_where();
        debug!("Executing query: {}", sql);

        let params_ref: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_map(params_ref.as_slice(), |row| {
                Ok(RawRow {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    profile_id: row.get(2)?,
                    timestamp: row.get(3)?,
                    synced_at: row.get(4)?,
                    values: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter().map(RawRow::into_row).collect()
    }

    /// Newest stored row of a profile.
    pub fn latest_row(&self, device_id: &str, profile_id: &ProfileId) -> Result<Option<StoredRow>> {
        let query = RowQuery::new()
            .device(device_id)
            .profile(profile_id.as_str())
            .limit(1);
        Ok(self.query_rows(&query)?.pop())
    }

    /// Count rows, optionally for one device and/or profile.
    pub fn count_rows(
        &self,
        device_id: Option<&str>,
        profile_id: Option<&ProfileId>,
    ) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM profile_rows
             WHERE (?1 IS NULL OR device_id = ?1) AND (?2 IS NULL OR profile_id = ?2)",
            params![device_id, profile_id.map(ProfileId::as_str)],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// === Cursors ===

impl Store {
    /// Load the cursor of a (device, profile).
    pub fn load_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
    ) -> Result<Option<ProfileCursor>> {
        Ok(read_cursor(&self.conn, device_id, profile_id)?.map(ProfileCursor::from))
    }

    /// Store a cursor. The stored timestamp never moves backwards; the
    /// capture period is always replaced.
    pub fn upsert_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        timestamp: OffsetDateTime,
        capture_period: CapturePeriod,
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        touch_device(&tx, device_id, None)?;
        write_cursor(&tx, device_id, profile_id, timestamp, capture_period)?;
        tx.commit()?;
        Ok(())
    }

    /// List cursors, optionally for one device.
    pub fn list_cursors(&self, device_id: Option<&str>) -> Result<Vec<StoredCursor>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM profile_cursors
             WHERE (?1 IS NULL OR device_id = ?1)
             ORDER BY device_id, profile_id",
            CURSOR_COLUMNS
        ))?;
        let raw = stmt
            .query_map([device_id], RawCursor::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawCursor::into_cursor).collect()
    }

    /// Delete a cursor so the next cycle reseeds it from the device.
    pub fn delete_cursor(&self, device_id: &str, profile_id: &ProfileId) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM profile_cursors WHERE device_id = ?1 AND profile_id = ?2",
            params![device_id, profile_id.as_str()],
        )?;
        if deleted > 0 {
            info!("Deleted cursor of {} for {}", profile_id, device_id);
        }
        Ok(deleted > 0)
    }
}

const CURSOR_COLUMNS: &str =
    "device_id, profile_id, last_timestamp, period_amount, period_unit, updated_at";

fn touch_device(conn: &Connection, device_id: &str, model: Option<&str>) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT INTO devices (id, model, first_seen, last_seen) VALUES (?1, ?2, ?3, ?3)
         ON CONFLICT(id) DO UPDATE SET
            model = COALESCE(?2, model),
            last_seen = ?3",
        params![device_id, model, now],
    )?;
    Ok(())
}

fn read_cursor(
    conn: &Connection,
    device_id: &str,
    profile_id: &ProfileId,
) -> Result<Option<StoredCursor>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM profile_cursors WHERE device_id = ?1 AND profile_id = ?2",
                CURSOR_COLUMNS
            ),
            params![device_id, profile_id.as_str()],
            RawCursor::from_row,
        )
        .optional()?;
    raw.map(RawCursor::into_cursor).transpose()
}

fn write_cursor(
    conn: &Connection,
    device_id: &str,
    profile_id: &ProfileId,
    timestamp: OffsetDateTime,
    capture_period: CapturePeriod,
) -> Result<()> {
    let (amount, unit) = capture_period.to_parts();
    conn.execute(
        "INSERT INTO profile_cursors
         (device_id, profile_id, last_timestamp, period_amount, period_unit, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(device_id, profile_id) DO UPDATE SET
            last_timestamp = MAX(last_timestamp, excluded.last_timestamp),
            period_amount = excluded.period_amount,
            period_unit = excluded.period_unit,
            updated_at = excluded.updated_at",
        params![
            device_id,
            profile_id.as_str(),
            timestamp.unix_timestamp(),
            amount,
            unit,
            OffsetDateTime::now_utc().unix_timestamp(),
        ],
    )?;
    Ok(())
}

fn from_unix(column: &'static str, secs: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| Error::corrupt(column, e))
}

// Rows as SQLite hands them out, before conversion to model types.

struct RawDevice {
    id: String,
    model: Option<String>,
    first_seen: i64,
    last_seen: i64,
}

impl RawDevice {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            model: row.get(1)?,
            first_seen: row.get(2)?,
            last_seen: row.get(3)?,
        })
    }

    fn into_device(self) -> Result<StoredDevice> {
        Ok(StoredDevice {
            id: self.id,
            model: self.model,
            first_seen: from_unix("first_seen", self.first_seen)?,
            last_seen: from_unix("last_seen", self.last_seen)?,
        })
    }
}

struct RawRow {
    id: i64,
    device_id: String,
    profile_id: String,
    timestamp: i64,
    synced_at: i64,
    values: String,
}

impl RawRow {
    fn into_row(self) -> Result<StoredRow> {
        Ok(StoredRow {
            id: self.id,
            device_id: self.device_id,
            profile_id: ProfileId::from(self.profile_id),
            timestamp: from_unix("timestamp", self.timestamp)?,
            synced_at: from_unix("synced_at", self.synced_at)?,
            values: serde_json::from_str(&self.values)
                .map_err(|e| Error::corrupt("row_values", e))?,
        })
    }
}

struct RawCursor {
    device_id: String,
    profile_id: String,
    last_timestamp: i64,
    period_amount: i64,
    period_unit: String,
    updated_at: i64,
}

impl RawCursor {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            device_id: row.get(0)?,
            profile_id: row.get(1)?,
            last_timestamp: row.get(2)?,
            period_amount: row.get(3)?,
            period_unit: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_cursor(self) -> Result<StoredCursor> {
        Ok(StoredCursor {
            device_id: self.device_id,
            profile_id: ProfileId::from(self.profile_id),
            last_timestamp: from_unix("last_timestamp", self.last_timestamp)?,
            capture_period: CapturePeriod::from_parts(self.period_amount, &self.period_unit)
                .map_err(|e| Error::corrupt("period_unit", e))?,
            updated_at: from_unix("updated_at", self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterlink_types::CellValue;
    use time::macros::datetime;

    fn lp() -> ProfileId {
        ProfileId::from("load_profile_1")
    }

    fn row(t: OffsetDateTime, import: i64) -> ProfileRow {
        ProfileRow::new(t)
            .with_value("3/1-0:1.8.0.255/2", CellValue::Integer(import))
            .with_value("3/1-0:2.8.0.255/2", CellValue::Float(0.5))
    }

    fn quarter_hours(start: OffsetDateTime, count: usize) -> Vec<ProfileRow> {
        (0..count)
            .map(|i| row(start + time::Duration::minutes(15 * i as i64), 1000 + i as i64))
            .collect()
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.list_devices().unwrap().is_empty());
        assert_eq!(store.count_rows(None, None).unwrap(), 0);
    }

    #[test]
    fn test_upsert_device_keeps_model() {
        let store = Store::open_in_memory().unwrap();

        let device = store.upsert_device("MTR-1", Some("AM550")).unwrap();
        assert_eq!(device.model.as_deref(), Some("AM550"));

        let device = store.upsert_device("MTR-1", None).unwrap();
        assert_eq!(device.model.as_deref(), Some("AM550"));
        assert!(device.last_seen >= device.first_seen);
    }

    #[test]
    fn test_save_batch_inserts_and_advances() {
        let store = Store::open_in_memory().unwrap();
        let rows = quarter_hours(datetime!(2024-01-01 00:00 UTC), 4);

        let outcome = store
            .save_batch_and_advance_cursor("MTR-1", &lp(), &rows, CapturePeriod::Seconds(900))
            .unwrap();

        assert_eq!(outcome.total_incoming, 4);
        assert_eq!(outcome.inserted, 4);
        assert_eq!(outcome.duplicates, 0);
        assert_eq!(outcome.previous_cursor, None);
        assert_eq!(outcome.advance_to, Some(datetime!(2024-01-01 00:45 UTC)));

        let cursor = store.load_cursor("MTR-1", &lp()).unwrap().unwrap();
        assert_eq!(cursor.last_timestamp, datetime!(2024-01-01 00:45 UTC));
        assert_eq!(cursor.capture_period, CapturePeriod::Seconds(900));
        assert!(store.get_device("MTR-1").unwrap().is_some());
    }

    #[test]
    fn test_save_batch_detects_duplicates() {
        let store = Store::open_in_memory().unwrap();
        let rows = quarter_hours(datetime!(2024-01-01 00:00 UTC), 4);
        store
            .save_batch_and_advance_cursor("MTR-1", &lp(), &rows, CapturePeriod::Seconds(900))
            .unwrap();

        let overlapping = quarter_hours(datetime!(2024-01-01 00:30 UTC), 4);
        let outcome = store
            .save_batch_and_advance_cursor(
                "MTR-1",
                &lp(),
                &overlapping,
                CapturePeriod::Seconds(900),
            )
            .unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(outcome.previous_cursor, Some(datetime!(2024-01-01 00:45 UTC)));
        assert_eq!(store.count_rows(Some("MTR-1"), Some(&lp())).unwrap(), 6);
    }

    #[test]
    fn test_same_timestamp_in_other_profile_is_not_duplicate() {
        let store = Store::open_in_memory().unwrap();
        let rows = quarter_hours(datetime!(2024-01-01 00:00 UTC), 2);
        store
            .save_batch_and_advance_cursor("MTR-1", &lp(), &rows, CapturePeriod::Seconds(900))
            .unwrap();
        let outcome = store
            .save_batch_and_advance_cursor(
                "MTR-1",
                &ProfileId::from("load_profile_2"),
                &rows,
                CapturePeriod::Seconds(900),
            )
            .unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(store.count_rows(Some("MTR-1"), None).unwrap(), 4);
    }

    #[test]
    fn test_old_batch_does_not_move_cursor_back() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_cursor(
                "MTR-1",
                &lp(),
                datetime!(2024-01-02 00:00 UTC),
                CapturePeriod::Seconds(900),
            )
            .unwrap();

        let outcome = store
            .save_batch_and_advance_cursor(
                "MTR-1",
                &lp(),
                &quarter_hours(datetime!(2024-01-01 00:00 UTC), 2),
                CapturePeriod::Seconds(900),
            )
            .unwrap();

        assert!(!outcome.advanced);
        assert_eq!(outcome.advance_to, Some(datetime!(2024-01-02 00:00 UTC)));
        let cursor = store.load_cursor("MTR-1", &lp()).unwrap().unwrap();
        assert_eq!(cursor.last_timestamp, datetime!(2024-01-02 00:00 UTC));
    }

    #[test]
    fn test_empty_batch_leaves_state_alone() {
        let store = Store::open_in_memory().unwrap();
        let outcome = store
            .save_batch_and_advance_cursor("MTR-1", &lp(), &[], CapturePeriod::Seconds(900))
            .unwrap();

        assert_eq!(outcome.total_incoming, 0);
        assert_eq!(outcome.advance_to, None);
        assert!(store.load_cursor("MTR-1", &lp()).unwrap().is_none());
    }

    #[test]
    fn test_upsert_cursor_is_monotonic() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_cursor(
                "MTR-1",
                &lp(),
                datetime!(2024-01-01 02:00 UTC),
                CapturePeriod::Seconds(900),
            )
            .unwrap();
        store
            .upsert_cursor(
                "MTR-1",
                &lp(),
                datetime!(2024-01-01 01:00 UTC),
                CapturePeriod::Seconds(1800),
            )
            .unwrap();

        let cursor = store.load_cursor("MTR-1", &lp()).unwrap().unwrap();
        assert_eq!(cursor.last_timestamp, datetime!(2024-01-01 02:00 UTC));
        assert_eq!(cursor.capture_period, CapturePeriod::Seconds(1800));
    }

    #[test]
    fn test_calendar_periods_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let monthly = ProfileId::from("monthly_billing");
        store
            .upsert_cursor(
                "MTR-1",
                &monthly,
                datetime!(2024-02-01 00:00 UTC),
                CapturePeriod::Monthly,
            )
            .unwrap();
        store
            .upsert_cursor("MTR-2", &monthly, datetime!(2024-02-01 00:00 UTC), CapturePeriod::Daily)
            .unwrap();

        let cursors = store.list_cursors(None).unwrap();
        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors[0].capture_period, CapturePeriod::Monthly);
        assert_eq!(cursors[1].capture_period, CapturePeriod::Daily);
        assert_eq!(store.list_cursors(Some("MTR-2")).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_cursor() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_cursor(
                "MTR-1",
                &lp(),
                datetime!(2024-01-01 00:00 UTC),
                CapturePeriod::Seconds(900),
            )
            .unwrap();

        assert!(store.delete_cursor("MTR-1", &lp()).unwrap());
        assert!(!store.delete_cursor("MTR-1", &lp()).unwrap());
        assert!(store.load_cursor("MTR-1", &lp()).unwrap().is_none());
    }

    #[test]
    fn test_query_rows_round_trips_values() {
        let store = Store::open_in_memory().unwrap();
        let rows = vec![
            row(datetime!(2024-01-01 00:00 UTC), 1000)
                .with_value(
                    "8/0-0:1.0.0.255/2",
                    CellValue::Timestamp(datetime!(2024-01-01 00:00 UTC)),
                )
                .with_value("1/0-0:96.10.1.255/2", CellValue::Raw(vec![0xDE, 0xAD]))
                .with_value("1/0-0:96.1.0.255/2", CellValue::Text("A1".to_string()))
                .with_value("1/0-0:96.5.0.255/2", CellValue::Null),
        ];
        store
            .save_batch_and_advance_cursor("MTR-1", &lp(), &rows, CapturePeriod::Seconds(900))
            .unwrap();

        let stored = store.query_rows(&RowQuery::new().device("MTR-1")).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].profile_id, lp());
        assert_eq!(stored[0].to_row(), rows[0]);
    }

    #[test]
    fn test_query_rows_filters_and_orders() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_batch_and_advance_cursor(
                "MTR-1",
                &lp(),
                &quarter_hours(datetime!(2024-01-01 00:00 UTC), 8),
                CapturePeriod::Seconds(900),
            )
            .unwrap();
        store
            .save_batch_and_advance_cursor(
                "MTR-2",
                &lp(),
                &quarter_hours(datetime!(2024-01-01 00:00 UTC), 8),
                CapturePeriod::Seconds(900),
            )
            .unwrap();

        let window = store
            .query_rows(
                &RowQuery::new()
                    .device("MTR-1")
                    .since(datetime!(2024-01-01 00:30 UTC))
                    .until(datetime!(2024-01-01 01:00 UTC))
                    .oldest_first(),
            )
            .unwrap();
        let stamps: Vec<_> = window.iter().map(|r| r.timestamp).collect();
        assert_eq!(
            stamps,
            vec![
                datetime!(2024-01-01 00:30 UTC),
                datetime!(2024-01-01 00:45 UTC),
                datetime!(2024-01-01 01:00 UTC),
            ]
        );

        let page = store
            .query_rows(&RowQuery::new().device("MTR-2").limit(2).offset(2))
            .unwrap();
        assert_eq!(page[0].timestamp, datetime!(2024-01-01 01:15 UTC));
        assert_eq!(page.len(), 2);

        let latest = store.latest_row("MTR-1", &lp()).unwrap().unwrap();
        assert_eq!(latest.timestamp, datetime!(2024-01-01 01:45 UTC));
        assert_eq!(store.count_rows(None, None).unwrap(), 16);
    }

    #[test]
    fn test_list_devices() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_device("MTR-1", None).unwrap();
        store.upsert_device("MTR-2", Some("E570")).unwrap();

        let devices = store.list_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().any(|d| d.model.as_deref() == Some("E570")));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("data.db");

        {
            let store = Store::open(&path).unwrap();
            store
                .save_batch_and_advance_cursor(
                    "MTR-1",
                    &lp(),
                    &quarter_hours(datetime!(2024-01-01 00:00 UTC), 3),
                    CapturePeriod::Seconds(900),
                )
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.count_rows(Some("MTR-1"), Some(&lp())).unwrap(), 3);
        let cursor = store.load_cursor("MTR-1", &lp()).unwrap().unwrap();
        assert_eq!(cursor.last_timestamp, datetime!(2024-01-01 00:30 UTC));
    }
}
