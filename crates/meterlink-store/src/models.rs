//! Data models for stored data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use meterlink_types::{CapturePeriod, CellValue, ProfileCursor, ProfileId, ProfileRow};

/// A device stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDevice {
    /// Device serial.
    pub id: String,
    /// Meter model, when known.
    pub model: Option<String>,
    /// First time this device was synchronized.
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    /// Last time this device was synchronized.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// A profile record stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    /// Database row ID.
    pub id: i64,
    /// Device serial.
    pub device_id: String,
    /// Profile the record belongs to.
    pub profile_id: ProfileId,
    /// Capture time reported by the meter.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// When this record was written.
    #[serde(with = "time::serde::rfc3339")]
    pub synced_at: OffsetDateTime,
    /// Column id to value.
    pub values: BTreeMap<String, CellValue>,
}

impl StoredRow {
    /// Convert back to a [`ProfileRow`].
    pub fn to_row(&self) -> ProfileRow {
        ProfileRow {
            timestamp: self.timestamp,
            values: self.values.clone(),
        }
    }
}

/// A stored cursor plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCursor {
    /// Device serial.
    pub device_id: String,
    /// Profile identifier.
    pub profile_id: ProfileId,
    /// Lower bound of the next read.
    #[serde(with = "time::serde::rfc3339")]
    pub last_timestamp: OffsetDateTime,
    /// Capture period the cursor advances by.
    pub capture_period: CapturePeriod,
    /// Last write of this cursor.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<StoredCursor> for ProfileCursor {
    fn from(stored: StoredCursor) -> Self {
        ProfileCursor {
            device_id: stored.device_id,
            profile_id: stored.profile_id,
            last_timestamp: stored.last_timestamp,
            capture_period: stored.capture_period,
        }
    }
}
