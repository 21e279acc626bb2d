//! Core types for meter profile data.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::error::ParseError;

/// A six-group OBIS identifier (`A-B:C.D.E.F`).
///
/// # Examples
///
/// ```
/// use meterlink_types::ObisCode;
///
/// let obis: ObisCode = "1-0:99.1.0.255".parse().unwrap();
/// assert_eq!(obis, ObisCode::new(1, 0, 99, 1, 0, 255));
/// assert_eq!(obis.to_string(), "1-0:99.1.0.255");
///
/// // The all-dots form is accepted as well.
/// assert_eq!("1.0.99.1.0.255".parse::<ObisCode>().unwrap(), obis);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObisCode([u8; 6]);

impl ObisCode {
    /// Create an OBIS code from its six value groups.
    #[must_use]
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self([a, b, c, d, e, f])
    }

    /// Create an OBIS code from a 6-byte octet string.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let groups: [u8; 6] = bytes.try_into().map_err(|_| ParseError::InsufficientBytes {
            expected: 6,
            actual: bytes.len(),
        })?;
        Ok(Self(groups))
    }

    /// The six value groups.
    #[must_use]
    pub const fn groups(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{}-{}:{}.{}.{}.{}", a, b, c, d, e, g)
    }
}

impl FromStr for ObisCode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(['-', ':', '.']).collect();
        if parts.len() != 6 {
            return Err(ParseError::InvalidObis(s.to_string()));
        }
        let mut groups = [0u8; 6];
        for (slot, part) in groups.iter_mut().zip(parts) {
            *slot = part
                .parse()
                .map_err(|_| ParseError::InvalidObis(s.to_string()))?;
        }
        Ok(Self(groups))
    }
}

#[cfg(feature = "serde")]
impl Serialize for ObisCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for ObisCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One column of a profile buffer: the attribute of another object that the
/// profile samples at every capture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CaptureObject {
    /// Interface class of the captured object.
    pub class_id: u16,
    /// Logical name of the captured object.
    pub logical_name: ObisCode,
    /// Captured attribute (1-based).
    pub attribute_index: i8,
    /// Element within a compound attribute (0 = whole value).
    #[cfg_attr(feature = "serde", serde(default))]
    pub data_index: u16,
}

impl CaptureObject {
    /// Create a capture object referencing a whole attribute.
    #[must_use]
    pub const fn new(class_id: u16, logical_name: ObisCode, attribute_index: i8) -> Self {
        Self {
            class_id,
            logical_name,
            attribute_index,
            data_index: 0,
        }
    }

    /// The column identifier used as key in [`ProfileRow::values`].
    ///
    /// ```
    /// use meterlink_types::{CaptureObject, ObisCode};
    ///
    /// let energy = CaptureObject::new(3, ObisCode::new(1, 0, 1, 8, 0, 255), 2);
    /// assert_eq!(energy.column_id(), "3/1-0:1.8.0.255/2");
    /// ```
    #[must_use]
    pub fn column_id(&self) -> String {
        if self.data_index == 0 {
            format!(
                "{}/{}/{}",
                self.class_id, self.logical_name, self.attribute_index
            )
        } else {
            format!(
                "{}/{}/{}/{}",
                self.class_id, self.logical_name, self.attribute_index, self.data_index
            )
        }
    }

    /// Whether this column captures the clock time.
    #[must_use]
    pub fn is_clock(&self) -> bool {
        self.class_id == crate::obis::CLOCK_CLASS_ID
            && self.logical_name == crate::obis::CLOCK
            && self.attribute_index == 2
    }
}

impl FromStr for CaptureObject {
    type Err = ParseError;

    /// Parse the `class/obis/attribute[/data_index]` form produced by
    /// [`CaptureObject::column_id`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(ParseError::InvalidValue(format!(
                "capture object '{}' must look like class/obis/attribute",
                s
            )));
        }
        let bad = |what: &str| ParseError::InvalidValue(format!("invalid {} in '{}'", what, s));
        Ok(Self {
            class_id: parts[0].parse().map_err(|_| bad("class id"))?,
            logical_name: parts[1].parse()?,
            attribute_index: parts[2].parse().map_err(|_| bad("attribute index"))?,
            data_index: match parts.get(3) {
                Some(p) => p.parse().map_err(|_| bad("data index"))?,
                None => 0,
            },
        })
    }
}

/// Identifier of a device-resident profile (load profile, billing profile,
/// event log).
///
/// Profile identifiers are free-form strings; deployments commonly use names
/// such as `load_profile_1` or `monthly_billing`, or the OBIS code itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ProfileId(String);

impl ProfileId {
    /// Create a profile id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive prefix match.
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.len() >= prefix.len()
            && self.0.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProfileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Interval between two consecutive samples of a profile.
///
/// Interval profiles carry a period in seconds. Daily and monthly profiles
/// advance by one calendar unit, which is not a fixed number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum CapturePeriod {
    /// Fixed interval in seconds.
    Seconds(i64),
    /// One calendar day.
    Daily,
    /// One calendar month.
    Monthly,
}

/// Default capture period used when neither the store nor the device
/// provides one (15 minutes).
pub const DEFAULT_CAPTURE_PERIOD_SECS: i64 = 900;

impl CapturePeriod {
    /// The period in seconds, if it is a fixed interval.
    #[must_use]
    pub fn seconds(&self) -> Option<i64> {
        match self {
            CapturePeriod::Seconds(s) => Some(*s),
            _ => None,
        }
    }

    /// Whether a sync loop can make progress with this period.
    ///
    /// Calendar periods always advance; fixed periods must be positive.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        match self {
            CapturePeriod::Seconds(s) => *s > 0,
            CapturePeriod::Daily | CapturePeriod::Monthly => true,
        }
    }

    /// Whether this is a calendar (daily or monthly) period.
    #[must_use]
    pub fn is_calendar(&self) -> bool {
        matches!(self, CapturePeriod::Daily | CapturePeriod::Monthly)
    }

    /// Add `n` periods to a timestamp.
    ///
    /// ```
    /// use meterlink_types::CapturePeriod;
    /// use time::macros::datetime;
    ///
    /// let t = datetime!(2024-01-31 00:00 UTC);
    /// assert_eq!(CapturePeriod::Seconds(900).add_to(t, 4), datetime!(2024-01-31 01:00 UTC));
    /// assert_eq!(CapturePeriod::Daily.add_to(t, 1), datetime!(2024-02-01 00:00 UTC));
    /// assert_eq!(CapturePeriod::Monthly.add_to(t, 1), datetime!(2024-02-29 00:00 UTC));
    /// ```
    #[must_use]
    pub fn add_to(&self, t: OffsetDateTime, n: i64) -> OffsetDateTime {
        match self {
            CapturePeriod::Seconds(s) => t + time::Duration::seconds(s.saturating_mul(n)),
            CapturePeriod::Daily => t + time::Duration::days(n),
            CapturePeriod::Monthly => crate::timestamp::add_months(t, n),
        }
    }

    /// Storage encoding: `(amount, unit)`.
    #[must_use]
    pub fn to_parts(&self) -> (i64, &'static str) {
        match self {
            CapturePeriod::Seconds(s) => (*s, "seconds"),
            CapturePeriod::Daily => (1, "day"),
            CapturePeriod::Monthly => (1, "month"),
        }
    }

    /// Inverse of [`CapturePeriod::to_parts`].
    pub fn from_parts(amount: i64, unit: &str) -> Result<Self, ParseError> {
        match unit {
            "seconds" => Ok(CapturePeriod::Seconds(amount)),
            "day" => Ok(CapturePeriod::Daily),
            "month" => Ok(CapturePeriod::Monthly),
            other => Err(ParseError::InvalidValue(format!(
                "unknown capture period unit '{}'",
                other
            ))),
        }
    }
}

impl Default for CapturePeriod {
    fn default() -> Self {
        CapturePeriod::Seconds(DEFAULT_CAPTURE_PERIOD_SECS)
    }
}

impl fmt::Display for CapturePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapturePeriod::Seconds(s) => write!(f, "{}s", s),
            CapturePeriod::Daily => write!(f, "1 day"),
            CapturePeriod::Monthly => write!(f, "1 month"),
        }
    }
}

/// A decoded cell of a profile row.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "type", content = "value", rename_all = "snake_case")
)]
pub enum CellValue {
    /// No data captured for this column.
    Null,
    /// Signed or unsigned integer that fits in `i64`.
    Integer(i64),
    /// Floating point value (also used for integers beyond `i64`).
    Float(f64),
    /// Text value.
    Text(String),
    /// Calendar timestamp.
    Timestamp(#[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))] OffsetDateTime),
    /// Bytes without a known interpretation.
    Raw(Vec<u8>),
}

impl CellValue {
    /// Numeric view of the cell, if it holds a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(i) => Some(*i as f64),
            CellValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// A decoded profile record.
///
/// Rows are only ever produced with a valid timestamp; records whose
/// timestamp cannot be decoded are dropped by the normalizer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProfileRow {
    /// Capture time of the record.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Column id (see [`CaptureObject::column_id`]) to decoded value.
    pub values: BTreeMap<String, CellValue>,
}

impl ProfileRow {
    /// Create a row with no values.
    #[must_use]
    pub fn new(timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with_value(mut self, column: impl Into<String>, value: CellValue) -> Self {
        self.values.insert(column.into(), value);
        self
    }

    /// Look up a column.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.values.get(column)
    }
}

/// Resume position of a (device, profile) synchronization.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProfileCursor {
    /// Device serial.
    pub device_id: String,
    /// Profile identifier.
    pub profile_id: ProfileId,
    /// Lower bound of the next read.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub last_timestamp: OffsetDateTime,
    /// Interval between meter-side samples.
    pub capture_period: CapturePeriod,
}

/// Result of persisting one batch of rows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SyncOutcome {
    /// Rows handed to the persistence layer.
    pub total_incoming: usize,
    /// Rows that were new.
    pub inserted: usize,
    /// Rows that already existed (same timestamp).
    pub duplicates: usize,
    /// Cursor value before this batch.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub previous_cursor: Option<OffsetDateTime>,
    /// Largest timestamp in the incoming batch.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub max_incoming: Option<OffsetDateTime>,
    /// Value the cursor should advance to.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub advance_to: Option<OffsetDateTime>,
    /// Whether `advance_to` moved past `previous_cursor`.
    pub advanced: bool,
}

impl SyncOutcome {
    /// Compute an outcome from the incoming timestamps and insert count.
    ///
    /// `advance_to` is the larger of the previous cursor and the newest
    /// incoming timestamp, so a cursor computed from it never moves back.
    #[must_use]
    pub fn compute(
        previous_cursor: Option<OffsetDateTime>,
        incoming: &[OffsetDateTime],
        inserted: usize,
    ) -> Self {
        let max_incoming = incoming.iter().copied().max();
        let advance_to = match (previous_cursor, max_incoming) {
            (Some(prev), Some(max)) => Some(prev.max(max)),
            (prev, max) => max.or(prev),
        };
        let advanced = match (previous_cursor, advance_to) {
            (Some(prev), Some(next)) => next > prev,
            (None, Some(_)) => true,
            _ => false,
        };
        Self {
            total_incoming: incoming.len(),
            inserted,
            duplicates: incoming.len().saturating_sub(inserted),
            previous_cursor,
            max_incoming,
            advance_to,
            advanced,
        }
    }
}
