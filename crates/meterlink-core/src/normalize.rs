//! Normalization of decoded profile buffers into rows.
//!
//! Devices disagree about how a profile buffer is shaped once decoded. The
//! [`normalize`] function turns any of the shapes below into a list of rows,
//! trying them in this order:
//!
//! | Shape | Strategy |
//! |-------|----------|
//! | `Array` of multi-field `Structure`s | [`Strategy::Structured`] |
//! | flat scalars, length a multiple of the column count | [`Strategy::Chunked`] |
//! | `Array` of compound values of any width | [`Strategy::RowLike`] |
//! | `OctetString` holding an encoded buffer | [`Strategy::Redecoded`] |
//! | flat stream with date-time markers | [`Strategy::TimestampSplit`] |
//! | anything else | [`Strategy::SingleRow`] |
//!
//! The last two are anomalies and are logged at debug level.
//! [`to_profile_rows`] then decodes the first column of each row into a
//! timestamp and drops rows where that fails.

use meterlink_types::timestamp::timestamp_from_value;
use meterlink_types::{CaptureObject, ProfileRow, Value};
use tracing::debug;

use crate::error::Result;

/// How a buffer was turned into rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Nothing to normalize.
    Empty,
    /// Each element was a structured row.
    Structured,
    /// A flat list was chunked by the column count.
    Chunked,
    /// Each compound element was taken as a row.
    RowLike,
    /// Raw bytes were decoded again, then normalized.
    Redecoded,
    /// A flat stream was split at date-time markers.
    TimestampSplit,
    /// The whole input became one row.
    SingleRow,
}

impl Strategy {
    /// Whether the rows were derived heuristically.
    #[must_use]
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Strategy::TimestampSplit | Strategy::SingleRow)
    }
}

/// Normalized buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Rows of column values.
    pub rows: Vec<Vec<Value>>,
    /// Strategy that produced them.
    pub strategy: Strategy,
}

impl Normalized {
    fn new(rows: Vec<Vec<Value>>, strategy: Strategy) -> Self {
        Self { rows, strategy }
    }

    fn empty() -> Self {
        Self::new(Vec::new(), Strategy::Empty)
    }
}

/// Turn a decoded buffer into rows of `expected_columns` values.
///
/// `redecode` is used at most once, for a buffer delivered as raw bytes.
///
/// # Examples
///
/// ```
/// use meterlink_core::normalize::{normalize, Strategy};
/// use meterlink_types::Value;
///
/// let flat = Value::Array((0..6).map(Value::Unsigned).collect());
/// let normalized = normalize(&flat, 3, None);
/// assert_eq!(normalized.strategy, Strategy::Chunked);
/// assert_eq!(normalized.rows.len(), 2);
/// ```
pub fn normalize(
    value: &Value,
    expected_columns: usize,
    redecode: Option<&dyn Fn(&[u8]) -> Result<Value>>,
) -> Normalized {
    match value {
        Value::Null => Normalized::empty(),
        Value::OctetString(bytes) if !value.is_timestamp_like() => {
            match redecode.map(|decode| decode(bytes)) {
                Some(Ok(inner)) => {
                    let mut normalized = normalize(&inner, expected_columns, None);
                    if normalized.strategy != Strategy::Empty {
                        normalized.strategy = Strategy::Redecoded;
                    }
                    normalized
                }
                Some(Err(e)) => {
                    debug!("Raw buffer could not be decoded again: {}", e);
                    single_row(vec![value.clone()])
                }
                None => single_row(vec![value.clone()]),
            }
        }
        Value::Array(items) | Value::Structure(items) => {
            normalize_list(value, items, expected_columns)
        }
        scalar => single_row(vec![scalar.clone()]),
    }
}

fn normalize_list(whole: &Value, items: &[Value], expected_columns: usize) -> Normalized {
    if items.is_empty() {
        return Normalized::empty();
    }

    let compound = items.iter().filter(|v| v.is_compound()).count();

    // 1. Structured multi-field rows.
    if compound == items.len()
        && items
            .iter()
            .all(|v| matches!(v, Value::Structure(fields) if fields.len() > 1))
    {
        let rows = items
            .iter()
            .filter_map(|v| v.children().map(<[Value]>::to_vec))
            .collect();
        return Normalized::new(rows, Strategy::Structured);
    }

    // 2. Flat scalars that divide evenly into rows.
    if compound == 0 && expected_columns > 0 && items.len() % expected_columns == 0 {
        let rows = items
            .chunks(expected_columns)
            .map(<[Value]>::to_vec)
            .collect();
        return Normalized::new(rows, Strategy::Chunked);
    }

    // 3. Row-like elements of any width.
    if compound == items.len() {
        let rows = items
            .iter()
            .filter_map(|v| v.children().map(<[Value]>::to_vec))
            .collect();
        return Normalized::new(rows, Strategy::RowLike);
    }

    // 4. Split a flat stream at date-time markers.
    let leaves = flatten(items);
    if leaves.first().is_some_and(Value::is_timestamp_like) {
        let mut rows: Vec<Vec<Value>> = Vec::new();
        for leaf in leaves {
            if leaf.is_timestamp_like() || rows.is_empty() {
                rows.push(Vec::with_capacity(expected_columns));
            }
            if let Some(row) = rows.last_mut() {
                row.push(leaf);
            }
        }
        debug!(
            rows = rows.len(),
            expected_columns,
            "Buffer split at timestamp markers"
        );
        return Normalized::new(rows, Strategy::TimestampSplit);
    }

    debug!(
        items = items.len(),
        expected_columns,
        "Buffer shape not recognized, keeping it as one row: {:?}",
        whole
    );
    Normalized::new(vec![leaves], Strategy::SingleRow)
}

fn single_row(row: Vec<Value>) -> Normalized {
    debug!("Scalar buffer kept as one row: {:?}", row);
    Normalized::new(vec![row], Strategy::SingleRow)
}

fn flatten(items: &[Value]) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item.children() {
            Some(children) => out.extend(flatten(children)),
            None => out.push(item.clone()),
        }
    }
    out
}

/// Convert normalized rows into profile rows.
///
/// The first column is the capture time. Remaining columns are keyed by the
/// matching capture object's column id, or `col<index>` when the row is wider
/// than the capture-object list.
pub fn to_profile_rows(
    rows: Vec<Vec<Value>>,
    capture_objects: &[CaptureObject],
) -> Vec<ProfileRow> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(first) = row.first() else {
            continue;
        };
        let timestamp = match timestamp_from_value(first) {
            Ok(t) => t,
            Err(e) => {
                debug!("Dropping row without a decodable timestamp: {}", e);
                continue;
            }
        };
        let mut profile_row = ProfileRow::new(timestamp);
        for (index, value) in row.iter().enumerate().skip(1) {
            let column = capture_objects
                .get(index)
                .map_or_else(|| format!("col{}", index), CaptureObject::column_id);
            profile_row.values.insert(column, value.to_cell());
        }
        out.push(profile_row);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterlink_types::timestamp::encode_cosem_datetime;
    use meterlink_types::{CellValue, obis};
    use time::macros::datetime;

    fn ts(minute: u8) -> Value {
        Value::DateTime(encode_cosem_datetime(
            datetime!(2024-01-01 00:00 UTC) + time::Duration::minutes(i64::from(minute)),
        ))
    }

    fn columns() -> Vec<CaptureObject> {
        crate::mock::interval_metadata(obis::LOAD_PROFILE_1).capture_objects
    }

    #[test]
    fn test_structured_rows() {
        let buffer = Value::Array(vec![
            Value::Structure(vec![ts(0), Value::Unsigned(1), Value::Unsigned(2)]),
            Value::Structure(vec![ts(15), Value::Unsigned(3), Value::Unsigned(4)]),
        ]);
        let normalized = normalize(&buffer, 3, None);
        assert_eq!(normalized.strategy, Strategy::Structured);
        assert_eq!(normalized.rows.len(), 2);
        assert_eq!(normalized.rows[1][1], Value::Unsigned(3));
    }

    #[test]
    fn test_flat_stream_is_chunked() {
        let buffer = Value::Array(vec![
            ts(0),
            Value::Unsigned(1),
            Value::Unsigned(2),
            ts(15),
            Value::Unsigned(3),
            Value::Unsigned(4),
        ]);
        let normalized = normalize(&buffer, 3, None);
        assert_eq!(normalized.strategy, Strategy::Chunked);
        assert_eq!(normalized.rows, vec![
            vec![ts(0), Value::Unsigned(1), Value::Unsigned(2)],
            vec![ts(15), Value::Unsigned(3), Value::Unsigned(4)],
        ]);
    }

    #[test]
    fn test_single_field_structures_are_row_like() {
        let buffer = Value::Array(vec![
            Value::Structure(vec![ts(0)]),
            Value::Array(vec![ts(15), Value::Unsigned(9)]),
        ]);
        let normalized = normalize(&buffer, 3, None);
        assert_eq!(normalized.strategy, Strategy::RowLike);
        assert_eq!(normalized.rows.len(), 2);
    }

    #[test]
    fn test_raw_buffer_is_decoded_once() {
        let inner = Value::Array(vec![Value::Structure(vec![ts(0), Value::Unsigned(1)])]);
        let raw = Value::OctetString(serde_json::to_vec(&inner).unwrap());
        let decode = |bytes: &[u8]| -> Result<Value> {
            serde_json::from_slice(bytes).map_err(|e| crate::Error::Codec(e.to_string()))
        };
        let normalized = normalize(&raw, 2, Some(&decode));
        assert_eq!(normalized.strategy, Strategy::Redecoded);
        assert_eq!(normalized.rows.len(), 1);

        // Without a decoder the bytes stay a single (undecodable) row.
        assert_eq!(normalize(&raw, 2, None).strategy, Strategy::SingleRow);
    }

    #[test]
    fn test_ragged_stream_splits_on_timestamps() {
        // 5 items with 3 expected columns: the second record lost a value.
        let buffer = Value::Array(vec![
            ts(0),
            Value::Unsigned(1),
            Value::Unsigned(2),
            ts(15),
            Value::Unsigned(3),
        ]);
        let normalized = normalize(&buffer, 3, None);
        assert_eq!(normalized.strategy, Strategy::TimestampSplit);
        assert!(normalized.strategy.is_anomaly());
        assert_eq!(normalized.rows.len(), 2);
        assert_eq!(normalized.rows[1].len(), 2);
    }

    #[test]
    fn test_unrecognized_shape_is_one_row() {
        let buffer = Value::Array(vec![Value::Unsigned(1), Value::Unsigned(2)]);
        let normalized = normalize(&buffer, 3, None);
        assert_eq!(normalized.strategy, Strategy::SingleRow);
        assert_eq!(normalized.rows, vec![vec![Value::Unsigned(1), Value::Unsigned(2)]]);
    }

    #[test]
    fn test_empty_and_null() {
        assert_eq!(normalize(&Value::Array(vec![]), 3, None).strategy, Strategy::Empty);
        assert!(normalize(&Value::Null, 3, None).rows.is_empty());
    }

    #[test]
    fn test_rows_without_timestamp_are_dropped() {
        let rows = vec![
            vec![ts(0), Value::Unsigned(10), Value::Unsigned(1)],
            vec![Value::Null, Value::Unsigned(11), Value::Unsigned(1)],
            vec![ts(30), Value::Unsigned(12)],
        ];
        let profile_rows = to_profile_rows(rows, &columns());
        assert_eq!(profile_rows.len(), 2);
        assert_eq!(profile_rows[0].timestamp, datetime!(2024-01-01 00:00 UTC));
        assert_eq!(
            profile_rows[0].get("3/1-0:1.8.0.255/2"),
            Some(&CellValue::Integer(10))
        );
        assert_eq!(profile_rows[1].values.len(), 1);
    }

    #[test]
    fn test_extra_columns_get_positional_ids() {
        let rows = vec![vec![ts(0), Value::Unsigned(1), Value::Unsigned(2), Value::Bool(true)]];
        let profile_rows = to_profile_rows(rows, &columns());
        assert_eq!(profile_rows[0].get("col3"), Some(&CellValue::Integer(1)));
    }
}
