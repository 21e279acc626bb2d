//! Tagged protocol values as produced by a codec.
//!
//! The codec decodes response frames into [`Value`] trees. Profile buffers
//! arrive as `Array` of `Structure` in the common case, but vendor devices also
//! emit flat scalar arrays, single rows, or raw octet strings that need a second
//! decode pass. Downstream code pattern-matches on the variant instead of
//! probing shapes at runtime.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::types::CellValue;

/// A decoded protocol value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "type", content = "value", rename_all = "snake_case")
)]
pub enum Value {
    /// `null-data`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer of any width.
    Integer(i64),
    /// Unsigned integer of any width.
    Unsigned(u64),
    /// Floating point of any width.
    Float(f64),
    /// Visible or UTF-8 string.
    Text(String),
    /// Octet string. May hold a 12-byte date-time or an undecoded buffer.
    OctetString(Vec<u8>),
    /// Explicit 12-byte date-time.
    DateTime([u8; 12]),
    /// Ordered fields of one record.
    Structure(Vec<Value>),
    /// Homogeneous sequence.
    Array(Vec<Value>),
}

impl Value {
    /// Whether this value is a compound (`Structure` or `Array`).
    #[must_use]
    pub fn is_compound(&self) -> bool {
        matches!(self, Value::Structure(_) | Value::Array(_))
    }

    /// Children of a compound value.
    #[must_use]
    pub fn children(&self) -> Option<&[Value]> {
        match self {
            Value::Structure(v) | Value::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Whether the value looks like a date-time marker.
    ///
    /// Used by the normalizer to find row boundaries in malformed streams.
    #[must_use]
    pub fn is_timestamp_like(&self) -> bool {
        match self {
            Value::DateTime(_) => true,
            Value::OctetString(b) => {
                b.len() == crate::timestamp::COSEM_DATETIME_LEN
                    && crate::timestamp::decode_cosem_datetime(b).is_ok()
            }
            _ => false,
        }
    }

    /// Unsigned integer view, accepting non-negative signed values.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Unsigned(u) => Some(*u),
            Value::Integer(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    /// Convert a scalar into a row cell.
    ///
    /// Date-time encodings become [`CellValue::Timestamp`] when they decode,
    /// otherwise the raw bytes are kept. Compound values have no cell form and
    /// are serialized to their debug representation as text.
    #[must_use]
    pub fn to_cell(&self) -> CellValue {
        match self {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Integer(i64::from(*b)),
            Value::Integer(i) => CellValue::Integer(*i),
            Value::Unsigned(u) => match i64::try_from(*u) {
                Ok(i) => CellValue::Integer(i),
                Err(_) => CellValue::Float(*u as f64),
            },
            Value::Float(f) => CellValue::Float(*f),
            Value::Text(s) => CellValue::Text(s.clone()),
            Value::DateTime(b) => match crate::timestamp::decode_cosem_datetime(b) {
                Ok(t) => CellValue::Timestamp(t),
                Err(_) => CellValue::Raw(b.to_vec()),
            },
            Value::OctetString(b) => {
                if b.len() == crate::timestamp::COSEM_DATETIME_LEN
                    && let Ok(t) = crate::timestamp::decode_cosem_datetime(b)
                {
                    return CellValue::Timestamp(t);
                }
                CellValue::Raw(b.clone())
            }
            Value::Structure(_) | Value::Array(_) => CellValue::Text(format!("{:?}", self)),
        }
    }
}

/// Decode result of one response frame.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReplyState {
    /// The logical response is complete (no block transfer pending).
    pub complete: bool,
    /// More blocks follow; a continuation request is required.
    pub more: bool,
    /// Block number to acknowledge in the continuation request.
    pub block_number: u32,
    /// Data carried by this frame, if any.
    pub value: Option<Value>,
}

impl ReplyState {
    /// A single-frame, complete reply.
    #[must_use]
    pub fn complete(value: Value) -> Self {
        Self {
            complete: true,
            more: false,
            block_number: 0,
            value: Some(value),
        }
    }

    /// One block of a multi-block reply.
    #[must_use]
    pub fn block(block_number: u32, more: bool, value: Option<Value>) -> Self {
        Self {
            complete: !more,
            more,
            block_number,
            value,
        }
    }
}
