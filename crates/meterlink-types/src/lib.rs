//! Platform-agnostic types for smart meter profile acquisition.
//!
//! This crate provides the data model shared by the acquisition core
//! (meterlink-core), the store (meterlink-store) and the service.
//!
//! # Features
//!
//! - OBIS codes, capture objects and profile identifiers
//! - Tagged protocol values as produced by a codec
//! - Profile rows, cursors and batch outcomes
//! - Decoding of 12-byte meter date-times
//! - Error types for data parsing
//!
//! # Example
//!
//! ```
//! use meterlink_types::{CapturePeriod, ProfileRow, CellValue, obis};
//! use time::macros::datetime;
//!
//! let column = meterlink_types::CaptureObject::new(3, obis::ACTIVE_ENERGY_IMPORT, 2);
//! let row = ProfileRow::new(datetime!(2024-01-01 00:15 UTC))
//!     .with_value(column.column_id(), CellValue::Integer(1234));
//! assert_eq!(row.get("3/1-0:1.8.0.255/2"), Some(&CellValue::Integer(1234)));
//!
//! let next = CapturePeriod::default().add_to(row.timestamp, 1);
//! assert_eq!(next, datetime!(2024-01-01 00:30 UTC));
//! ```

pub mod error;
pub mod obis;
pub mod timestamp;
pub mod types;
pub mod value;

pub use error::{ParseError, ParseResult};
pub use types::{
    CaptureObject, CapturePeriod, CellValue, DEFAULT_CAPTURE_PERIOD_SECS, ObisCode, ProfileCursor,
    ProfileId, ProfileRow, SyncOutcome,
};
pub use value::{ReplyState, Value};
