//! Timestamp decoding.
//!
//! Meters encode date-times as a fixed 12-byte octet string:
//!
//! | Offset | Size | Field | Not specified |
//! |--------|------|-------|---------------|
//! | 0 | 2 | year (big-endian) | `0xFFFF` |
//! | 2 | 1 | month, `0xFD`/`0xFE` = DST end/begin | `0xFF` |
//! | 3 | 1 | day of month, `0xFE` = last day, `0xFD` = second to last | `0xFF` |
//! | 4 | 1 | day of week (1 = Monday) | `0xFF` |
//! | 5 | 1 | hour | `0xFF` |
//! | 6 | 1 | minute | `0xFF` |
//! | 7 | 1 | second | `0xFF` |
//! | 8 | 1 | hundredths | `0xFF` |
//! | 9 | 2 | deviation, minutes from local time to UTC (signed, big-endian) | `0x8000` |
//! | 11 | 1 | clock status | `0xFF` |
//!
//! Year, month and day are mandatory for a profile timestamp. Unspecified
//! time-of-day fields read as zero, an unspecified deviation reads as UTC.
//! Day of week and clock status are ignored.

use bytes::Buf;
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::error::{ParseError, ParseResult};
use crate::value::Value;

/// Length of an encoded date-time.
pub const COSEM_DATETIME_LEN: usize = 12;

const NOT_SPECIFIED_U8: u8 = 0xFF;
const NOT_SPECIFIED_YEAR: u16 = 0xFFFF;
const NOT_SPECIFIED_DEVIATION: i16 = i16::MIN;
const LAST_DAY_OF_MONTH: u8 = 0xFE;
const SECOND_LAST_DAY_OF_MONTH: u8 = 0xFD;

/// Decode a 12-byte date-time.
///
/// # Errors
///
/// - [`ParseError::InsufficientBytes`] when fewer than 12 bytes are given
/// - [`ParseError::UnspecifiedField`] when year, month or day is not specified
/// - [`ParseError::InvalidValue`] when a field is out of range
///
/// # Examples
///
/// ```
/// use meterlink_types::timestamp::decode_cosem_datetime;
/// use time::macros::datetime;
///
/// let bytes = [0x07, 0xE8, 1, 1, 1, 0, 15, 0, 0xFF, 0x80, 0x00, 0x00];
/// assert_eq!(decode_cosem_datetime(&bytes).unwrap(), datetime!(2024-01-01 00:15 UTC));
/// ```
pub fn decode_cosem_datetime(data: &[u8]) -> ParseResult<OffsetDateTime> {
    if data.len() < COSEM_DATETIME_LEN {
        return Err(ParseError::InsufficientBytes {
            expected: COSEM_DATETIME_LEN,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let year = buf.get_u16();
    let month = buf.get_u8();
    let day = buf.get_u8();
    let _day_of_week = buf.get_u8();
    let hour = buf.get_u8();
    let minute = buf.get_u8();
    let second = buf.get_u8();
    let hundredths = buf.get_u8();
    let deviation = buf.get_i16();

    if year == NOT_SPECIFIED_YEAR {
        return Err(ParseError::UnspecifiedField("year"));
    }
    let month = match month {
        NOT_SPECIFIED_U8 => return Err(ParseError::UnspecifiedField("month")),
        m => Month::try_from(m)
            .map_err(|_| ParseError::InvalidValue(format!("month {:#04x}", m)))?,
    };
    let year = i32::from(year);
    let day = match day {
        NOT_SPECIFIED_U8 => return Err(ParseError::UnspecifiedField("day")),
        LAST_DAY_OF_MONTH => time::util::days_in_month(month, year),
        SECOND_LAST_DAY_OF_MONTH => time::util::days_in_month(month, year) - 1,
        d => d,
    };

    let date = Date::from_calendar_date(year, month, day)
        .map_err(|e| ParseError::InvalidValue(format!("date: {}", e)))?;
    let unspecified_as_zero = |v: u8| if v == NOT_SPECIFIED_U8 { 0 } else { v };
    let millis = match hundredths {
        NOT_SPECIFIED_U8 => 0,
        h => u16::from(h) * 10,
    };
    let time = Time::from_hms_milli(
        unspecified_as_zero(hour),
        unspecified_as_zero(minute),
        unspecified_as_zero(second),
        millis,
    )
    .map_err(|e| ParseError::InvalidValue(format!("time: {}", e)))?;

    let offset = if deviation == NOT_SPECIFIED_DEVIATION {
        UtcOffset::UTC
    } else {
        UtcOffset::from_whole_seconds(-i32::from(deviation) * 60)
            .map_err(|e| ParseError::InvalidValue(format!("deviation: {}", e)))?
    };

    Ok(PrimitiveDateTime::new(date, time)
        .assume_offset(offset)
        .to_offset(UtcOffset::UTC))
}

/// Encode a timestamp as a 12-byte date-time carrying the timestamp's own
/// offset as deviation.
#[must_use]
pub fn encode_cosem_datetime(t: OffsetDateTime) -> [u8; COSEM_DATETIME_LEN] {
    let year = (t.year().clamp(0, i32::from(u16::MAX - 1)) as u16).to_be_bytes();
    let deviation = (-(t.offset().whole_minutes())).to_be_bytes();
    [
        year[0],
        year[1],
        u8::from(t.month()),
        t.day(),
        t.weekday().number_from_monday(),
        t.hour(),
        t.minute(),
        t.second(),
        (t.millisecond() / 10) as u8,
        deviation[0],
        deviation[1],
        0x00,
    ]
}

/// Decode a timestamp from any of the shapes codecs produce for a time
/// column: an explicit date-time, a 12-byte octet string, RFC 3339 text, or
/// unix seconds.
pub fn timestamp_from_value(value: &Value) -> ParseResult<OffsetDateTime> {
    match value {
        Value::DateTime(bytes) => decode_cosem_datetime(bytes),
        Value::OctetString(bytes) if bytes.len() == COSEM_DATETIME_LEN => {
            decode_cosem_datetime(bytes)
        }
        Value::Text(s) => {
            OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
                .map_err(|e| ParseError::InvalidValue(format!("timestamp text '{}': {}", s, e)))
        }
        Value::Unsigned(u) => from_unix_seconds(i64::try_from(*u).unwrap_or(i64::MAX)),
        Value::Integer(i) => from_unix_seconds(*i),
        other => Err(ParseError::InvalidValue(format!(
            "not a timestamp: {:?}",
            other
        ))),
    }
}

fn from_unix_seconds(secs: i64) -> ParseResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| ParseError::InvalidValue(format!("unix timestamp {}: {}", secs, e)))
}

/// Add calendar months, clamping the day to the target month's length.
#[must_use]
pub fn add_months(t: OffsetDateTime, months: i64) -> OffsetDateTime {
    let total = i64::from(t.year()) * 12 + i64::from(u8::from(t.month())) - 1 + months;
    let year = total.div_euclid(12) as i32;
    let month_number = (total.rem_euclid(12) + 1) as u8;
    // month_number is always within 1..=12
    let month = Month::try_from(month_number).unwrap_or(Month::January);
    let day = t.day().min(time::util::days_in_month(month, year));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => t.replace_date(date),
        Err(_) => t,
    }
}

/// Midnight UTC of the day before `now`.
#[must_use]
pub fn start_of_yesterday(now: OffsetDateTime) -> OffsetDateTime {
    let now = now.to_offset(UtcOffset::UTC);
    (now - Duration::days(1)).replace_time(Time::MIDNIGHT)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Decoding arbitrary bytes never panics.
        #[test]
        fn decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..24)) {
            let _ = decode_cosem_datetime(&data);
        }

        /// Any instant within the encodable range survives encoding.
        #[test]
        fn encoded_instant_decodes_to_same_instant(
            secs in 0i64..4_102_444_800,
            centis in 0u16..100,
            offset_minutes in -720i32..=720,
        ) {
            let offset = UtcOffset::from_whole_seconds(offset_minutes * 60).unwrap();
            let t = (OffsetDateTime::from_unix_timestamp(secs).unwrap()
                + Duration::milliseconds(i64::from(centis) * 10))
                .to_offset(offset);
            prop_assert_eq!(decode_cosem_datetime(&encode_cosem_datetime(t)).unwrap(), t);
        }

        /// Month arithmetic is invertible on the first day of a month.
        #[test]
        fn add_months_inverts_on_first_of_month(
            year in 1990i32..2100,
            month in 1u8..=12,
            n in -36i64..36,
        ) {
            let date = Date::from_calendar_date(year, Month::try_from(month).unwrap(), 1).unwrap();
            let t = date.midnight().assume_utc();
            prop_assert_eq!(add_months(add_months(t, n), -n), t);
        }
    }
}
