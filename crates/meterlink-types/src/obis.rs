//! Well-known OBIS codes and interface class constants.
//!
//! This module contains the object identifiers the acquisition core needs to
//! address profiles and their attributes on a meter.

use crate::types::ObisCode;

// --- Interface classes ---

/// Data interface class.
pub const DATA_CLASS_ID: u16 = 1;

/// Register interface class.
pub const REGISTER_CLASS_ID: u16 = 3;

/// Extended register interface class.
pub const EXTENDED_REGISTER_CLASS_ID: u16 = 4;

/// Profile generic interface class.
pub const PROFILE_GENERIC_CLASS_ID: u16 = 7;

/// Clock interface class.
pub const CLOCK_CLASS_ID: u16 = 8;

// --- Profile generic attributes ---

/// Profile buffer.
pub const ATTR_BUFFER: i8 = 2;

/// Capture objects list.
pub const ATTR_CAPTURE_OBJECTS: i8 = 3;

/// Capture period in seconds (0 = asynchronous capture).
pub const ATTR_CAPTURE_PERIOD: i8 = 4;

/// Number of entries currently held in the buffer.
pub const ATTR_ENTRIES_IN_USE: i8 = 7;

// --- Objects ---

/// Device clock.
pub const CLOCK: ObisCode = ObisCode::new(0, 0, 1, 0, 0, 255);

/// Load profile 1 (interval data).
pub const LOAD_PROFILE_1: ObisCode = ObisCode::new(1, 0, 99, 1, 0, 255);

/// Load profile 2 (interval data, usually daily values).
pub const LOAD_PROFILE_2: ObisCode = ObisCode::new(1, 0, 99, 2, 0, 255);

/// Daily billing profile.
pub const DAILY_BILLING_PROFILE: ObisCode = ObisCode::new(0, 0, 98, 2, 0, 255);

/// Monthly billing profile.
pub const MONTHLY_BILLING_PROFILE: ObisCode = ObisCode::new(0, 0, 98, 1, 0, 255);

/// Standard event log.
pub const STANDARD_EVENT_LOG: ObisCode = ObisCode::new(0, 0, 99, 98, 0, 255);

/// Active energy import (+A), total.
pub const ACTIVE_ENERGY_IMPORT: ObisCode = ObisCode::new(1, 0, 1, 8, 0, 255);

/// Active energy export (-A), total.
pub const ACTIVE_ENERGY_EXPORT: ObisCode = ObisCode::new(1, 0, 2, 8, 0, 255);

// --- Association ---

/// Reply trailer signalling that the application association was lost.
pub const ASSOCIATION_LOST_TRAILER: [u8; 3] = [0xD8, 0x01, 0x01];
