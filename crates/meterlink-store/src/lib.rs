//! SQLite persistence for smart meter profile data.
//!
//! This crate stores the profile records read from meters together with the
//! per-(device, profile) cursors that let a synchronizer resume where it
//! stopped.
//!
//! # Features
//!
//! - Duplicate-free row storage keyed by (device, profile, timestamp)
//! - Batch insert and cursor advance in one transaction
//! - Cursors that never move backwards
//! - Device registry with first/last seen times
//! - Query by device, profile and time range, with pagination
//!
//! # Example
//!
//! ```no_run
//! use meterlink_store::{RowQuery, Store};
//!
//! let store = Store::open_default()?;
//!
//! let query = RowQuery::new()
//!     .device("MTR-0001")
//!     .profile("load_profile_1")
//!     .limit(96);
//! for row in store.query_rows(&query)? {
//!     println!("{} {:?}", row.timestamp, row.values);
//! }
//! # Ok::<(), meterlink_store::Error>(())
//! ```

mod error;
mod models;
mod queries;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{StoredCursor, StoredDevice, StoredRow};
pub use queries::RowQuery;
pub use schema::SCHEMA_VERSION;
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/meterlink/data.db`
/// - macOS: `~/Library/Application Support/meterlink/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\meterlink\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("meterlink")
        .join("data.db")
}
