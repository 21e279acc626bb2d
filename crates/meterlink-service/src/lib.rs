//! Scheduled profile synchronization for smart meter head-ends.
//!
//! This crate provides a service that:
//! - Reads the meters and profiles to synchronize from a TOML file
//! - Runs a sync cycle per (device, profile) on its own interval
//! - Stores rows and cursors in the local SQLite database
//! - Keeps per-job statistics and per-series metrics
//! - Drops idle meter associations
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/meterlink/service.toml`:
//!
//! ```toml
//! [storage]
//! path = "~/.local/share/meterlink/data.db"
//!
//! [session]
//! initial_timeout_ms = 10000
//! late_listen_ms = 20000
//! idle_timeout_secs = 600
//!
//! [sync]
//! interval_secs = 900
//! batch_size = 96
//!
//! [[devices]]
//! serial = "MTR-0001"
//! model = "AM550"
//!
//! [[devices.profiles]]
//! id = "load_profile_1"
//! logical_name = "1-0:99.1.0.255"
//! capture_objects = ["8/0-0:1.0.0.255/2", "3/1-0:1.8.0.255/2"]
//!
//! [[devices.profiles]]
//! id = "daily_billing"
//! logical_name = "0-0:98.2.0.255"
//! capture_objects = ["8/0-0:1.0.0.255/2", "3/1-0:1.8.0.255/2"]
//! interval_secs = 3600
//! ```
//!
//! The transport is supplied by the embedding head-end. The binary ships
//! with a simulated meter network built from the same configuration (see
//! [`simulate`]).

pub mod config;
pub mod ports;
pub mod scheduler;
pub mod simulate;
pub mod state;

pub use config::{
    Config, ConfigError, DeviceConfig, ProfileConfig, SessionSection, StorageConfig,
    StrategyKind, SyncSection, ValidationError,
};
pub use ports::{ConfigMetadata, StorePersistence};
pub use scheduler::{JobStats, Scheduler, SyncJob};
pub use simulate::{SimulatedProfile, Simulation, SimulationOptions};
pub use state::AppState;
