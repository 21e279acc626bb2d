//! Service configuration.
//!
//! Loaded from TOML. Every section has defaults, so an empty file is a valid
//! (if idle) configuration.
//!
//! ```toml
//! [storage]
//! path = "/var/lib/meterlink/data.db"
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
//! capture_objects = ["8/0-0:1.0.0.255/2", "3/1-0:1.8.0.255/2", "3/1-0:2.8.0.255/2"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meterlink_core::{
    DailyProfile, ExchangeTimings, IntervalProfile, MonthlyProfile, ProfileMetadata,
    ProfileRegistry, ProfileStrategy, RegistryConfig, SessionConfig, SyncConfig,
};
use meterlink_types::{CaptureObject, ObisCode, ParseError, ProfileId};

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage settings.
    pub storage: StorageConfig,
    /// Session and exchange timing settings.
    pub session: SessionSection,
    /// Synchronization settings.
    pub sync: SyncSection,
    /// Meters to synchronize.
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path, or defaults if it does not
    /// exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, collecting every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use meterlink_service::Config;
    ///
    /// let config = Config::default();
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.storage.validate());
        errors.extend(self.session.validate());
        errors.extend(self.sync.validate());

        let mut seen_serials = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if !seen_serials.insert(device.serial.to_lowercase()) {
                errors.push(ValidationError {
                    field: format!("{}.serial", prefix),
                    message: format!("duplicate device serial '{}'", device.serial),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Session manager settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timings: self.session.timings(),
            ..SessionConfig::default()
        }
    }

    /// Synchronizer settings.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_size: self.sync.batch_size,
            max_windows_per_cycle: self.sync.max_windows_per_cycle,
            ..SyncConfig::default()
        }
    }

    /// Profile registry with the configured calendar prefixes and any
    /// per-profile strategy overrides.
    ///
    /// An override on a device with a model applies to that model only.
    pub fn registry(&self) -> ProfileRegistry {
        let mut registry = ProfileRegistry::new(RegistryConfig {
            daily_prefixes: self.sync.daily_prefixes.clone(),
            monthly_prefixes: self.sync.monthly_prefixes.clone(),
        });
        for device in &self.devices {
            for profile in &device.profiles {
                let Some(kind) = profile.strategy else {
                    continue;
                };
                let id = ProfileId::from(profile.id.as_str());
                registry = match &device.model {
                    Some(model) => registry.with_model_profile(model, id, kind.strategy()),
                    None => registry.with_profile(id, kind.strategy()),
                };
            }
        }
        registry
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: meterlink_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Nominal response deadline in milliseconds.
    pub initial_timeout_ms: u64,
    /// Extra listening time after the deadline, in milliseconds.
    pub late_listen_ms: u64,
    /// Sessions idle for longer than this are released (0 = never).
    pub idle_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        let timings = ExchangeTimings::default();
        Self {
            initial_timeout_ms: timings.initial.as_millis() as u64,
            late_listen_ms: timings.late_listen.as_millis() as u64,
            idle_timeout_secs: 600,
        }
    }
}

impl SessionSection {
    /// Exchange wait windows.
    pub fn timings(&self) -> ExchangeTimings {
        ExchangeTimings::new(
            Duration::from_millis(self.initial_timeout_ms),
            Duration::from_millis(self.late_listen_ms),
        )
    }

    /// Idle timeout, if sweeping is enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Validate session configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.initial_timeout_ms == 0 {
            errors.push(ValidationError {
                field: "session.initial_timeout_ms".to_string(),
                message: "response deadline must be greater than 0".to_string(),
            });
        }

        if self.initial_timeout_ms.saturating_add(self.late_listen_ms) > MAX_EXCHANGE_MS {
            errors.push(ValidationError {
                field: "session.late_listen_ms".to_string(),
                message: format!(
                    "total wait of {} ms exceeds the maximum of {} ms",
                    self.initial_timeout_ms.saturating_add(self.late_listen_ms),
                    MAX_EXCHANGE_MS
                ),
            });
        }

        errors
    }
}

/// Longest total wait for one exchange (5 minutes).
pub const MAX_EXCHANGE_MS: u64 = 300_000;

/// Synchronization configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Seconds between cycles of one (device, profile).
    pub interval_secs: u64,
    /// Capture periods per interval-profile window.
    pub batch_size: u32,
    /// Windows read by one cycle at most.
    pub max_windows_per_cycle: u32,
    /// Profile id prefixes that mark daily profiles.
    pub daily_prefixes: Vec<String>,
    /// Profile id prefixes that mark monthly profiles.
    pub monthly_prefixes: Vec<String>,
}

impl Default for SyncSection {
    fn default() -> Self {
        let sync = SyncConfig::default();
        let registry = RegistryConfig::default();
        Self {
            interval_secs: 900,
            batch_size: sync.batch_size,
            max_windows_per_cycle: sync.max_windows_per_cycle,
            daily_prefixes: registry.daily_prefixes,
            monthly_prefixes: registry.monthly_prefixes,
        }
    }
}

/// Minimum sync interval in seconds.
pub const MIN_SYNC_INTERVAL: u64 = 10;
/// Maximum sync interval in seconds (1 day).
pub const MAX_SYNC_INTERVAL: u64 = 86_400;
/// Largest accepted batch size.
pub const MAX_BATCH_SIZE: u32 = 10_000;

fn validate_interval(field: String, secs: u64) -> Option<ValidationError> {
    if secs < MIN_SYNC_INTERVAL {
        Some(ValidationError {
            field,
            message: format!(
                "interval {} is too short (minimum {} seconds)",
                secs, MIN_SYNC_INTERVAL
            ),
        })
    } else if secs > MAX_SYNC_INTERVAL {
        Some(ValidationError {
            field,
            message: format!(
                "interval {} is too long (maximum {} seconds / 1 day)",
                secs, MAX_SYNC_INTERVAL
            ),
        })
    } else {
        None
    }
}

impl SyncSection {
    /// Validate sync configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        errors.extend(validate_interval(
            "sync.interval_secs".to_string(),
            self.interval_secs,
        ));

        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            errors.push(ValidationError {
                field: "sync.batch_size".to_string(),
                message: format!(
                    "batch size {} must be between 1 and {}",
                    self.batch_size, MAX_BATCH_SIZE
                ),
            });
        }

        if self.max_windows_per_cycle == 0 {
            errors.push(ValidationError {
                field: "sync.max_windows_per_cycle".to_string(),
                message: "window limit must be greater than 0".to_string(),
            });
        }

        for (field, prefixes) in [
            ("daily_prefixes", &self.daily_prefixes),
            ("monthly_prefixes", &self.monthly_prefixes),
        ] {
            for (i, prefix) in prefixes.iter().enumerate() {
                if prefix.trim().is_empty() {
                    errors.push(ValidationError {
                        field: format!("sync.{}[{}]", field, i),
                        message: "prefix cannot be empty".to_string(),
                    });
                }
            }
        }

        errors
    }
}

/// A meter to synchronize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device serial.
    pub serial: String,
    /// Meter model, used to pick per-model profile strategies.
    #[serde(default)]
    pub model: Option<String>,
    /// Overrides `sync.interval_secs` for this device.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Profiles read from this meter.
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

impl DeviceConfig {
    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.serial.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.serial", prefix),
                message: "device serial cannot be empty".to_string(),
            });
        }

        if let Some(model) = &self.model
            && model.is_empty()
        {
            errors.push(ValidationError {
                field: format!("{}.model", prefix),
                message: "model cannot be empty string (omit it instead)".to_string(),
            });
        }

        if let Some(secs) = self.interval_secs {
            errors.extend(validate_interval(format!("{}.interval_secs", prefix), secs));
        }

        if self.profiles.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.profiles", prefix),
                message: "at least one profile is required".to_string(),
            });
        }

        let mut seen_ids = HashSet::new();
        for (i, profile) in self.profiles.iter().enumerate() {
            let profile_prefix = format!("{}.profiles[{}]", prefix, i);
            errors.extend(profile.validate(&profile_prefix));
            if !seen_ids.insert(profile.id.to_lowercase()) {
                errors.push(ValidationError {
                    field: format!("{}.id", profile_prefix),
                    message: format!("duplicate profile id '{}'", profile.id),
                });
            }
        }

        errors
    }
}

/// Strategy override for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Fixed-length capture periods.
    Interval,
    /// One record per day.
    Daily,
    /// One record per month.
    Monthly,
}

impl StrategyKind {
    fn strategy(self) -> Arc<dyn ProfileStrategy> {
        match self {
            StrategyKind::Interval => Arc::new(IntervalProfile),
            StrategyKind::Daily => Arc::new(DailyProfile),
            StrategyKind::Monthly => Arc::new(MonthlyProfile),
        }
    }
}

/// A profile on a meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Profile identifier, also the key of stored rows.
    pub id: String,
    /// Logical name of the profile object (e.g. `1-0:99.1.0.255`).
    pub logical_name: String,
    /// Captured columns in buffer order, as `class/obis/attribute`. The
    /// first one must be the clock.
    pub capture_objects: Vec<String>,
    /// Overrides the device and global sync interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Forces a strategy instead of deriving it from the id.
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
    /// Column id to destination name.
    #[serde(default)]
    pub column_mapping: BTreeMap<String, String>,
    /// Column id to scaler.
    #[serde(default)]
    pub scalers: BTreeMap<String, f64>,
}

impl ProfileConfig {
    /// Build the metadata the synchronizer reads this profile with.
    pub fn metadata(&self) -> Result<ProfileMetadata, ParseError> {
        let logical_name: ObisCode = self.logical_name.parse()?;
        let capture_objects = self
            .capture_objects
            .iter()
            .map(|c| c.parse::<CaptureObject>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProfileMetadata {
            logical_name,
            capture_objects,
            column_mapping: self.column_mapping.clone(),
            scalers: self.scalers.clone(),
        })
    }

    /// Validate profile configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.id", prefix),
                message: "profile id cannot be empty".to_string(),
            });
        }

        if let Err(e) = self.logical_name.parse::<ObisCode>() {
            errors.push(ValidationError {
                field: format!("{}.logical_name", prefix),
                message: e.to_string(),
            });
        }

        if self.capture_objects.is_empty() {
            errors.push(ValidationError {
                field: format!("{}.capture_objects", prefix),
                message: "at least the clock column is required".to_string(),
            });
        }
        for (i, raw) in self.capture_objects.iter().enumerate() {
            let field = format!("{}.capture_objects[{}]", prefix, i);
            match raw.parse::<CaptureObject>() {
                Ok(object) if i == 0 && !object.is_clock() => errors.push(ValidationError {
                    field,
                    message: format!("first capture object '{}' must be the clock", raw),
                }),
                Ok(_) => {}
                Err(e) => errors.push(ValidationError {
                    field,
                    message: e.to_string(),
                }),
            }
        }

        if let Some(secs) = self.interval_secs {
            errors.extend(validate_interval(format!("{}.interval_secs", prefix), secs));
        }

        for (column, scaler) in &self.scalers {
            if !scaler.is_finite() || *scaler == 0.0 {
                errors.push(ValidationError {
                    field: format!("{}.scalers.{}", prefix, column),
                    message: format!("scaler {} must be finite and non-zero", scaler),
                });
            }
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `sync.batch_size` or `devices[0].profiles[1].id`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("meterlink")
        .join("service.toml")
}
