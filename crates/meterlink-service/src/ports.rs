//! Port implementations backed by the SQLite store and the configuration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use meterlink_core::{Error, MetadataProvider, PersistencePort, ProfileMetadata, Result};
use meterlink_store::Store;
use meterlink_types::{CapturePeriod, ProfileCursor, ProfileId, ProfileRow, SyncOutcome};

use crate::config::{Config, ConfigError, ValidationError};

/// [`PersistencePort`] over a [`Store`].
#[derive(Debug, Clone)]
pub struct StorePersistence {
    store: Arc<Mutex<Store>>,
}

impl StorePersistence {
    /// Wrap a store.
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// The wrapped store, for queries outside the sync path.
    pub fn store(&self) -> &Arc<Mutex<Store>> {
        &self.store
    }
}

fn persistence_error(e: meterlink_store::Error) -> Error {
    Error::Persistence(e.to_string())
}

#[async_trait]
impl PersistencePort for StorePersistence {
    async fn save_batch_and_advance_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        rows: &[ProfileRow],
        capture_period: CapturePeriod,
    ) -> Result<SyncOutcome> {
        let store = self.store.lock().await;
        store
            .save_batch_and_advance_cursor(device_id, profile_id, rows, capture_period)
            .map_err(persistence_error)
    }

    async fn load_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
    ) -> Result<Option<ProfileCursor>> {
        let store = self.store.lock().await;
        store
            .load_cursor(device_id, profile_id)
            .map_err(persistence_error)
    }

    async fn upsert_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        timestamp: OffsetDateTime,
        capture_period: CapturePeriod,
    ) -> Result<()> {
        let store = self.store.lock().await;
        store
            .upsert_cursor(device_id, profile_id, timestamp, capture_period)
            .map_err(persistence_error)
    }
}

/// [`MetadataProvider`] answering from the `[[devices.profiles]]` tables.
#[derive(Debug, Default)]
pub struct ConfigMetadata {
    profiles: HashMap<(String, ProfileId), ProfileMetadata>,
}

impl ConfigMetadata {
    /// Parse the metadata of every configured profile.
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        let mut profiles = HashMap::new();
        let mut errors = Vec::new();
        for (i, device) in config.devices.iter().enumerate() {
            for (j, profile) in device.profiles.iter().enumerate() {
                match profile.metadata() {
                    Ok(metadata) => {
                        profiles.insert(
                            (device.serial.clone(), ProfileId::from(profile.id.as_str())),
                            metadata,
                        );
                    }
                    Err(e) => errors.push(ValidationError {
                        field: format!("devices[{}].profiles[{}]", i, j),
                        message: e.to_string(),
                    }),
                }
            }
        }
        if errors.is_empty() {
            Ok(Self { profiles })
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Number of known (device, profile) pairs.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether no profile is configured.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl MetadataProvider for ConfigMetadata {
    async fn resolve(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        _model: Option<&str>,
    ) -> Result<ProfileMetadata> {
        self.profiles
            .get(&(device_id.to_string(), profile_id.clone()))
            .cloned()
            .ok_or_else(|| {
                Error::metadata(device_id, profile_id.as_str(), "profile is not configured")
            })
    }
}
