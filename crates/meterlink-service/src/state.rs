//! Application state: the acquisition stack wired to the store and the
//! configuration.
//!
//! | Component | Built from |
//! |-----------|------------|
//! | [`SessionManager`] | `[session]` timings, the transport's tracker and codec factory |
//! | [`ProfileSynchronizer`] | `[sync]` limits, the registry, store-backed ports |
//! | [`Scheduler`] | one job per `[[devices.profiles]]` entry |

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use meterlink_core::{
    BlockAssembler, Clock, CodecFactory, CorrelationTracker, DeviceLocks, ProfileSynchronizer,
    SessionManager, SyncMetrics, SyncPorts,
};
use meterlink_store::Store;

use crate::config::{Config, ConfigError};
use crate::ports::{ConfigMetadata, StorePersistence};
use crate::scheduler::{Scheduler, SyncJob};

/// Shared application state.
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,
    /// Associations with the meters.
    pub sessions: Arc<SessionManager>,
    /// Cycle runner.
    pub sync: Arc<ProfileSynchronizer>,
    /// Store behind the sync path.
    pub persistence: StorePersistence,
    /// Per-series counters.
    pub metrics: Arc<SyncMetrics>,
}

impl AppState {
    /// Wire the stack for `config` on top of a transport.
    ///
    /// Fails when a configured profile has unparsable metadata.
    pub fn new(
        config: Config,
        store: Store,
        tracker: Arc<CorrelationTracker>,
        codecs: Arc<dyn CodecFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ConfigError> {
        let metadata = ConfigMetadata::from_config(&config)?;
        let persistence = StorePersistence::new(store);
        let metrics = SyncMetrics::shared();

        let sessions = Arc::new(SessionManager::new(tracker, codecs, config.session_config()));
        let sync = Arc::new(ProfileSynchronizer::new(
            Arc::new(BlockAssembler::new(Arc::clone(&sessions))),
            SyncPorts {
                metadata: Arc::new(metadata),
                persistence: Arc::new(persistence.clone()),
                metrics: metrics.clone(),
                locks: Arc::new(DeviceLocks::new()),
                clock,
            },
            Arc::new(config.registry()),
            config.sync_config(),
        ));

        Ok(Arc::new(Self {
            config,
            sessions,
            sync,
            persistence,
            metrics,
        }))
    }

    /// A scheduler over every configured profile.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(Arc::clone(&self.sync), SyncJob::from_config(&self.config))
    }

    /// Start dropping idle associations, if `[session].idle_timeout_secs`
    /// is set.
    pub fn spawn_idle_sweeper(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let max_idle = self.config.session.idle_timeout()?;
        let every = (max_idle / 4).max(Duration::from_secs(1));
        info!("Dropping sessions idle for more than {}s", max_idle.as_secs());
        Some(self.sessions.spawn_idle_sweeper(every, max_idle, cancel))
    }
}
