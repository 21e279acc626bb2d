//! Acquisition core for smart meter head-ends.
//!
//! This crate keeps an application-layer session ("association") with each
//! meter, issues time-windowed reads of historical profile buffers, reassembles
//! multi-block replies, salvages partial data when a read fails, and
//! incrementally synchronizes new records into a store.
//!
//! # Features
//!
//! - **Request correlation**: one in-flight request per device, bounded waits
//!   with a late-listen window, stale replies dropped
//! - **Sessions**: lazy association, invalidation on the association-lost
//!   trailer, idle sweeping
//! - **Block assembly**: multi-block reads with partial-buffer salvage
//! - **Normalization**: uniform rows from any buffer shape a codec returns
//! - **Synchronization**: resumable, cursor-driven windowed reads
//! - **Simulation**: in-memory meters for tests and demos
//!
//! # Layers
//!
//! | Layer | Type | Role |
//! |-------|------|------|
//! | Correlation | [`CorrelationTracker`] | Matches inbound frames to pending requests |
//! | Sessions | [`SessionManager`] | Owns one association per device |
//! | Assembly | [`BlockAssembler`] | Follows block transfers, keeps partial buffers |
//! | Sync | [`ProfileSynchronizer`] | Runs cursor-driven cycles under a device lock |
//!
//! The protocol codec, transport, metadata, persistence, metrics and locking
//! are supplied through the port traits in [`traits`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use meterlink_core::mock::{MemoryPersistence, MockNetwork, StaticMetadata, interval_metadata};
//! use meterlink_core::{
//!     BlockAssembler, DeviceLocks, ProfileRegistry, ProfileSynchronizer, SessionConfig,
//!     SessionManager, SyncConfig, SyncMetrics, SyncPorts, SystemClock,
//! };
//! use meterlink_types::{ProfileId, obis};
//!
//! # async fn example() {
//! let network = MockNetwork::new();
//! network.add_meter("MTR-0001");
//!
//! let sessions = Arc::new(SessionManager::new(
//!     network.tracker(),
//!     network.clone(),
//!     SessionConfig::default(),
//! ));
//! let sync = ProfileSynchronizer::new(
//!     Arc::new(BlockAssembler::new(sessions)),
//!     SyncPorts {
//!         metadata: Arc::new(
//!             StaticMetadata::new()
//!                 .with_profile("load_profile_1", interval_metadata(obis::LOAD_PROFILE_1)),
//!         ),
//!         persistence: Arc::new(MemoryPersistence::new()),
//!         metrics: SyncMetrics::shared(),
//!         locks: Arc::new(DeviceLocks::new()),
//!         clock: Arc::new(SystemClock),
//!     },
//!     Arc::new(ProfileRegistry::default()),
//!     SyncConfig::default(),
//! );
//!
//! let report = sync.run("MTR-0001", &ProfileId::from("load_profile_1"), None).await;
//! println!("{:?}", report.outcome);
//! # }
//! ```

pub mod assembler;
pub mod correlation;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod mock;
pub mod normalize;
pub mod registry;
pub mod retry;
pub mod session;
pub mod sync;
pub mod traits;
pub mod util;

pub use assembler::BlockAssembler;
pub use correlation::{CorrelationId, CorrelationStats, CorrelationTracker, ExchangeTimings};
pub use error::{Error, ReadError, Result};
pub use guard::DeviceLocks;
pub use metrics::{OperationMetrics, SeriesSnapshot, SyncMetrics};
pub use normalize::{Normalized, Strategy as NormalizeStrategy, normalize, to_profile_rows};
pub use registry::{
    DailyProfile, IntervalProfile, MonthlyProfile, ProfileRegistry, ProfileStrategy,
    RegistryConfig, Window,
};
pub use retry::{RetryConfig, with_retry_if};
pub use session::{DeviceSession, SessionConfig, SessionManager, SessionState};
pub use sync::{CycleOutcome, CycleReport, ProfileSynchronizer, SyncConfig, SyncPorts};
pub use traits::{
    Clock, Codec, CodecFactory, ExclusiveGuard, FrameHandler, FrameTagger, LockPort,
    MetadataProvider, MetricsPort, PersistencePort, ProfileMetadata, Transport, with_exclusive,
};
pub use util::{FixedClock, SystemClock};

// Re-export from meterlink-types
pub use meterlink_types::{
    CaptureObject, CapturePeriod, CellValue, ObisCode, ProfileCursor, ProfileId, ProfileRow,
    ReplyState, SyncOutcome, Value,
};
