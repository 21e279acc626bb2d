//! Cursor-driven profile synchronization.
//!
//! One call to [`ProfileSynchronizer::run`] is one synchronization cycle for a
//! (device, profile) pair. The cycle holds the device's exclusive lock for its
//! whole duration and walks forward from the stored cursor in windows until it
//! reaches the current time:
//!
//! ```text
//! ResolveCursor -> WindowRead -+-> rows ............ Persist&Advance -+
//!                     ^        +-> no rows ........ Advance ----------+
//!                     |        +-> error -> salvage Persist&Advance --+
//!                     |                 \-> nothing Break (stop)      |
//!                     +-----------------------------------------------+
//! ```
//!
//! The cursor is the lower bound of the next read. It is written after every
//! window and never moves back. A read error that salvages nothing stops the
//! cycle without touching the cursor, so the next trigger retries the same
//! window.
//!
//! A cycle never fails: errors and panics are caught at its boundary, logged,
//! reported to the [`MetricsPort`], and summarized in the returned
//! [`CycleReport`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use meterlink_types::timestamp::start_of_yesterday;
use meterlink_types::{CapturePeriod, ProfileCursor, ProfileId, ProfileRow};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::assembler::BlockAssembler;
use crate::error::{Error, ReadError, Result};
use crate::registry::{ProfileRegistry, ProfileStrategy, Window};
use crate::retry::{RetryConfig, with_retry_if};
use crate::traits::{
    Clock, LockPort, MetadataProvider, MetricsPort, PersistencePort, ProfileMetadata,
};

/// Failure reason recorded when a cycle panics.
pub const PANIC_REASON: &str = "panic";

/// Synchronization loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Capture periods per interval-profile window.
    pub batch_size: u32,
    /// Windows read by one cycle at most.
    pub max_windows_per_cycle: u32,
    /// Retries of a window read that lost its association.
    pub association_retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 96,
            max_windows_per_cycle: 500,
            association_retry: RetryConfig::for_association_loss(),
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    /// The cursor reached the current time.
    CaughtUp,
    /// A read failed and nothing was salvaged.
    Broke,
    /// A window did not move the cursor forward.
    Stalled,
    /// The per-cycle window limit was reached.
    WindowLimit,
    /// The capture period cannot advance a cursor.
    InvalidPeriod,
    /// An error or panic ended the cycle.
    Failed(String),
}

/// Summary of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Device serial.
    pub device_id: String,
    /// Profile id.
    pub profile_id: ProfileId,
    /// How the cycle ended.
    pub outcome: CycleOutcome,
    /// Windows read.
    pub windows: u32,
    /// Rows returned by complete reads.
    pub rows_read: usize,
    /// Rows salvaged from interrupted reads.
    pub recovered: usize,
    /// Rows the store had not seen before.
    pub inserted: usize,
    /// Cursor when the cycle started.
    #[serde(with = "time::serde::rfc3339::option")]
    pub cursor_before: Option<OffsetDateTime>,
    /// Cursor when the cycle ended.
    #[serde(with = "time::serde::rfc3339::option")]
    pub cursor_after: Option<OffsetDateTime>,
    /// Wall time of the cycle.
    pub elapsed: Duration,
}

impl CycleReport {
    fn new(device_id: &str, profile_id: &ProfileId) -> Self {
        Self {
            device_id: device_id.to_string(),
            profile_id: profile_id.clone(),
            outcome: CycleOutcome::CaughtUp,
            windows: 0,
            rows_read: 0,
            recovered: 0,
            inserted: 0,
            cursor_before: None,
            cursor_after: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Whether the cycle ended without an error.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CycleOutcome::CaughtUp | CycleOutcome::WindowLimit)
    }
}

/// Collaborators of a [`ProfileSynchronizer`].
#[derive(Clone)]
pub struct SyncPorts {
    /// Column layout per profile.
    pub metadata: Arc<dyn MetadataProvider>,
    /// Row and cursor storage.
    pub persistence: Arc<dyn PersistencePort>,
    /// Metrics sink.
    pub metrics: Arc<dyn MetricsPort>,
    /// Per-device mutual exclusion.
    pub locks: Arc<dyn LockPort>,
    /// Current time.
    pub clock: Arc<dyn Clock>,
}

/// Runs synchronization cycles.
pub struct ProfileSynchronizer {
    assembler: Arc<BlockAssembler>,
    ports: SyncPorts,
    registry: Arc<ProfileRegistry>,
    config: SyncConfig,
    cursors: DashMap<(String, ProfileId), ProfileCursor>,
}

impl ProfileSynchronizer {
    /// Create a synchronizer.
    pub fn new(
        assembler: Arc<BlockAssembler>,
        ports: SyncPorts,
        registry: Arc<ProfileRegistry>,
        config: SyncConfig,
    ) -> Self {
        Self {
            assembler,
            ports,
            registry,
            config,
            cursors: DashMap::new(),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The cached cursor of a series, if a cycle has resolved it.
    pub fn cached_cursor(&self, device_id: &str, profile_id: &ProfileId) -> Option<ProfileCursor> {
        self.cursors
            .get(&(device_id.to_string(), profile_id.clone()))
            .map(|c| c.clone())
    }

    /// Drop the cached cursor so the next cycle reloads it from the store.
    pub fn forget_cursor(&self, device_id: &str, profile_id: &ProfileId) {
        self.cursors
            .remove(&(device_id.to_string(), profile_id.clone()));
    }

    /// Run one synchronization cycle. Never fails and never panics.
    pub async fn run(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        model: Option<&str>,
    ) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(device_id, profile_id);

        let cycle = AssertUnwindSafe(self.run_locked(device_id, profile_id, model, &mut report))
            .catch_unwind()
            .await;
        match cycle {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Sync of {} on {} failed: {}", profile_id, device_id, e);
                self.ports
                    .metrics
                    .record_failure(device_id, profile_id, e.reason());
                report.outcome = CycleOutcome::Failed(e.to_string());
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Sync of {} on {} panicked: {}", profile_id, device_id, message);
                self.ports
                    .metrics
                    .record_failure(device_id, profile_id, PANIC_REASON);
                report.outcome = CycleOutcome::Failed(format!("panic: {}", message));
            }
        }

        report.elapsed = started.elapsed();
        info!(
            outcome = ?report.outcome,
            windows = report.windows,
            rows = report.rows_read,
            recovered = report.recovered,
            inserted = report.inserted,
            cursor = ?report.cursor_after.or(report.cursor_before),
            "Sync of {} on {} finished in {:?}",
            profile_id,
            device_id,
            report.elapsed
        );
        report
    }

    async fn run_locked(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        model: Option<&str>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let _exclusive = self.ports.locks.acquire(device_id).await?;
        let metadata = self
            .ports
            .metadata
            .resolve(device_id, profile_id, model)
            .await?;
        let (cursor, strategy) = match self
            .resolve_cursor(device_id, profile_id, model, &metadata)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) if e.is_link_failure() => {
                warn!(
                    error = %e,
                    "Cannot seed cursor of {} on {}; stopping until the next cycle",
                    profile_id,
                    device_id
                );
                self.ports
                    .metrics
                    .record_failure(device_id, profile_id, e.reason());
                report.outcome = CycleOutcome::Broke;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        report.cursor_before = Some(cursor.last_timestamp);

        let period = strategy.normalize_period(cursor.capture_period);
        if !period.is_positive() {
            warn!(
                %period,
                "Capture period of {} on {} cannot advance a cursor",
                profile_id,
                device_id
            );
            report.outcome = CycleOutcome::InvalidPeriod;
            return Ok(());
        }

        let mut from = cursor.last_timestamp;
        loop {
            if report.windows >= self.config.max_windows_per_cycle {
                debug!("Window limit reached for {} on {}", profile_id, device_id);
                report.outcome = CycleOutcome::WindowLimit;
                return Ok(());
            }
            let now = self.ports.clock.now();
            if from >= now {
                report.outcome = CycleOutcome::CaughtUp;
                return Ok(());
            }

            let end = strategy.window_end(from, period, self.config.batch_size);
            let window = Window::clamp(from, end, now);
            report.windows += 1;
            let window_started = Instant::now();
            debug!(
                from = %window.from,
                to = %window.to,
                strategy = strategy.name(),
                "Reading window of {} on {}",
                profile_id,
                device_id
            );

            let next = match self
                .read_window(device_id, profile_id, &metadata, &window)
                .await
            {
                Ok(rows) if rows.is_empty() => {
                    if window.clamped {
                        // The rest of this window lies in the future.
                        report.outcome = CycleOutcome::CaughtUp;
                        return Ok(());
                    }
                    strategy.next_after_empty(&window, period)
                }
                Ok(rows) => {
                    report.rows_read += rows.len();
                    self.persist(device_id, profile_id, &rows, period, window_started, report)
                        .await?
                        .map_or(window.to, |advance_to| {
                            strategy.next_after_batch(&window, advance_to, period)
                        })
                }
                Err(err) => {
                    let salvaged = self.recover(device_id, profile_id, err);
                    if salvaged.is_empty() {
                        warn!(
                            from = %window.from,
                            "Nothing salvaged for {} on {}; stopping until the next cycle",
                            profile_id,
                            device_id
                        );
                        let exhausted = Error::RecoveryExhausted {
                            device_id: device_id.to_string(),
                            profile_id: profile_id.to_string(),
                        };
                        self.ports
                            .metrics
                            .record_failure(device_id, profile_id, exhausted.reason());
                        report.outcome = CycleOutcome::Broke;
                        return Ok(());
                    }
                    info!(
                        rows = salvaged.len(),
                        "Recovered partial window of {} on {}",
                        profile_id,
                        device_id
                    );
                    self.ports
                        .metrics
                        .record_recovery(device_id, profile_id, salvaged.len());
                    report.recovered += salvaged.len();
                    self.persist(device_id, profile_id, &salvaged, period, window_started, report)
                        .await?
                        .map_or(window.to, |advance_to| {
                            strategy.next_after_batch(&window, advance_to, period)
                        })
                }
            };

            if next <= from {
                warn!(
                    %from,
                    %next,
                    "No forward progress for {} on {}",
                    profile_id,
                    device_id
                );
                report.outcome = CycleOutcome::Stalled;
                return Ok(());
            }
            self.store_cursor(device_id, profile_id, next, period).await?;
            report.cursor_after = Some(next);
            from = next;
        }
    }

    /// Cursor resolution: cache, store, then the device itself.
    ///
    /// A device that cannot be reached seeds nothing; the error is returned
    /// so the cursor is neither cached nor persisted.
    async fn resolve_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        model: Option<&str>,
        metadata: &ProfileMetadata,
    ) -> Result<(ProfileCursor, Arc<dyn ProfileStrategy>)> {
        let key = (device_id.to_string(), profile_id.clone());
        if let Some(cursor) = self.cursors.get(&key).map(|c| c.clone()) {
            let strategy = self
                .registry
                .resolve(model, profile_id, Some(cursor.capture_period));
            return Ok((cursor, strategy));
        }

        if let Some(cursor) = self
            .ports
            .persistence
            .load_cursor(device_id, profile_id)
            .await?
        {
            debug!(
                cursor = %cursor.last_timestamp,
                "Loaded cursor of {} on {}",
                profile_id,
                device_id
            );
            let strategy = self
                .registry
                .resolve(model, profile_id, Some(cursor.capture_period));
            self.cursors.insert(key, cursor.clone());
            return Ok((cursor, strategy));
        }

        let strategy = self.registry.resolve(model, profile_id, None);
        let capture_period = match self
            .assembler
            .read_capture_period(device_id, metadata)
            .await
        {
            Ok(raw) => strategy.period_from_device(raw),
            Err(e) if e.is_link_failure() => return Err(e),
            Err(e) => {
                debug!("Capture period of {} on {} unavailable: {}", profile_id, device_id, e);
                strategy.default_period()
            }
        };
        let last_timestamp = match self
            .assembler
            .read_first_entry(device_id, profile_id, metadata)
            .await
        {
            Ok(Some(first)) => first.timestamp,
            Ok(None) => start_of_yesterday(self.ports.clock.now()),
            Err(e) if e.is_link_failure() => return Err(e),
            Err(e) => {
                debug!("First entry of {} on {} unavailable: {}", profile_id, device_id, e);
                start_of_yesterday(self.ports.clock.now())
            }
        };

        info!(
            cursor = %last_timestamp,
            period = %capture_period,
            "Seeded cursor of {} on {}",
            profile_id,
            device_id
        );
        let cursor = ProfileCursor {
            device_id: device_id.to_string(),
            profile_id: profile_id.clone(),
            last_timestamp,
            capture_period,
        };
        self.store_cursor(device_id, profile_id, last_timestamp, capture_period)
            .await?;
        Ok((cursor, strategy))
    }

    /// Read one window, retrying once more when the association was lost.
    async fn read_window(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        metadata: &ProfileMetadata,
        window: &Window,
    ) -> std::result::Result<Vec<ProfileRow>, ReadError> {
        let assembler = self.assembler.as_ref();
        // A retry clears the partial buffer; keep what earlier attempts got.
        let earlier = Mutex::new(Vec::new());

        let result = with_retry_if(
            &self.config.association_retry,
            "profile read",
            |e: &ReadError| matches!(e.cause, Error::AssociationLost { .. }),
            || async {
                let attempt = assembler
                    .read_range(device_id, profile_id, metadata, window.from, window.to)
                    .await;
                if let Err(e) = &attempt
                    && !e.salvaged.is_empty()
                {
                    *earlier.lock().unwrap_or_else(PoisonError::into_inner) = e.salvaged.clone();
                }
                attempt
            },
        )
        .await;

        result.map_err(|mut e| {
            if e.salvaged.is_empty() {
                e.salvaged = earlier
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner);
            }
            e
        })
    }

    /// Recovery path after a failed read: drain the partial buffer.
    fn recover(&self, device_id: &str, profile_id: &ProfileId, err: ReadError) -> Vec<ProfileRow> {
        warn!("Read of {} on {} failed: {}", profile_id, device_id, err.cause);
        let drained = self.assembler.drain_partial(device_id, profile_id);
        if drained.is_empty() {
            err.salvaged
        } else {
            drained
        }
    }

    /// Persist rows and record the batch. Returns the store's advance-to
    /// timestamp.
    async fn persist(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        rows: &[ProfileRow],
        period: CapturePeriod,
        started: Instant,
        report: &mut CycleReport,
    ) -> Result<Option<OffsetDateTime>> {
        let outcome = self
            .ports
            .persistence
            .save_batch_and_advance_cursor(device_id, profile_id, rows, period)
            .await?;
        self.ports
            .metrics
            .record_batch(device_id, profile_id, rows.len(), started.elapsed());
        report.inserted += outcome.inserted;
        debug!(
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            advance_to = ?outcome.advance_to,
            "Persisted batch of {} on {}",
            profile_id,
            device_id
        );
        Ok(outcome.advance_to)
    }

    async fn store_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        timestamp: OffsetDateTime,
        capture_period: CapturePeriod,
    ) -> Result<()> {
        self.ports
            .persistence
            .upsert_cursor(device_id, profile_id, timestamp, capture_period)
            .await?;
        let key = (device_id.to_string(), profile_id.clone());
        let mut entry = self.cursors.entry(key).or_insert_with(|| ProfileCursor {
            device_id: device_id.to_string(),
            profile_id: profile_id.clone(),
            last_timestamp: timestamp,
            capture_period,
        });
        entry.last_timestamp = entry.last_timestamp.max(timestamp);
        entry.capture_period = capture_period;
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
