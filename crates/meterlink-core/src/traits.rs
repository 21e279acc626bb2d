//! Port traits for the collaborators the core consumes.
//!
//! The core never builds protocol bytes, talks to sockets, or writes to a
//! database itself. Every such concern sits behind one of these traits:
//!
//! | Port | Role |
//! |------|------|
//! | [`CodecFactory`] / [`Codec`] | Build request frames, decode replies |
//! | [`FrameTagger`] | Optional request/response tag matching |
//! | [`Transport`] | Write frames to a device |
//! | [`FrameHandler`] | Receives inbound frames (implemented by the core) |
//! | [`MetadataProvider`] | Capture-object layout per profile |
//! | [`PersistencePort`] | Rows and cursors |
//! | [`MetricsPort`] | Batch, recovery and failure counters |
//! | [`LockPort`] | Per-device mutual exclusion |
//! | [`Clock`] | Current time |
//!
//! Implementations used by tests and the simulation harness live in
//! [`crate::mock`], [`crate::guard`], [`crate::metrics`] and [`crate::util`].

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;

use meterlink_types::{
    CaptureObject, CapturePeriod, ObisCode, ProfileCursor, ProfileId, ProfileRow, ReplyState,
    SyncOutcome, Value,
};

use crate::error::Result;

/// Per-device protocol codec.
///
/// A codec instance carries the association state of one device (invoke ids,
/// negotiated block sizes), so the session manager creates one per session
/// through a [`CodecFactory`] and drops it when the session ends.
pub trait Codec: Send {
    /// Build the association (AARQ) request.
    fn build_association_request(&mut self) -> Result<Bytes>;

    /// Parse the association reply. An error means the association was not
    /// accepted.
    fn parse_association_reply(&mut self, reply: &[u8]) -> Result<()>;

    /// Build the association release request.
    fn build_release_request(&mut self) -> Result<Bytes>;

    /// Build a ranged buffer read with inclusive `from`/`to` bounds,
    /// restricted to `capture_objects`.
    fn build_ranged_read_request(
        &mut self,
        profile: &ObisCode,
        capture_objects: &[CaptureObject],
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Bytes>;

    /// Build an entry-range buffer read (1-based, inclusive).
    fn build_entry_read_request(
        &mut self,
        profile: &ObisCode,
        from_entry: u32,
        to_entry: u32,
    ) -> Result<Bytes>;

    /// Build a plain attribute read.
    fn build_attribute_read_request(
        &mut self,
        class_id: u16,
        logical_name: &ObisCode,
        attribute_index: i8,
    ) -> Result<Bytes>;

    /// Build the request for the next block of a multi-block reply.
    fn build_continuation_request(&mut self, state: &ReplyState) -> Result<Bytes>;

    /// Decode one reply frame.
    fn decode(&mut self, reply: &[u8]) -> Result<ReplyState>;

    /// Decode a raw data buffer into a value tree.
    ///
    /// Used when a reply carries an undecoded octet string in place of the
    /// profile buffer.
    fn decode_data(&self, raw: &[u8]) -> Result<Value>;
}

/// Creates a fresh [`Codec`] for each new session.
pub trait CodecFactory: Send + Sync {
    /// Create a codec for `device_id`.
    fn create(&self, device_id: &str) -> Result<Box<dyn Codec>>;
}

/// Extracts correlation tags from frames.
///
/// When installed on the tracker, an inbound frame whose tag differs from the
/// tag of the pending request is treated as a stale reply and dropped.
pub trait FrameTagger: Send + Sync {
    /// Tag carried by an outgoing request.
    fn request_tag(&self, request: &[u8]) -> Option<u32>;

    /// Tag carried by an inbound response.
    fn response_tag(&self, response: &[u8]) -> Option<u32>;
}

/// Duplex byte channel to devices.
///
/// Inbound frames are not returned by [`Transport::send`]; the transport
/// delivers them asynchronously to a [`FrameHandler`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write a frame to the device.
    async fn send(&self, device_id: &str, frame: Bytes) -> Result<()>;

    /// Whether a channel to the device is currently open.
    fn is_active(&self, device_id: &str) -> bool;
}

/// Receiver for inbound frames.
pub trait FrameHandler: Send + Sync {
    /// Called by the transport for every frame received from `device_id`.
    fn on_frame(&self, device_id: &str, frame: Bytes);
}

/// Column layout of a profile on a given device.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileMetadata {
    /// Logical name of the profile object on the meter.
    pub logical_name: ObisCode,
    /// Captured columns, in buffer order. The first column is the timestamp.
    pub capture_objects: Vec<CaptureObject>,
    /// Column id to destination column name.
    pub column_mapping: BTreeMap<String, String>,
    /// Column id to scaler (applied downstream, not by the core).
    pub scalers: BTreeMap<String, f64>,
}

impl ProfileMetadata {
    /// Metadata with no mapping or scalers.
    #[must_use]
    pub fn new(logical_name: ObisCode, capture_objects: Vec<CaptureObject>) -> Self {
        Self {
            logical_name,
            capture_objects,
            column_mapping: BTreeMap::new(),
            scalers: BTreeMap::new(),
        }
    }

    /// Number of columns each buffer row is expected to have.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.capture_objects.len()
    }
}

/// Supplies profile metadata.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Resolve the column layout of `profile_id` on `device_id`.
    async fn resolve(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        model: Option<&str>,
    ) -> Result<ProfileMetadata>;
}

/// Row and cursor persistence.
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Insert the rows that are not yet stored (duplicate detection by
    /// timestamp) and move the stored cursor to the resulting `advance_to`.
    async fn save_batch_and_advance_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        rows: &[ProfileRow],
        capture_period: CapturePeriod,
    ) -> Result<SyncOutcome>;

    /// Load the stored cursor.
    async fn load_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
    ) -> Result<Option<ProfileCursor>>;

    /// Store a cursor value. Implementations must not move a stored cursor
    /// backwards.
    async fn upsert_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        timestamp: OffsetDateTime,
        capture_period: CapturePeriod,
    ) -> Result<()>;
}

/// Sink for synchronization metrics.
pub trait MetricsPort: Send + Sync {
    /// A batch of rows was persisted.
    fn record_batch(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        count: usize,
        elapsed: Duration,
    );

    /// Rows were salvaged from a partial buffer after a read error.
    fn record_recovery(&self, device_id: &str, profile_id: &ProfileId, count: usize);

    /// A cycle failed or broke off.
    fn record_failure(&self, device_id: &str, profile_id: &ProfileId, reason: &str);
}

/// Held while a device is exclusively locked. Dropping releases the lock.
pub struct ExclusiveGuard {
    _inner: Box<dyn std::any::Any + Send + Sync>,
}

impl ExclusiveGuard {
    /// Wrap any guard value.
    pub fn new(inner: impl Send + Sync + 'static) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for ExclusiveGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveGuard").finish_non_exhaustive()
    }
}

/// Per-device mutual exclusion.
#[async_trait]
pub trait LockPort: Send + Sync {
    /// Wait until `device_id` is free and lock it.
    async fn acquire(&self, device_id: &str) -> Result<ExclusiveGuard>;
}

/// Run `f` while holding the exclusive lock for `device_id`.
///
/// The lock is released when `f` completes, whether it succeeds or fails, and
/// `f`'s result is returned unchanged.
pub async fn with_exclusive<L, F, Fut, T>(lock: &L, device_id: &str, f: F) -> Result<T>
where
    L: LockPort + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let _guard = lock.acquire(device_id).await?;
    f().await
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now(&self) -> OffsetDateTime;
}
