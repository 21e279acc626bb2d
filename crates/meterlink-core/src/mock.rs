//! Simulated meters for testing.
//!
//! This module provides an in-memory meter network that can be used for unit
//! and integration testing without a real head-end transport or protocol
//! codec.
//!
//! [`MockNetwork`] implements both [`Transport`] and [`CodecFactory`]. Frames
//! are JSON documents (see [`MockRequest`] and [`MockResponse`]), so tests can
//! read them in logs. Each [`MockMeter`] holds profile buffers and answers
//! association, attribute, entry-range and time-range reads, splitting large
//! buffers into blocks.
//!
//! # Features
//!
//! - **Block transfer**: configurable rows per block
//! - **Reply shapes**: structured rows, flat scalar streams, or raw octet
//!   strings that need a second decode pass
//! - **Failure injection**: silent blocks, reply delays, association loss,
//!   association rejection
//! - **Invoke ids**: [`MockTagger`] lets the tracker reject stale replies
//!
//! [`StaticMetadata`] and [`MemoryPersistence`] complete the set of ports
//! needed to run a full synchronization cycle in memory.
//!
//! # Example
//!
//! ```
//! use meterlink_core::mock::MockNetwork;
//! use meterlink_types::obis;
//! use time::macros::datetime;
//!
//! let network = MockNetwork::new();
//! let meter = network.add_meter("MTR-0001");
//! meter.fill_interval_profile(obis::LOAD_PROFILE_1, datetime!(2024-01-01 00:00 UTC), 8, 900);
//! meter.set_rows_per_block(3);
//! assert_eq!(meter.row_count(obis::LOAD_PROFILE_1), 8);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use meterlink_types::obis::{self, ASSOCIATION_LOST_TRAILER};
use meterlink_types::timestamp::encode_cosem_datetime;
use meterlink_types::{
    CaptureObject, CapturePeriod, ObisCode, ProfileCursor, ProfileId, ProfileRow, ReplyState,
    SyncOutcome, Value,
};

use crate::correlation::CorrelationTracker;
use crate::error::{Error, Result};
use crate::traits::{
    Codec, CodecFactory, FrameHandler, FrameTagger, MetadataProvider, PersistencePort,
    ProfileMetadata, Transport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Request frame understood by [`MockMeter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MockRequest {
    /// Open an association.
    Associate { invoke_id: u32 },
    /// Close the association.
    Release { invoke_id: u32 },
    /// Buffer read by capture time (inclusive bounds, unix seconds).
    ReadRange {
        invoke_id: u32,
        profile: ObisCode,
        columns: usize,
        from: i64,
        to: i64,
    },
    /// Buffer read by entry index (1-based, inclusive).
    ReadEntries {
        invoke_id: u32,
        profile: ObisCode,
        from_entry: u32,
        to_entry: u32,
    },
    /// Plain attribute read.
    ReadAttribute {
        invoke_id: u32,
        class_id: u16,
        logical_name: ObisCode,
        attribute_index: i8,
    },
    /// Acknowledge `block_number` and ask for the next block.
    NextBlock { invoke_id: u32, block_number: u32 },
}

impl MockRequest {
    fn invoke_id(&self) -> u32 {
        match self {
            MockRequest::Associate { invoke_id }
            | MockRequest::Release { invoke_id }
            | MockRequest::ReadRange { invoke_id, .. }
            | MockRequest::ReadEntries { invoke_id, .. }
            | MockRequest::ReadAttribute { invoke_id, .. }
            | MockRequest::NextBlock { invoke_id, .. } => *invoke_id,
        }
    }
}

/// Response frame produced by [`MockMeter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MockResponse {
    /// Association accepted.
    Accepted { invoke_id: u32 },
    /// Association refused.
    Rejected { invoke_id: u32, reason: String },
    /// Association released.
    Released { invoke_id: u32 },
    /// Data block.
    Data {
        invoke_id: u32,
        block_number: u32,
        more: bool,
        value: Option<Value>,
    },
    /// Request refused.
    Failure { invoke_id: u32, message: String },
}

/// Shape in which a meter returns profile buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyShape {
    /// `Array` of `Structure` rows.
    #[default]
    Structured,
    /// `Array` of scalars, row after row.
    Flat,
    /// `OctetString` holding the encoded structured array.
    Raw,
}

#[derive(Debug, Clone)]
struct MockProfile {
    period_secs: u64,
    rows: Vec<(OffsetDateTime, Vec<Value>)>,
}

#[derive(Debug)]
struct Transfer {
    blocks: Vec<Value>,
    next: usize,
}

/// One simulated meter.
pub struct MockMeter {
    device_id: String,
    profiles: Mutex<HashMap<ObisCode, MockProfile>>,
    transfer: Mutex<Option<Transfer>>,
    range_reads: Mutex<Vec<(OffsetDateTime, OffsetDateTime)>>,
    shape: Mutex<ReplyShape>,
    rows_per_block: AtomicUsize,
    silent_block: AtomicU32,
    reply_delay_ms: AtomicU64,
    online: AtomicBool,
    associated: AtomicBool,
    reject_associations: AtomicBool,
    /// Data replies left before the association is dropped (-1 = never).
    lose_after: AtomicI64,
    associations: AtomicU32,
    releases: AtomicU32,
    requests: AtomicU32,
}

impl std::fmt::Debug for MockMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMeter")
            .field("device_id", &self.device_id)
            .field("associated", &self.associated.load(Ordering::Relaxed))
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockMeter {
    /// Create a meter with no profiles.
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            profiles: Mutex::new(HashMap::new()),
            transfer: Mutex::new(None),
            range_reads: Mutex::new(Vec::new()),
            shape: Mutex::new(ReplyShape::default()),
            rows_per_block: AtomicUsize::new(0),
            silent_block: AtomicU32::new(0),
            reply_delay_ms: AtomicU64::new(0),
            online: AtomicBool::new(true),
            associated: AtomicBool::new(false),
            reject_associations: AtomicBool::new(false),
            lose_after: AtomicI64::new(-1),
            associations: AtomicU32::new(0),
            releases: AtomicU32::new(0),
            requests: AtomicU32::new(0),
        }
    }

    /// Device serial.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    // --- Profile data ---

    /// Declare a profile with the given capture period.
    pub fn add_profile(&self, profile: ObisCode, period_secs: u64) {
        lock(&self.profiles).entry(profile).or_insert(MockProfile {
            period_secs,
            rows: Vec::new(),
        });
    }

    /// Append a record. `values` excludes the timestamp column.
    pub fn push_row(&self, profile: ObisCode, timestamp: OffsetDateTime, values: Vec<Value>) {
        let mut profiles = lock(&self.profiles);
        let entry = profiles.entry(profile).or_insert(MockProfile {
            period_secs: 0,
            rows: Vec::new(),
        });
        entry.rows.push((timestamp, values));
        entry.rows.sort_by_key(|(t, _)| *t);
    }

    /// Fill an interval profile with `count` records starting at `start`,
    /// each carrying a rising import register and a small export register.
    pub fn fill_interval_profile(
        &self,
        profile: ObisCode,
        start: OffsetDateTime,
        count: usize,
        period_secs: u64,
    ) {
        self.add_profile(profile, period_secs);
        let mut profiles = lock(&self.profiles);
        if let Some(entry) = profiles.get_mut(&profile) {
            entry.period_secs = period_secs;
            for i in 0..count {
                let t = start + Duration::from_secs(period_secs * i as u64);
                entry.rows.push((
                    t,
                    vec![
                        Value::Unsigned(10_000 + 25 * i as u64),
                        Value::Unsigned(2 * i as u64),
                    ],
                ));
            }
            entry.rows.sort_by_key(|(t, _)| *t);
        }
    }

    /// Records currently held in a profile.
    pub fn row_count(&self, profile: ObisCode) -> usize {
        lock(&self.profiles)
            .get(&profile)
            .map_or(0, |p| p.rows.len())
    }

    // --- Behaviour ---

    /// Split buffers into blocks of `rows` records (0 = one block).
    pub fn set_rows_per_block(&self, rows: usize) {
        self.rows_per_block.store(rows, Ordering::Relaxed);
    }

    /// Shape of returned buffers.
    pub fn set_reply_shape(&self, shape: ReplyShape) {
        *lock(&self.shape) = shape;
    }

    /// Never answer the request for block `n` (1-based, 0 = answer all).
    pub fn set_silent_block(&self, n: u32) {
        self.silent_block.store(n, Ordering::Relaxed);
    }

    /// Delay every reply.
    pub fn set_reply_delay(&self, delay: Duration) {
        self.reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Whether the meter reports an active channel.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Refuse association requests.
    pub fn reject_associations(&self, reject: bool) {
        self.reject_associations.store(reject, Ordering::Relaxed);
    }

    /// Answer `n` more data requests, then reply with the association-lost
    /// trailer.
    pub fn lose_association_after(&self, n: u32) {
        self.lose_after.store(i64::from(n), Ordering::Relaxed);
    }

    // --- Observations ---

    /// Accepted associations so far.
    pub fn associations(&self) -> u32 {
        self.associations.load(Ordering::Relaxed)
    }

    /// Release requests received.
    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Requests received.
    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Time-range reads received, in order.
    pub fn range_reads(&self) -> Vec<(OffsetDateTime, OffsetDateTime)> {
        lock(&self.range_reads).clone()
    }

    fn reply_delay(&self) -> Duration {
        Duration::from_millis(self.reply_delay_ms.load(Ordering::Relaxed))
    }

    /// Answer one request. `None` means the meter stays silent.
    fn handle(&self, request: MockRequest) -> Option<Bytes> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let invoke_id = request.invoke_id();

        let response = match request {
            MockRequest::Associate { .. } => {
                if self.reject_associations.load(Ordering::Relaxed) {
                    MockResponse::Rejected {
                        invoke_id,
                        reason: "authentication failure".to_string(),
                    }
                } else {
                    self.associated.store(true, Ordering::Relaxed);
                    self.associations.fetch_add(1, Ordering::Relaxed);
                    MockResponse::Accepted { invoke_id }
                }
            }
            MockRequest::Release { .. } => {
                self.associated.store(false, Ordering::Relaxed);
                self.releases.fetch_add(1, Ordering::Relaxed);
                MockResponse::Released { invoke_id }
            }
            data_request => {
                if self.association_dropped() {
                    return Some(Bytes::from_static(&ASSOCIATION_LOST_TRAILER));
                }
                self.handle_data(invoke_id, data_request)?
            }
        };

        match serde_json::to_vec(&response) {
            Ok(frame) => Some(Bytes::from(frame)),
            Err(e) => {
                debug!("Mock meter {} failed to encode reply: {}", self.device_id, e);
                None
            }
        }
    }

    fn association_dropped(&self) -> bool {
        if !self.associated.load(Ordering::Relaxed) {
            return true;
        }
        match self.lose_after.load(Ordering::Relaxed) {
            0 => {
                self.lose_after.store(-1, Ordering::Relaxed);
                self.associated.store(false, Ordering::Relaxed);
                true
            }
            n if n > 0 => {
                self.lose_after.store(n - 1, Ordering::Relaxed);
                false
            }
            _ => false,
        }
    }

    fn handle_data(&self, invoke_id: u32, request: MockRequest) -> Option<MockResponse> {
        match request {
            MockRequest::ReadRange {
                profile,
                columns,
                from,
                to,
                ..
            } => {
                let from = OffsetDateTime::from_unix_timestamp(from).ok()?;
                let to = OffsetDateTime::from_unix_timestamp(to).ok()?;
                lock(&self.range_reads).push((from, to));
                let rows = self.select_rows(profile, columns, |t, _| t >= from && t <= to);
                self.start_transfer(invoke_id, rows)
            }
            MockRequest::ReadEntries {
                profile,
                from_entry,
                to_entry,
                ..
            } => {
                let first = from_entry.max(1) as usize;
                let last = to_entry as usize;
                let rows =
                    self.select_rows(profile, usize::MAX, |_, i| i + 1 >= first && i < last);
                self.start_transfer(invoke_id, rows)
            }
            MockRequest::ReadAttribute {
                class_id,
                logical_name,
                attribute_index,
                ..
            } => {
                let value = self.read_attribute(class_id, logical_name, attribute_index);
                Some(MockResponse::Data {
                    invoke_id,
                    block_number: 0,
                    more: false,
                    value: Some(value),
                })
            }
            MockRequest::NextBlock { block_number, .. } => {
                self.next_block(invoke_id, block_number)
            }
            MockRequest::Associate { .. } | MockRequest::Release { .. } => None,
        }
    }

    fn read_attribute(&self, class_id: u16, logical_name: ObisCode, attribute: i8) -> Value {
        let profiles = lock(&self.profiles);
        if class_id == obis::PROFILE_GENERIC_CLASS_ID
            && let Some(profile) = profiles.get(&logical_name)
        {
            return match attribute {
                obis::ATTR_CAPTURE_PERIOD => Value::Unsigned(profile.period_secs),
                obis::ATTR_ENTRIES_IN_USE => Value::Unsigned(profile.rows.len() as u64),
                _ => Value::Null,
            };
        }
        if class_id == obis::CLOCK_CLASS_ID && logical_name == obis::CLOCK && attribute == 2 {
            let latest = profiles
                .values()
                .filter_map(|p| p.rows.last().map(|(t, _)| *t))
                .max()
                .unwrap_or(OffsetDateTime::UNIX_EPOCH);
            return Value::DateTime(encode_cosem_datetime(latest));
        }
        Value::Null
    }

    fn select_rows(
        &self,
        profile: ObisCode,
        columns: usize,
        keep: impl Fn(OffsetDateTime, usize) -> bool,
    ) -> Vec<Vec<Value>> {
        let profiles = lock(&self.profiles);
        let Some(profile) = profiles.get(&profile) else {
            return Vec::new();
        };
        profile
            .rows
            .iter()
            .enumerate()
            .filter(|(i, (t, _))| keep(*t, *i))
            .map(|(_, (t, values))| {
                let mut row = Vec::with_capacity(values.len() + 1);
                row.push(Value::DateTime(encode_cosem_datetime(*t)));
                row.extend(values.iter().cloned());
                row.truncate(columns.max(1));
                row
            })
            .collect()
    }

    fn shape_block(&self, rows: Vec<Vec<Value>>) -> Value {
        match *lock(&self.shape) {
            ReplyShape::Structured => {
                Value::Array(rows.into_iter().map(Value::Structure).collect())
            }
            ReplyShape::Flat => Value::Array(rows.into_iter().flatten().collect()),
            ReplyShape::Raw => {
                let structured =
                    Value::Array(rows.into_iter().map(Value::Structure).collect());
                Value::OctetString(serde_json::to_vec(&structured).unwrap_or_default())
            }
        }
    }

    fn start_transfer(&self, invoke_id: u32, rows: Vec<Vec<Value>>) -> Option<MockResponse> {
        let per_block = match self.rows_per_block.load(Ordering::Relaxed) {
            0 => rows.len().max(1),
            n => n,
        };
        let mut blocks: Vec<Value> = rows
            .chunks(per_block)
            .map(|chunk| self.shape_block(chunk.to_vec()))
            .collect();
        if blocks.is_empty() {
            blocks.push(Value::Array(Vec::new()));
        }
        *lock(&self.transfer) = Some(Transfer { blocks, next: 0 });
        self.next_block(invoke_id, 0)
    }

    fn next_block(&self, invoke_id: u32, acknowledged: u32) -> Option<MockResponse> {
        let mut transfer = lock(&self.transfer);
        let Some(state) = transfer.as_mut() else {
            return Some(MockResponse::Failure {
                invoke_id,
                message: "no block transfer in progress".to_string(),
            });
        };
        let block_number = acknowledged + 1;
        if self.silent_block.load(Ordering::Relaxed) == block_number {
            debug!("Mock meter {} withholding block {}", self.device_id, block_number);
            return None;
        }
        let value = state.blocks.get(state.next).cloned();
        state.next += 1;
        let more = state.next < state.blocks.len();
        if !more {
            *transfer = None;
        }
        Some(MockResponse::Data {
            invoke_id,
            block_number,
            more,
            value,
        })
    }
}

/// A set of simulated meters reachable through one transport.
pub struct MockNetwork {
    meters: DashMap<String, Arc<MockMeter>>,
    handler: Mutex<Option<Weak<dyn FrameHandler>>>,
}

impl MockNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            meters: DashMap::new(),
            handler: Mutex::new(None),
        })
    }

    /// Add a meter (or return the existing one).
    pub fn add_meter(&self, device_id: &str) -> Arc<MockMeter> {
        Arc::clone(
            self.meters
                .entry(device_id.to_string())
                .or_insert_with(|| Arc::new(MockMeter::new(device_id)))
                .value(),
        )
    }

    /// Look up a meter.
    pub fn meter(&self, device_id: &str) -> Option<Arc<MockMeter>> {
        self.meters.get(device_id).map(|m| Arc::clone(m.value()))
    }

    /// Route inbound frames to `handler`.
    pub fn attach(&self, handler: Weak<dyn FrameHandler>) {
        *lock(&self.handler) = Some(handler);
    }

    /// Create a correlation tracker wired to this network, with invoke-id
    /// tagging enabled.
    pub fn tracker(self: &Arc<Self>) -> Arc<CorrelationTracker> {
        let transport: Arc<dyn Transport> = Arc::clone(self) as Arc<dyn Transport>;
        let tracker =
            Arc::new(CorrelationTracker::new(transport).with_tagger(Arc::new(MockTagger)));
        let handler: Arc<dyn FrameHandler> = Arc::clone(&tracker) as Arc<dyn FrameHandler>;
        self.attach(Arc::downgrade(&handler));
        tracker
    }

    fn deliver(&self, device_id: &str, frame: Bytes, delay: Duration) {
        let Some(handler) = lock(&self.handler).clone() else {
            debug!("Mock network has no frame handler; dropping reply");
            return;
        };
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(handler) = handler.upgrade() {
                handler.on_frame(&device_id, frame);
            }
        });
    }
}

#[async_trait]
impl Transport for MockNetwork {
    async fn send(&self, device_id: &str, frame: Bytes) -> Result<()> {
        let meter = self
            .meter(device_id)
            .filter(|m| m.online.load(Ordering::Relaxed))
            .ok_or_else(|| Error::NotConnected(device_id.to_string()))?;
        let request: MockRequest = serde_json::from_slice(&frame)
            .map_err(|e| Error::transport(device_id, format!("malformed frame: {}", e)))?;
        if let Some(reply) = meter.handle(request) {
            self.deliver(device_id, reply, meter.reply_delay());
        }
        Ok(())
    }

    fn is_active(&self, device_id: &str) -> bool {
        self.meter(device_id)
            .is_some_and(|m| m.online.load(Ordering::Relaxed))
    }
}

impl CodecFactory for MockNetwork {
    fn create(&self, device_id: &str) -> Result<Box<dyn Codec>> {
        Ok(Box::new(MockCodec::new(device_id)))
    }
}

/// Codec for the JSON frame format of [`MockMeter`].
#[derive(Debug)]
pub struct MockCodec {
    device_id: String,
    invoke_id: u32,
}

impl MockCodec {
    /// Create a codec for `device_id`.
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            invoke_id: 0,
        }
    }

    fn next_invoke_id(&mut self) -> u32 {
        self.invoke_id = (self.invoke_id + 1) % 16;
        self.invoke_id
    }

    fn encode(request: &MockRequest) -> Result<Bytes> {
        serde_json::to_vec(request)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(e.to_string()))
    }

    fn parse(reply: &[u8]) -> Result<MockResponse> {
        serde_json::from_slice(reply).map_err(|e| Error::Codec(format!("bad reply: {}", e)))
    }
}

impl Codec for MockCodec {
    fn build_association_request(&mut self) -> Result<Bytes> {
        let invoke_id = self.next_invoke_id();
        Self::encode(&MockRequest::Associate { invoke_id })
    }

    fn parse_association_reply(&mut self, reply: &[u8]) -> Result<()> {
        match Self::parse(reply)? {
            MockResponse::Accepted { .. } => Ok(()),
            MockResponse::Rejected { reason, .. } => Err(Error::AssociationRejected {
                device_id: self.device_id.clone(),
                reason,
            }),
            other => Err(Error::Codec(format!("unexpected reply {:?}", other))),
        }
    }

    fn build_release_request(&mut self) -> Result<Bytes> {
        let invoke_id = self.next_invoke_id();
        Self::encode(&MockRequest::Release { invoke_id })
    }

    fn build_ranged_read_request(
        &mut self,
        profile: &ObisCode,
        capture_objects: &[CaptureObject],
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Bytes> {
        let invoke_id = self.next_invoke_id();
        Self::encode(&MockRequest::ReadRange {
            invoke_id,
            profile: *profile,
            columns: capture_objects.len(),
            from: from.unix_timestamp(),
            to: to.unix_timestamp(),
        })
    }

    fn build_entry_read_request(
        &mut self,
        profile: &ObisCode,
        from_entry: u32,
        to_entry: u32,
    ) -> Result<Bytes> {
        let invoke_id = self.next_invoke_id();
        Self::encode(&MockRequest::ReadEntries {
            invoke_id,
            profile: *profile,
            from_entry,
            to_entry,
        })
    }

    fn build_attribute_read_request(
        &mut self,
        class_id: u16,
        logical_name: &ObisCode,
        attribute_index: i8,
    ) -> Result<Bytes> {
        let invoke_id = self.next_invoke_id();
        Self::encode(&MockRequest::ReadAttribute {
            invoke_id,
            class_id,
            logical_name: *logical_name,
            attribute_index,
        })
    }

    fn build_continuation_request(&mut self, state: &ReplyState) -> Result<Bytes> {
        let invoke_id = self.next_invoke_id();
        Self::encode(&MockRequest::NextBlock {
            invoke_id,
            block_number: state.block_number,
        })
    }

    fn decode(&mut self, reply: &[u8]) -> Result<ReplyState> {
        match Self::parse(reply)? {
            MockResponse::Data {
                block_number,
                more,
                value,
                ..
            } => Ok(ReplyState::block(block_number, more, value)),
            MockResponse::Failure { message, .. } => Err(Error::Codec(message)),
            other => Err(Error::Codec(format!("unexpected reply {:?}", other))),
        }
    }

    fn decode_data(&self, raw: &[u8]) -> Result<Value> {
        serde_json::from_slice(raw).map_err(|e| Error::Codec(format!("bad data: {}", e)))
    }
}

/// Reads the invoke id of mock frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockTagger;

impl MockTagger {
    fn invoke_id(frame: &[u8]) -> Option<u32> {
        let doc: serde_json::Value = serde_json::from_slice(frame).ok()?;
        doc.get("invoke_id")?.as_u64().and_then(|v| u32::try_from(v).ok())
    }
}

impl FrameTagger for MockTagger {
    fn request_tag(&self, request: &[u8]) -> Option<u32> {
        Self::invoke_id(request)
    }

    fn response_tag(&self, response: &[u8]) -> Option<u32> {
        Self::invoke_id(response)
    }
}

/// Column layout of the profiles produced by
/// [`MockMeter::fill_interval_profile`]: clock, import and export registers.
pub fn interval_metadata(profile: ObisCode) -> ProfileMetadata {
    ProfileMetadata::new(
        profile,
        vec![
            CaptureObject::new(obis::CLOCK_CLASS_ID, obis::CLOCK, 2),
            CaptureObject::new(obis::REGISTER_CLASS_ID, obis::ACTIVE_ENERGY_IMPORT, 2),
            CaptureObject::new(obis::REGISTER_CLASS_ID, obis::ACTIVE_ENERGY_EXPORT, 2),
        ],
    )
}

/// Metadata provider backed by a fixed table.
#[derive(Debug, Default)]
pub struct StaticMetadata {
    profiles: HashMap<ProfileId, ProfileMetadata>,
}

impl StaticMetadata {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register metadata for a profile id (for every device).
    #[must_use]
    pub fn with_profile(
        mut self,
        profile_id: impl Into<ProfileId>,
        metadata: ProfileMetadata,
    ) -> Self {
        self.profiles.insert(profile_id.into(), metadata);
        self
    }
}

#[async_trait]
impl MetadataProvider for StaticMetadata {
    async fn resolve(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        _model: Option<&str>,
    ) -> Result<ProfileMetadata> {
        self.profiles
            .get(profile_id)
            .cloned()
            .ok_or_else(|| Error::metadata(device_id, profile_id.as_str(), "unknown profile"))
    }
}

type SeriesKey = (String, ProfileId);

/// In-memory persistence with timestamp deduplication and monotonic cursors.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    rows: Mutex<HashMap<SeriesKey, BTreeMap<OffsetDateTime, ProfileRow>>>,
    cursors: Mutex<HashMap<SeriesKey, ProfileCursor>>,
    saves: AtomicU32,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored rows of a series, oldest first.
    pub fn rows(&self, device_id: &str, profile_id: &ProfileId) -> Vec<ProfileRow> {
        lock(&self.rows)
            .get(&(device_id.to_string(), profile_id.clone()))
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Calls to `save_batch_and_advance_cursor` so far.
    pub fn save_calls(&self) -> u32 {
        self.saves.load(Ordering::Relaxed)
    }

    /// Seed a cursor directly.
    pub fn set_cursor(&self, cursor: ProfileCursor) {
        lock(&self.cursors).insert(
            (cursor.device_id.clone(), cursor.profile_id.clone()),
            cursor,
        );
    }

    fn advance(&self, key: SeriesKey, timestamp: OffsetDateTime, period: CapturePeriod) {
        let mut cursors = lock(&self.cursors);
        let cursor = cursors.entry(key.clone()).or_insert(ProfileCursor {
            device_id: key.0,
            profile_id: key.1,
            last_timestamp: timestamp,
            capture_period: period,
        });
        cursor.last_timestamp = cursor.last_timestamp.max(timestamp);
        cursor.capture_period = period;
    }
}

#[async_trait]
impl PersistencePort for MemoryPersistence {
    async fn save_batch_and_advance_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        rows: &[ProfileRow],
        capture_period: CapturePeriod,
    ) -> Result<SyncOutcome> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        let key = (device_id.to_string(), profile_id.clone());
        let previous = lock(&self.cursors).get(&key).map(|c| c.last_timestamp);

        let mut inserted = 0;
        {
            let mut all = lock(&self.rows);
            let series = all.entry(key.clone()).or_default();
            for row in rows {
                if !series.contains_key(&row.timestamp) {
                    series.insert(row.timestamp, row.clone());
                    inserted += 1;
                }
            }
        }

        let timestamps: Vec<OffsetDateTime> = rows.iter().map(|r| r.timestamp).collect();
        let outcome = SyncOutcome::compute(previous, &timestamps, inserted);
        if let Some(advance_to) = outcome.advance_to {
            self.advance(key, advance_to, capture_period);
        }
        Ok(outcome)
    }

    async fn load_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
    ) -> Result<Option<ProfileCursor>> {
        Ok(lock(&self.cursors)
            .get(&(device_id.to_string(), profile_id.clone()))
            .cloned())
    }

    async fn upsert_cursor(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        timestamp: OffsetDateTime,
        capture_period: CapturePeriod,
    ) -> Result<()> {
        self.advance(
            (device_id.to_string(), profile_id.clone()),
            timestamp,
            capture_period,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_frames_are_tagged_json() {
        let mut codec = MockCodec::new("M1");
        let request = codec.build_association_request().unwrap();
        assert_eq!(MockTagger.request_tag(&request), Some(1));
        let request = codec
            .build_attribute_read_request(8, &obis::CLOCK, 2)
            .unwrap();
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains(r#""op":"read_attribute""#));
        assert!(text.contains(r#""logical_name":"0-0:1.0.0.255""#));
        assert_eq!(MockTagger.response_tag(&ASSOCIATION_LOST_TRAILER), None);
    }

    #[test]
    fn test_meter_splits_range_reads_into_blocks() {
        let meter = MockMeter::new("M1");
        meter.fill_interval_profile(obis::LOAD_PROFILE_1, datetime!(2024-01-01 00:00 UTC), 5, 900);
        meter.set_rows_per_block(2);
        meter.associated.store(true, Ordering::Relaxed);

        let mut codec = MockCodec::new("M1");
        let mut blocks = 0;
        let mut state = {
            let request = codec
                .build_ranged_read_request(
                    &obis::LOAD_PROFILE_1,
                    &interval_metadata(obis::LOAD_PROFILE_1).capture_objects,
                    datetime!(2024-01-01 00:00 UTC),
                    datetime!(2024-01-01 01:00 UTC),
                )
                .unwrap();
            let reply = meter
                .handle(serde_json::from_slice(&request).unwrap())
                .unwrap();
            codec.decode(&reply).unwrap()
        };
        loop {
            blocks += 1;
            if !state.more {
                break;
            }
            let request = codec.build_continuation_request(&state).unwrap();
            let reply = meter
                .handle(serde_json::from_slice(&request).unwrap())
                .unwrap();
            state = codec.decode(&reply).unwrap();
        }
        assert_eq!(blocks, 3);
        assert_eq!(state.block_number, 3);
    }

    #[test]
    fn test_unassociated_meter_replies_with_trailer() {
        let meter = MockMeter::new("M1");
        let reply = meter
            .handle(MockRequest::ReadAttribute {
                invoke_id: 1,
                class_id: 8,
                logical_name: obis::CLOCK,
                attribute_index: 2,
            })
            .unwrap();
        assert_eq!(&reply[..], &ASSOCIATION_LOST_TRAILER);
    }

    #[tokio::test]
    async fn test_memory_persistence_deduplicates() {
        let store = MemoryPersistence::new();
        let profile = ProfileId::from("lp1");
        let rows = vec![
            ProfileRow::new(datetime!(2024-01-01 00:00 UTC)),
            ProfileRow::new(datetime!(2024-01-01 00:15 UTC)),
        ];
        let first = store
            .save_batch_and_advance_cursor("M1", &profile, &rows, CapturePeriod::Seconds(900))
            .await
            .unwrap();
        assert_eq!(first.inserted, 2);
        let second = store
            .save_batch_and_advance_cursor("M1", &profile, &rows, CapturePeriod::Seconds(900))
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);

        store
            .upsert_cursor(
                "M1",
                &profile,
                datetime!(2023-12-31 00:00 UTC),
                CapturePeriod::Seconds(900),
            )
            .await
            .unwrap();
        let cursor = store.load_cursor("M1", &profile).await.unwrap().unwrap();
        assert_eq!(cursor.last_timestamp, datetime!(2024-01-01 00:15 UTC));
    }
}
