//! Multi-block ranged profile reads.
//!
//! A ranged read is answered in one or more blocks. The [`BlockAssembler`]
//! sends the initial request, then asks for the next block until the meter
//! reports no more data. Rows decoded from every block are appended to a
//! partial buffer keyed by (device, profile):
//!
//! - On success the whole buffer is returned and the partial buffer cleared.
//! - On failure the rows decoded so far are returned inside a [`ReadError`]
//!   and the partial buffer is kept, so [`BlockAssembler::drain_partial`] can
//!   recover it later.
//!
//! Every new read clears the partial buffer of its key before sending.

use std::sync::Arc;

use dashmap::DashMap;
use meterlink_types::{ProfileId, ProfileRow, ReplyState, obis};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{Error, ReadError, Result};
use crate::normalize::{normalize, to_profile_rows};
use crate::session::{DeviceSession, SessionManager};
use crate::traits::ProfileMetadata;

/// Default limit on blocks per read.
pub const DEFAULT_MAX_BLOCKS: u32 = 1024;

type PartialKey = (String, ProfileId);

/// Drives block transfers and keeps partial buffers.
pub struct BlockAssembler {
    sessions: Arc<SessionManager>,
    partials: DashMap<PartialKey, Vec<ProfileRow>>,
    max_blocks: u32,
}

impl BlockAssembler {
    /// Create an assembler on top of `sessions`.
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            partials: DashMap::new(),
            max_blocks: DEFAULT_MAX_BLOCKS,
        }
    }

    /// Abort reads that need more than `max_blocks` blocks.
    #[must_use]
    pub fn with_max_blocks(mut self, max_blocks: u32) -> Self {
        self.max_blocks = max_blocks.max(1);
        self
    }

    /// The session manager reads go through.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Read the profile records captured within `[from, to]`.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] carrying the rows decoded before the failure.
    pub async fn read_range(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        metadata: &ProfileMetadata,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> std::result::Result<Vec<ProfileRow>, ReadError> {
        let key = (device_id.to_string(), profile_id.clone());
        if let Some((_, stale)) = self.partials.remove(&key)
            && !stale.is_empty()
        {
            debug!(
                "Discarding {} unconsumed partial rows for {}/{}",
                stale.len(),
                device_id,
                profile_id
            );
        }

        let session = self
            .sessions
            .get_or_create_session(device_id)
            .await
            .map_err(ReadError::new)?;

        debug!(%from, %to, "Reading {} from {}", profile_id, device_id);
        let first = self
            .sessions
            .transact(&session, |codec| {
                codec.build_ranged_read_request(
                    &metadata.logical_name,
                    &metadata.capture_objects,
                    from,
                    to,
                )
            })
            .await;

        let result = match first {
            Ok(state) => {
                self.transfer(&session, state, metadata, |rows| {
                    self.partials.entry(key.clone()).or_default().extend(rows);
                })
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(blocks) => {
                let rows = self
                    .partials
                    .remove(&key)
                    .map(|(_, rows)| rows)
                    .unwrap_or_default();
                debug!(
                    blocks,
                    rows = rows.len(),
                    "Read of {} from {} complete",
                    profile_id,
                    device_id
                );
                Ok(rows)
            }
            Err(cause) => {
                let salvaged = self
                    .partials
                    .get(&key)
                    .map(|rows| rows.clone())
                    .unwrap_or_default();
                info!(
                    salvaged = salvaged.len(),
                    "Read of {} from {} failed: {}",
                    profile_id,
                    device_id,
                    cause
                );
                Err(ReadError::with_salvage(cause, salvaged))
            }
        }
    }

    /// Follow a block transfer to its end, handing decoded rows to `sink`
    /// after every block. Returns the number of blocks received.
    async fn transfer<F>(
        &self,
        session: &DeviceSession,
        mut state: ReplyState,
        metadata: &ProfileMetadata,
        mut sink: F,
    ) -> Result<u32>
    where
        F: FnMut(Vec<ProfileRow>),
    {
        let mut blocks = 0u32;
        loop {
            blocks += 1;
            let rows = decode_rows(session, &state, metadata).await;
            debug!(
                block = state.block_number,
                rows = rows.len(),
                more = state.more,
                "Block received"
            );
            sink(rows);

            if !state.more {
                return Ok(blocks);
            }
            if blocks >= self.max_blocks {
                return Err(Error::BlockLimitExceeded {
                    limit: self.max_blocks,
                });
            }
            let previous = state;
            state = self
                .sessions
                .transact(session, |codec| codec.build_continuation_request(&previous))
                .await?;
        }
    }

    /// Take the partial buffer of an interrupted read, leaving it empty.
    pub fn drain_partial(&self, device_id: &str, profile_id: &ProfileId) -> Vec<ProfileRow> {
        self.partials
            .remove(&(device_id.to_string(), profile_id.clone()))
            .map(|(_, rows)| rows)
            .unwrap_or_default()
    }

    /// Rows currently held for (device, profile).
    pub fn partial_len(&self, device_id: &str, profile_id: &ProfileId) -> usize {
        self.partials
            .get(&(device_id.to_string(), profile_id.clone()))
            .map_or(0, |rows| rows.len())
    }

    /// Read the capture period attribute of a profile, in seconds.
    pub async fn read_capture_period(
        &self,
        device_id: &str,
        metadata: &ProfileMetadata,
    ) -> Result<u64> {
        let session = self.sessions.get_or_create_session(device_id).await?;
        let state = self
            .sessions
            .transact(&session, |codec| {
                codec.build_attribute_read_request(
                    obis::PROFILE_GENERIC_CLASS_ID,
                    &metadata.logical_name,
                    obis::ATTR_CAPTURE_PERIOD,
                )
            })
            .await?;
        state
            .value
            .as_ref()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                Error::InvalidData(format!(
                    "capture period of {} is not an unsigned value: {:?}",
                    metadata.logical_name, state.value
                ))
            })
    }

    /// Read the oldest record held by the device.
    pub async fn read_first_entry(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        metadata: &ProfileMetadata,
    ) -> Result<Option<ProfileRow>> {
        let session = self.sessions.get_or_create_session(device_id).await?;
        let first = self
            .sessions
            .transact(&session, |codec| {
                codec.build_entry_read_request(&metadata.logical_name, 1, 1)
            })
            .await?;
        let mut rows = Vec::new();
        self.transfer(&session, first, metadata, |decoded| rows.extend(decoded))
            .await?;
        let first_row = rows.into_iter().min_by_key(|row| row.timestamp);
        debug!(
            first = ?first_row.as_ref().map(|r| r.timestamp),
            "First entry of {} on {}", profile_id, device_id
        );
        Ok(first_row)
    }
}

async fn decode_rows(
    session: &DeviceSession,
    state: &ReplyState,
    metadata: &ProfileMetadata,
) -> Vec<ProfileRow> {
    let Some(value) = state.value.as_ref() else {
        return Vec::new();
    };
    let codec = session.codec().await;
    let redecode = |raw: &[u8]| codec.decode_data(raw);
    let normalized = normalize(value, metadata.column_count(), Some(&redecode));
    if normalized.strategy.is_anomaly() {
        debug!(
            strategy = ?normalized.strategy,
            "Unexpected buffer shape from {}",
            session.device_id()
        );
    }
    to_profile_rows(normalized.rows, &metadata.capture_objects)
}
