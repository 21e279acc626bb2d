//! Error types for meterlink-core.
//!
//! # Recovery strategies
//!
//! | Error Type | Strategy | Where handled |
//! |------------|----------|---------------|
//! | [`Error::AssociationLost`] | Re-associate, then retry once | [`crate::retry`] |
//! | [`Error::Timeout`] | Drain the partial buffer | [`crate::sync`] recovery path |
//! | [`Error::Transport`] | Drain the partial buffer | [`crate::sync`] recovery path |
//! | [`Error::AssociationRejected`] | Stop the cycle, retry next trigger | [`crate::sync`] |
//! | [`Error::NotConnected`] | Refuse the write, seed no cursor | [`crate::correlation`] |
//! | [`Error::RecoveryExhausted`] | Break, resume from the same cursor | [`crate::sync`] |
//! | [`Error::InvalidConfig`] | Do not retry | operator |
//!
//! The tracker never retries on its own. A caller that resends must discard
//! the previous pending request first, which [`crate::CorrelationTracker::send`]
//! does when its wait ends.
//!
//! [`ReadError`] is the failure type of a ranged profile read. It carries the
//! rows decoded before the failure so the caller can tell a partial result from
//! a complete one.

use std::time::Duration;

use meterlink_types::ProfileRow;
use thiserror::Error;

/// Errors raised by the acquisition core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The reply carried the association-lost trailer. The session has been
    /// removed and must be re-established.
    #[error("Association lost with device {device_id}")]
    AssociationLost {
        /// Device serial.
        device_id: String,
    },

    /// No response within the initial and late-listen windows.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// Combined wait (initial + late listen).
        duration: Duration,
    },

    /// The transport could not deliver a frame.
    #[error("Transport error for device {device_id}: {message}")]
    Transport {
        /// Device serial.
        device_id: String,
        /// Transport-specific message.
        message: String,
    },

    /// The transport has no active channel for the device.
    #[error("Device {0} is not connected")]
    NotConnected(String),

    /// The codec rejected a frame or could not build a request.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The meter refused the association request.
    #[error("Association rejected by device {device_id}: {reason}")]
    AssociationRejected {
        /// Device serial.
        device_id: String,
        /// Reason reported by the codec.
        reason: String,
    },

    /// Profile metadata could not be resolved.
    #[error("Metadata unavailable for {device_id}/{profile_id}: {message}")]
    Metadata {
        /// Device serial.
        device_id: String,
        /// Profile identifier.
        profile_id: String,
        /// Provider message.
        message: String,
    },

    /// The persistence collaborator failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The wait was cancelled because the pending request was discarded or
    /// replaced.
    #[error("Request cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A read failed and the partial buffer held nothing to salvage.
    #[error("Recovery exhausted for {device_id}/{profile_id}")]
    RecoveryExhausted {
        /// Device serial.
        device_id: String,
        /// Profile identifier.
        profile_id: String,
    },

    /// A ranged read aborted after too many blocks.
    #[error("Block limit of {limit} exceeded")]
    BlockLimitExceeded {
        /// Configured maximum.
        limit: u32,
    },

    /// Data could not be interpreted.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create an association-lost error.
    pub fn association_lost(device_id: impl Into<String>) -> Self {
        Self::AssociationLost {
            device_id: device_id.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(device_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            device_id: device_id.into(),
            message: message.into(),
        }
    }

    /// Create a metadata error.
    pub fn metadata(
        device_id: impl Into<String>,
        profile_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Metadata {
            device_id: device_id.into(),
            profile_id: profile_id.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Short, stable label used as the failure reason in metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Error::AssociationLost { .. } => "association_lost",
            Error::Timeout { .. } => "timeout",
            Error::Transport { .. } => "transport",
            Error::NotConnected(_) => "not_connected",
            Error::Codec(_) => "codec",
            Error::AssociationRejected { .. } => "association_rejected",
            Error::Metadata { .. } => "metadata",
            Error::Persistence(_) => "persistence",
            Error::Cancelled => "cancelled",
            Error::InvalidConfig(_) => "invalid_config",
            Error::RecoveryExhausted { .. } => "recovery_failed",
            Error::BlockLimitExceeded { .. } => "block_limit",
            Error::InvalidData(_) => "invalid_data",
        }
    }

    /// Whether the device could not be reached or stopped answering, as
    /// opposed to answering with something unusable.
    #[must_use]
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::AssociationLost { .. }
                | Error::Timeout { .. }
                | Error::Transport { .. }
                | Error::NotConnected(_)
                | Error::AssociationRejected { .. }
                | Error::Cancelled
        )
    }
}

impl From<meterlink_types::ParseError> for Error {
    fn from(err: meterlink_types::ParseError) -> Self {
        Error::InvalidData(err.to_string())
    }
}

/// Result type alias using meterlink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a ranged profile read.
///
/// `salvaged` holds the rows decoded from the frames that arrived before
/// `cause`; it is empty when the read failed on its first frame.
#[derive(Debug, Error)]
#[error("Read failed after salvaging {} rows: {cause}", salvaged.len())]
pub struct ReadError {
    /// What ended the read.
    #[source]
    pub cause: Error,
    /// Rows decoded before the failure.
    pub salvaged: Vec<ProfileRow>,
}

impl ReadError {
    /// A read error with no salvaged rows.
    pub fn new(cause: Error) -> Self {
        Self {
            cause,
            salvaged: Vec::new(),
        }
    }

    /// A read error carrying salvaged rows.
    pub fn with_salvage(cause: Error, salvaged: Vec<ProfileRow>) -> Self {
        Self { cause, salvaged }
    }
}

impl From<Error> for ReadError {
    fn from(cause: Error) -> Self {
        Self::new(cause)
    }
}
