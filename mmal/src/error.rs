// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for MMAL operations.
//!
//! This module defines the error returned by every fallible call of the
//! crate, mapping firmware status codes to idiomatic Rust error variants.

use crate::Buffer;

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur when talking to the firmware.
///
/// Everything except [`Error::ProtocolViolation`] is an expected condition
/// the caller can recover from (retry, resize, report upwards). A protocol
/// violation means the two sides disagree about the state of the
/// conversation; the offending message has already been dropped.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No response arrived within the configured bound.
    #[error("Timeout")]
    Timeout,

    /// The message channel failed to open, send or transfer.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The firmware does not know the named component or object.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The firmware ran out of memory or component slots.
    #[error("Resource exhausted")]
    ResourceExhausted,

    /// The firmware (or local validation) rejected a port format.
    #[error("Invalid format")]
    InvalidFormat,

    /// A parameter did not fit in the caller's buffer.
    ///
    /// `required` is the number of payload bytes the firmware needs.
    #[error("Insufficient space, {required} bytes required")]
    InsufficientSpace { required: usize },

    /// Unexpected message shape, unknown correlation id, double completion.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The operation is not legal in the current port or component state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An argument was out of range.
    #[error("Invalid argument")]
    InvalidArg,

    /// The port's buffer queue is allocated, or a reserved buffer is in use.
    #[error("Busy")]
    Busy,

    /// A firmware status code without a dedicated variant.
    #[error("Firmware returned status {0}")]
    Remote(u32),

    /// A generic error for failures not mapped to firmware status codes.
    #[error("Other error: {0}")]
    Other(String),

    /// A configuration document could not be parsed.
    #[error("Configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Converts a firmware status code to a Rust [`Result`].
    ///
    /// Call sites that give a status a more specific meaning (component
    /// creation, format negotiation, parameter sizing) match on it before
    /// falling back to this mapping.
    pub fn from_status(status: u32) -> Result<()> {
        match status {
            mmal_sys::STATUS_SUCCESS => Ok(()),
            mmal_sys::STATUS_ENOMEM | mmal_sys::STATUS_ENOSPC => Err(Error::ResourceExhausted),
            mmal_sys::STATUS_EINVAL => Err(Error::InvalidArg),
            mmal_sys::STATUS_ENOENT => Err(Error::NotFound("remote object".to_string())),
            mmal_sys::STATUS_EAGAIN => Err(Error::Busy),
            mmal_sys::STATUS_ENOTREADY => Err(Error::InvalidState("firmware not ready".to_string())),
            other => Err(Error::Remote(other)),
        }
    }

    /// Returns `false` only for protocol violations.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::ProtocolViolation(_))
    }
}

/// A buffer submission that did not reach the firmware.
///
/// Ownership of the buffer goes back to the caller together with the cause,
/// so no buffer is lost on a failed submit.
#[derive(Debug, thiserror::Error)]
#[error("Buffer submission failed: {error}")]
pub struct SubmitError {
    #[source]
    pub error: Error,
    pub buffer: Buffer,
}

impl From<SubmitError> for Error {
    fn from(value: SubmitError) -> Self {
        value.error
    }
}
