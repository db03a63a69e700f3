// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration of an [`crate::Instance`] and [`crate::AudioService`].
//!
//! All tunables travel in a [`Config`] handed over at construction time. The
//! structure deserialises from JSON with every field optional, so a
//! configuration file only needs to name what it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tunables of the protocol engine.
///
/// # Examples
///
/// ```
/// use mmal::config::Config;
///
/// # fn main() -> Result<(), mmal::Error> {
/// let config = Config::from_json(r#"{ "request_timeout_ms": 500, "zero_copy": false }"#)?;
/// assert_eq!(config.request_timeout().as_millis(), 500);
/// assert_eq!(config.max_pending_requests, 8);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bound on one synchronous control request.
    pub request_timeout_ms: u64,
    /// Bound on one drain interval of a port disable.
    pub drain_timeout_ms: u64,
    /// Number of correlation slots (1..=255).
    pub max_pending_requests: usize,
    /// Share buffer memory with the firmware instead of copying payloads.
    pub zero_copy: bool,
    /// Payloads up to this size travel inside the buffer message when not zero-copy.
    pub max_inline_payload: usize,
    /// Audio: always move sample data with a bulk transfer.
    pub force_bulk: bool,
    /// Bound on one audio service request.
    pub audio_request_timeout_ms: u64,
    /// Audio: largest inline data packet.
    pub audio_max_packet: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3000,
            drain_timeout_ms: 1000,
            max_pending_requests: 8,
            zero_copy: true,
            max_inline_payload: mmal_sys::SHORT_DATA_SIZE,
            force_bulk: false,
            audio_request_timeout_ms: 10_000,
            audio_max_packet: 4000,
        }
    }
}

impl Config {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on malformed JSON and [`Error::InvalidArg`]
    /// when a value is out of range.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field against its legal range.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0
            || self.drain_timeout_ms == 0
            || self.audio_request_timeout_ms == 0
            || self.max_pending_requests == 0
            || self.max_pending_requests > 255
            || self.max_inline_payload > mmal_sys::SHORT_DATA_SIZE
            || self.audio_max_packet == 0
        {
            return Err(Error::InvalidArg);
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn audio_request_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config = Config::from_json(r#"{ "drain_timeout_ms": 20 }"#).unwrap();
        assert_eq!(config.drain_timeout(), Duration::from_millis(20));
        assert_eq!(config.request_timeout_ms, 3000);
        assert!(config.zero_copy);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(matches!(
            Config::from_json(r#"{ "max_pending_requests": 300 }"#),
            Err(Error::InvalidArg)
        ));
        assert!(matches!(
            Config::from_json(r#"{ "max_inline_payload": 4096 }"#),
            Err(Error::InvalidArg)
        ));
        assert!(matches!(Config::from_json("{ nope"), Err(Error::Config(_))));
    }
}
